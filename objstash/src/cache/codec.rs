//! Object-id path encoding and filename handling.
//!
//! An object id is rendered as nine characters from a 64-symbol
//! alphabet, six bits per character.  The most significant character
//! names a container directory beneath the type directory and the
//! remaining eight form the filename stem:
//!
//! ```text
//! <base>/<type>/<c0>/<c1..c8><.ext>
//! ```
//!
//! Decoding is total: any path that does not match the layout yields
//! id zero rather than an error.

use crate::cache::store;
use crate::cache::types::{CacheError, ObjectId, BLOCK_SIZE, DIR_MODE};
use std::path::{Path, PathBuf};

/// Encoding alphabet; a character's index is its six-bit value.
pub const ID_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Encoded characters per object id.
pub const NUM_CHARS: usize = 9;

/// Leading encoded characters that form the container directory.
pub const DIR_CHARS: usize = 1;

const CHAR_BITS: usize = 6;
const CHAR_MASK: u64 = 0x3f;

/// The six-bit group `n` of `id`, rendered as its alphabet character.
/// Group 0 is the least significant.
fn encoded_char(id: ObjectId, n: usize) -> u8 {
    let index = (id >> (n * CHAR_BITS)) & CHAR_MASK;
    ID_ALPHABET[index as usize]
}

/// The six-bit value of an alphabet character, or `None` for any byte
/// outside the alphabet.
fn char_value(c: u8) -> Option<u64> {
    ID_ALPHABET.iter().position(|&a| a == c).map(|i| i as u64)
}

/// Construct the full pathname for an object id.
///
/// The original filename contributes only its extension.  With
/// `create_dir` the container directory is created mode 0770 (an
/// existing directory is fine).
///
/// # Example
///
/// ```
/// use std::path::{Path, PathBuf};
/// use objstash::cache::codec::build_pathname;
///
/// let path =
///     build_pathname(Path::new("/cache"), "thumbs", 4538775134664, "photo.jpg", false).unwrap();
/// assert_eq!(path, PathBuf::from("/cache/thumbs/A/BCDEFGHI.jpg"));
/// ```
pub fn build_pathname(
    base: &Path,
    type_name: &str,
    id: ObjectId,
    filename: &str,
    create_dir: bool,
) -> Result<PathBuf, CacheError> {
    if id == 0 {
        return Err(CacheError::InvalidId);
    }

    let mut dir_stem = String::with_capacity(DIR_CHARS);
    for n in ((NUM_CHARS - DIR_CHARS)..NUM_CHARS).rev() {
        dir_stem.push(encoded_char(id, n) as char);
    }
    let container = base.join(type_name).join(dir_stem);

    if create_dir {
        store::create_dir(&container, DIR_MODE)?;
    }

    let mut stem = String::with_capacity(NUM_CHARS - DIR_CHARS);
    for n in (0..(NUM_CHARS - DIR_CHARS)).rev() {
        stem.push(encoded_char(id, n) as char);
    }
    if let Some(ext) = file_extension(filename) {
        stem.push_str(ext);
    }

    Ok(container.join(stem))
}

/// Recover the object id from a pathname.
///
/// Works back from the last `.` (or the end of the path) across the
/// nine encoded characters, requiring the container-directory `/` in
/// its canonical position.  Returns 0 for anything malformed.
pub fn object_id_from_path(path: &Path) -> ObjectId {
    let Some(s) = path.to_str() else {
        return 0;
    };
    let bytes = s.as_bytes();
    let end = s.rfind('.').unwrap_or(bytes.len());
    let Some(start) = end.checked_sub(NUM_CHARS + 1) else {
        return 0;
    };

    let mut id: ObjectId = 0;
    let mut consumed = 0usize;
    let mut delimited = false;
    for &b in &bytes[start..end] {
        if b == b'/' {
            if consumed != DIR_CHARS {
                return 0;
            }
            delimited = true;
        } else {
            let Some(value) = char_value(b) else {
                return 0;
            };
            if consumed >= NUM_CHARS {
                return 0;
            }
            id += value << ((NUM_CHARS - 1 - consumed) * CHAR_BITS);
            consumed += 1;
        }
    }

    if !delimited || consumed != NUM_CHARS {
        return 0;
    }
    id
}

/// The type name is the first path segment beneath the cache base
/// directory.  There must be at least one further segment below it.
pub fn type_name_from_path(base: &Path, path: &Path) -> Option<String> {
    let rest = path.strip_prefix(base).ok()?;
    let mut components = rest.components();
    let first = components.next()?;
    components.next()?;
    Some(first.as_os_str().to_str()?.to_string())
}

/// The extension of `name` including the leading `.`, or `None` when
/// the last `.`/`/` is a slash (or absent).
pub fn file_extension(name: &str) -> Option<&str> {
    let pos = name.rfind(['.', '/'])?;
    if name.as_bytes()[pos] == b'.' {
        Some(&name[pos..])
    } else {
        None
    }
}

/// The part of `name` before the extension returned by
/// [`file_extension`], without the trailing `.`.
pub fn file_basename(name: &str) -> Option<&str> {
    let pos = name.rfind(['.', '/'])?;
    if name.as_bytes()[pos] == b'.' {
        Some(&name[..pos])
    } else {
        None
    }
}

/// The size an object accounts for on disk: rounded up to a whole
/// block, plus one reserve block for extended-attribute storage.
/// Zero-byte objects still account for two blocks.
pub fn filesystem_file_size(size: u64) -> u64 {
    let blocks = if size > 0 {
        size.div_ceil(BLOCK_SIZE)
    } else {
        1
    };
    blocks * BLOCK_SIZE + BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphabet_has_64_distinct_symbols() {
        let mut seen = std::collections::HashSet::new();
        for &c in ID_ALPHABET.iter() {
            assert!(seen.insert(c), "duplicate alphabet symbol {}", c as char);
            assert!(c != b'/' && c != b'.', "unsafe alphabet symbol");
        }
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn build_pathname_known_vector() {
        let path =
            build_pathname(Path::new("/cache"), "t", 4538775134664, "anything.ext", false).unwrap();
        assert_eq!(path, PathBuf::from("/cache/t/A/BCDEFGHI.ext"));
    }

    #[test]
    fn decode_known_vector() {
        assert_eq!(
            object_id_from_path(Path::new("/cache/t/A/BCDEFGHI.ext")),
            4538775134664
        );
    }

    #[test]
    fn build_pathname_rejects_id_zero() {
        let result = build_pathname(Path::new("/cache"), "t", 0, "a.ext", false);
        assert!(matches!(result, Err(CacheError::InvalidId)));
    }

    #[test]
    fn build_pathname_without_extension() {
        let path = build_pathname(Path::new("/cache"), "t", 1, "plainfile", false).unwrap();
        assert_eq!(path, PathBuf::from("/cache/t/A/AAAAAAAB"));
    }

    #[test]
    fn roundtrip_across_id_range() {
        let base = Path::new("/cache");
        for id in [
            1u64,
            63,
            64,
            0x3f_ffff,
            0x40_0000,
            (0xdead_beefu64 << 22) | 1234,
            (u32::MAX as u64) << 22 | 0x3f_ffff,
        ] {
            let path = build_pathname(base, "images", id, "f.jpg", false).unwrap();
            assert_eq!(object_id_from_path(&path), id, "id {id} did not round-trip");
            assert_eq!(
                type_name_from_path(base, &path).as_deref(),
                Some("images"),
                "type for id {id}"
            );
        }
    }

    #[test]
    fn decode_rejects_wrong_segment_length() {
        // Seven stem characters instead of eight.
        assert_eq!(object_id_from_path(Path::new("/cache/t/A/BCDEFGH.ext")), 0);
        // Slash in the wrong position.
        assert_eq!(object_id_from_path(Path::new("/cache/t/AB/CDEFGHI.ext")), 0);
    }

    #[test]
    fn decode_rejects_foreign_characters() {
        assert_eq!(object_id_from_path(Path::new("/cache/t/A/BCDEF*HI.ext")), 0);
    }

    #[test]
    fn decode_rejects_short_paths() {
        assert_eq!(object_id_from_path(Path::new("short")), 0);
        assert_eq!(object_id_from_path(Path::new("")), 0);
    }

    #[test]
    fn decode_ignores_extension_contents() {
        let with_ext = object_id_from_path(Path::new("/cache/t/A/BCDEFGHI.jpeg"));
        let without = object_id_from_path(Path::new("/cache/t/A/BCDEFGHI"));
        assert_eq!(with_ext, without);
        assert_ne!(with_ext, 0);
    }

    #[test]
    fn type_name_requires_segment_below_type() {
        let base = Path::new("/cache");
        assert_eq!(
            type_name_from_path(base, Path::new("/cache/t/A/BCDEFGHI.ext")).as_deref(),
            Some("t")
        );
        assert_eq!(type_name_from_path(base, Path::new("/cache/t")), None);
        assert_eq!(type_name_from_path(base, Path::new("/elsewhere/t/x")), None);
    }

    #[test]
    fn extension_and_basename_split() {
        assert_eq!(file_extension("photo.jpg"), Some(".jpg"));
        assert_eq!(file_basename("photo.jpg"), Some("photo"));
        assert_eq!(file_extension("archive.tar.gz"), Some(".gz"));
        assert_eq!(file_basename("archive.tar.gz"), Some("archive.tar"));
        assert_eq!(file_extension("noext"), None);
        assert_eq!(file_basename("noext"), None);
        // A slash after the last dot defeats the extension.
        assert_eq!(file_extension("dir.d/file"), None);
        assert_eq!(file_basename("dir.d/file"), None);
    }

    #[test]
    fn filesystem_size_rounds_up_and_reserves_a_block() {
        assert_eq!(filesystem_file_size(0), 2 * BLOCK_SIZE);
        assert_eq!(filesystem_file_size(1), 2 * BLOCK_SIZE);
        assert_eq!(filesystem_file_size(BLOCK_SIZE), 2 * BLOCK_SIZE);
        assert_eq!(filesystem_file_size(BLOCK_SIZE + 1), 3 * BLOCK_SIZE);
        assert_eq!(filesystem_file_size(10 * BLOCK_SIZE), 11 * BLOCK_SIZE);
    }

    #[test]
    fn create_dir_flag_makes_the_container() {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = tmp.path().join("cache");
        std::fs::create_dir_all(base.join("t")).unwrap();

        let path = build_pathname(&base, "t", 4538775134664, "a.bin", true).unwrap();
        assert!(path.parent().unwrap().is_dir());
        // Idempotent when the container already exists.
        build_pathname(&base, "t", 4538775134664, "a.bin", true).unwrap();
    }
}
