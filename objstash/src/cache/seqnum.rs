//! Persistence of the object-id sequence counter.
//!
//! The counter supplies the low [`SEQ_BITS`](crate::cache::types::SEQ_BITS)
//! bits of every object id.  On open the persisted value is advanced by
//! a whole reserve interval before any allocation, so ids handed out
//! before a crash can never be reissued by the restarted process.

use crate::cache::store;
use crate::cache::types::{MAX_SEQ_NUM, SEQ_BUMP, SEQ_NUM_FILENAME};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct SequenceNumber {
    file_path: PathBuf,
    value: u64,
}

impl SequenceNumber {
    /// Load the sequence file beneath `base_dir`, reserve the next
    /// interval and write the reservation back.  A missing or
    /// unreadable file starts the counter at 1.
    pub fn open(base_dir: &Path) -> Self {
        let file_path = base_dir.join(SEQ_NUM_FILENAME);

        let mut value = match fs::read_to_string(&file_path) {
            Ok(contents) => {
                let read = contents.trim().parse::<u64>().unwrap_or(0);
                debug!(read, bump = SEQ_BUMP, "loaded sequence number");
                read.saturating_add(SEQ_BUMP)
            }
            Err(_) => 1,
        };
        if value < 1 || value > MAX_SEQ_NUM {
            debug!("sequence number roll-over observed");
            value = 1;
        }

        let seq = Self { file_path, value };
        seq.persist();
        info!(value = seq.value, "beginning with sequence number");
        seq
    }

    pub fn current(&self) -> u64 {
        self.value
    }

    /// Step the counter, rewriting the file at every reserve-interval
    /// boundary and on roll-over.
    pub fn advance(&mut self) {
        self.value += 1;
        if self.value > MAX_SEQ_NUM {
            self.value = 1;
            self.persist();
        } else if self.value % SEQ_BUMP == 0 {
            self.persist();
        }
    }

    fn persist(&self) {
        let contents = format!("{}\n", self.value);
        if let Err(e) = store::write_atomic(&self.file_path, &contents) {
            error!(path = %self.file_path.display(), error = %e, "failed to write sequence number");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_directory_starts_at_one() {
        let tmp = TempDir::new().unwrap();
        let seq = SequenceNumber::open(tmp.path());
        assert_eq!(seq.current(), 1);
        assert!(tmp.path().join(SEQ_NUM_FILENAME).is_file());
    }

    #[test]
    fn reopen_reserves_a_fresh_interval() {
        let tmp = TempDir::new().unwrap();
        let mut seq = SequenceNumber::open(tmp.path());
        for _ in 0..5 {
            seq.advance();
        }
        let last = seq.current();
        drop(seq);

        let seq = SequenceNumber::open(tmp.path());
        assert!(
            seq.current() > last,
            "restarted counter {} must exceed pre-crash value {}",
            seq.current(),
            last
        );
    }

    #[test]
    fn persisted_value_includes_the_reserve() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(SEQ_NUM_FILENAME), "500\n").unwrap();

        let seq = SequenceNumber::open(tmp.path());
        assert_eq!(seq.current(), 500 + SEQ_BUMP);
        let persisted: u64 = std::fs::read_to_string(tmp.path().join(SEQ_NUM_FILENAME))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(persisted, 500 + SEQ_BUMP);
    }

    #[test]
    fn wraps_past_the_maximum() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(SEQ_NUM_FILENAME),
            format!("{}\n", MAX_SEQ_NUM),
        )
        .unwrap();

        let seq = SequenceNumber::open(tmp.path());
        assert_eq!(seq.current(), 1);
    }

    #[test]
    fn advance_persists_on_interval_boundary() {
        let tmp = TempDir::new().unwrap();
        let mut seq = SequenceNumber::open(tmp.path());

        while seq.current() % SEQ_BUMP != 0 {
            seq.advance();
        }
        let persisted: u64 = std::fs::read_to_string(tmp.path().join(SEQ_NUM_FILENAME))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(persisted, seq.current());
    }

    #[test]
    fn garbage_file_starts_at_one_plus_reserve() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(SEQ_NUM_FILENAME), "not a number\n").unwrap();

        let seq = SequenceNumber::open(tmp.path());
        assert_eq!(seq.current(), SEQ_BUMP);
    }
}
