//! The service boundary end to end: named operations in, replies out.

use objstash::cache::set::CacheSet;
use objstash::cache::store;
use objstash::cache::types::BLOCK_SIZE;
use objstash::service::{
    Dispatched, ErrorCode, Request, Response, Router, SubscriptionRegistry, Success,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const TOTAL: u64 = 10_000_000;

fn make_router(tmp: &TempDir) -> Router {
    let set = CacheSet::new(&tmp.path().join("cache"), TOTAL).unwrap();
    Router::new(
        Arc::new(Mutex::new(set)),
        SubscriptionRegistry::new(),
        tmp.path().join("downloads"),
    )
}

fn define_type(name: &str, dir_type: bool) -> Request {
    Request::DefineType {
        type_name: name.to_string(),
        lo_watermark: 10_000,
        hi_watermark: 2_000_000,
        size: 100,
        cost: 10,
        lifetime: 1,
        dir_type,
    }
}

fn error_code(response: &Response) -> ErrorCode {
    match response {
        Response::Error(e) => e.code,
        other => panic!("expected error, got {other:?}"),
    }
}

fn inserted_path(dispatched: &Dispatched) -> PathBuf {
    match &dispatched.response {
        Response::Success(Success::Inserted { path_name, .. }) => PathBuf::from(path_name),
        other => panic!("expected Inserted reply, got {other:?}"),
    }
}

#[tokio::test]
async fn define_type_watermark_validation() {
    let tmp = TempDir::new().unwrap();
    let router = make_router(&tmp);

    let ok = router.dispatch(define_type("t", false), false).await;
    assert!(ok.response.is_success());

    // Zero low watermark is rejected up front.
    let rejected = router
        .dispatch(
            Request::DefineType {
                type_name: "t2".to_string(),
                lo_watermark: 0,
                hi_watermark: 20_000,
                size: 100,
                cost: 1,
                lifetime: 1,
                dir_type: false,
            },
            false,
        )
        .await;
    assert_eq!(error_code(&rejected.response), ErrorCode::InvalidParams);

    // And so is an inverted watermark pair.
    let inverted = router
        .dispatch(
            Request::DefineType {
                type_name: "t3".to_string(),
                lo_watermark: 20_000,
                hi_watermark: 10_000,
                size: 0,
                cost: 0,
                lifetime: 0,
                dir_type: false,
            },
            false,
        )
        .await;
    assert_eq!(error_code(&inverted.response), ErrorCode::InvalidParams);

    // Redefining an existing type reports Exists.
    let duplicate = router.dispatch(define_type("t", false), false).await;
    assert_eq!(error_code(&duplicate.response), ErrorCode::Exists);
}

#[tokio::test]
async fn write_window_exclusivity_and_finalise() {
    let tmp = TempDir::new().unwrap();
    let router = make_router(&tmp);
    router.dispatch(define_type("t", false), false).await;

    let inserted = router
        .dispatch(
            Request::InsertCacheObject {
                type_name: "t".to_string(),
                file_name: "a.ext".to_string(),
                size: 123,
                cost: 0,
                lifetime: 0,
                subscribe: true,
            },
            false,
        )
        .await;
    let path = inserted_path(&inserted);
    assert!(inserted.subscription.is_some());
    match &inserted.response {
        Response::Success(Success::Inserted { subscribed, .. }) => {
            assert_eq!(*subscribed, Some(true));
        }
        other => panic!("unexpected reply {other:?}"),
    }

    // A second subscriber is locked out of the write window.
    let second = router
        .dispatch(
            Request::SubscribeCacheObject {
                path_name: path.to_string_lossy().into_owned(),
                subscribe: true,
            },
            false,
        )
        .await;
    match &second.response {
        Response::Error(e) => {
            assert_eq!(e.code, ErrorCode::Exists);
            assert!(e.text.contains("only one writer"), "text: {}", e.text);
        }
        other => panic!("expected exclusivity error, got {other:?}"),
    }

    // Write less than declared, then cancel the subscription.
    fs::write(&path, vec![7u8; 50]).unwrap();
    drop(inserted);

    // Declared size clamped, attribute w=1, permissions read-only.
    let size_reply = router
        .dispatch(
            Request::GetCacheObjectSize {
                path_name: path.to_string_lossy().into_owned(),
            },
            false,
        )
        .await;
    assert_eq!(
        size_reply.response,
        Response::Success(Success::ObjectSize { size: 50 })
    );
    assert_eq!(store::get_xattr_u32(&path, "user.w").unwrap(), 1);
    let mode = fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o222, 0, "file must be read-only after finalise");
}

#[tokio::test]
async fn dir_type_requires_privilege_and_expires_on_release() {
    let tmp = TempDir::new().unwrap();
    let router = make_router(&tmp);

    // Unprivileged callers may not create directory types.
    let refused = router.dispatch(define_type("d", true), false).await;
    assert_eq!(error_code(&refused.response), ErrorCode::InvalidParams);

    let defined = router.dispatch(define_type("d", true), true).await;
    assert!(defined.response.is_success());

    let inserted = router
        .dispatch(
            Request::InsertCacheObject {
                type_name: "d".to_string(),
                file_name: "bundle".to_string(),
                size: (3 * BLOCK_SIZE) as i64,
                cost: 0,
                lifetime: 0,
                subscribe: true,
            },
            false,
        )
        .await;
    let path = inserted_path(&inserted);
    assert!(path.is_dir());
    fs::write(path.join("member"), b"payload").unwrap();

    // Releasing the subscription expires the single-shot object; the
    // periodic cleaner purges it.
    drop(inserted);
    assert!(path.exists());
    router.shared_set().lock().unwrap().cleanup_dir_types();
    assert!(!path.exists());
}

#[tokio::test]
async fn dir_type_insert_requires_more_than_one_block() {
    let tmp = TempDir::new().unwrap();
    let router = make_router(&tmp);
    router.dispatch(define_type("d", true), true).await;

    let too_small = router
        .dispatch(
            Request::InsertCacheObject {
                type_name: "d".to_string(),
                file_name: "bundle".to_string(),
                size: (2 * BLOCK_SIZE) as i64,
                cost: 0,
                lifetime: 0,
                subscribe: false,
            },
            false,
        )
        .await;
    assert_eq!(error_code(&too_small.response), ErrorCode::InvalidParams);
}

#[tokio::test]
async fn resize_succeeds_in_window_and_fails_after() {
    let tmp = TempDir::new().unwrap();
    let router = make_router(&tmp);
    router.dispatch(define_type("t", false), false).await;

    let inserted = router
        .dispatch(
            Request::InsertCacheObject {
                type_name: "t".to_string(),
                file_name: "grow.bin".to_string(),
                size: 1000,
                cost: 0,
                lifetime: 0,
                subscribe: true,
            },
            false,
        )
        .await;
    let path = inserted_path(&inserted);
    let path_name = path.to_string_lossy().into_owned();

    let resized = router
        .dispatch(
            Request::ResizeCacheObject {
                path_name: path_name.clone(),
                new_size: 5000,
            },
            false,
        )
        .await;
    assert_eq!(
        resized.response,
        Response::Success(Success::Resized { new_size: 5000 })
    );

    fs::write(&path, vec![0u8; 5000]).unwrap();
    drop(inserted);

    // The write window is closed: further resizes are refused.
    let refused = router
        .dispatch(
            Request::ResizeCacheObject {
                path_name: path_name.clone(),
                new_size: 9000,
            },
            false,
        )
        .await;
    assert_eq!(error_code(&refused.response), ErrorCode::Resize);

    let zero = router
        .dispatch(
            Request::ResizeCacheObject {
                path_name,
                new_size: 0,
            },
            false,
        )
        .await;
    assert_eq!(error_code(&zero.response), ErrorCode::InvalidParams);
}

#[tokio::test]
async fn expire_is_idempotent_for_well_formed_paths() {
    let tmp = TempDir::new().unwrap();
    let router = make_router(&tmp);
    router.dispatch(define_type("t", false), false).await;

    let inserted = router
        .dispatch(
            Request::InsertCacheObject {
                type_name: "t".to_string(),
                file_name: "a.ext".to_string(),
                size: 100,
                cost: 0,
                lifetime: 0,
                subscribe: false,
            },
            false,
        )
        .await;
    let path_name = inserted_path(&inserted).to_string_lossy().into_owned();

    let first = router
        .dispatch(
            Request::ExpireCacheObject {
                path_name: path_name.clone(),
            },
            false,
        )
        .await;
    assert!(first.response.is_success());

    // The object is gone but the cache state satisfies the request.
    let second = router
        .dispatch(Request::ExpireCacheObject { path_name }, false)
        .await;
    assert!(second.response.is_success());

    // A path that never decoded to an id reports Exists.
    let garbage = router
        .dispatch(
            Request::ExpireCacheObject {
                path_name: "/not/a/cache/path".to_string(),
            },
            false,
        )
        .await;
    assert_eq!(error_code(&garbage.response), ErrorCode::Exists);
}

#[tokio::test]
async fn expire_of_pinned_object_reports_in_use() {
    let tmp = TempDir::new().unwrap();
    let router = make_router(&tmp);
    router.dispatch(define_type("t", false), false).await;

    let inserted = router
        .dispatch(
            Request::InsertCacheObject {
                type_name: "t".to_string(),
                file_name: "a.ext".to_string(),
                size: 100,
                cost: 0,
                lifetime: 0,
                subscribe: true,
            },
            false,
        )
        .await;
    let path_name = inserted_path(&inserted).to_string_lossy().into_owned();

    let deferred = router
        .dispatch(Request::ExpireCacheObject { path_name }, false)
        .await;
    assert_eq!(error_code(&deferred.response), ErrorCode::InUse);
}

#[tokio::test]
async fn copy_requires_privilege_and_duplicates_content() {
    let tmp = TempDir::new().unwrap();
    let router = make_router(&tmp);
    router.dispatch(define_type("t", false), false).await;

    let inserted = router
        .dispatch(
            Request::InsertCacheObject {
                type_name: "t".to_string(),
                file_name: "report.txt".to_string(),
                size: 11,
                cost: 0,
                lifetime: 0,
                subscribe: true,
            },
            false,
        )
        .await;
    let path = inserted_path(&inserted);
    fs::write(&path, b"hello world").unwrap();
    drop(inserted);

    let path_name = path.to_string_lossy().into_owned();
    let refused = router
        .dispatch(
            Request::CopyCacheObject {
                path_name: path_name.clone(),
                destination: None,
                file_name: None,
            },
            false,
        )
        .await;
    assert_eq!(error_code(&refused.response), ErrorCode::Perm);

    let copied = router
        .dispatch(
            Request::CopyCacheObject {
                path_name,
                destination: Some(tmp.path().join("exports").to_string_lossy().into_owned()),
                file_name: None,
            },
            true,
        )
        .await;
    match &copied.response {
        Response::Success(Success::Copied { new_path_name }) => {
            assert!(new_path_name.ends_with("report.txt"));
            assert_eq!(fs::read(new_path_name).unwrap(), b"hello world");
        }
        other => panic!("expected Copied reply, got {other:?}"),
    }
}

#[tokio::test]
async fn introspection_operations() {
    let tmp = TempDir::new().unwrap();
    let router = make_router(&tmp);
    router.dispatch(define_type("beta", false), false).await;
    router.dispatch(define_type("alpha", false), false).await;

    let types = router.dispatch(Request::GetCacheTypes, false).await;
    assert_eq!(
        types.response,
        Response::Success(Success::Types {
            types: vec!["alpha".to_string(), "beta".to_string()],
        })
    );

    let described = router
        .dispatch(
            Request::DescribeType {
                type_name: "alpha".to_string(),
            },
            false,
        )
        .await;
    match described.response {
        Response::Success(Success::TypeDescription { size, cost, lifetime, .. }) => {
            assert_eq!(size, 100);
            assert_eq!(cost, 10);
            assert_eq!(lifetime, 1);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    let missing = router
        .dispatch(
            Request::DescribeType {
                type_name: "gamma".to_string(),
            },
            false,
        )
        .await;
    assert_eq!(error_code(&missing.response), ErrorCode::Exists);

    let version = router.dispatch(Request::GetVersion, false).await;
    assert_eq!(
        version.response,
        Response::Success(Success::Version {
            version: "1.0".to_string(),
        })
    );

    let status = router.dispatch(Request::GetCacheStatus, false).await;
    match status.response {
        Response::Success(Success::Status { num_types, num_objs, .. }) => {
            assert_eq!(num_types, 2);
            assert_eq!(num_objs, 0);
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn delete_type_round_trip() {
    let tmp = TempDir::new().unwrap();
    let router = make_router(&tmp);
    router.dispatch(define_type("t", false), false).await;

    let inserted = router
        .dispatch(
            Request::InsertCacheObject {
                type_name: "t".to_string(),
                file_name: "a.ext".to_string(),
                size: 1000,
                cost: 0,
                lifetime: 0,
                subscribe: false,
            },
            false,
        )
        .await;
    assert!(inserted.response.is_success());

    let deleted = router
        .dispatch(
            Request::DeleteType {
                type_name: "t".to_string(),
            },
            false,
        )
        .await;
    match deleted.response {
        Response::Success(Success::FreedSpace { freed_space }) => {
            assert!(freed_space > 0);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    let status = router
        .dispatch(
            Request::GetCacheTypeStatus {
                type_name: "t".to_string(),
            },
            false,
        )
        .await;
    assert_eq!(error_code(&status.response), ErrorCode::Exists);
}

#[tokio::test]
async fn touch_and_filename_for_unknown_objects() {
    let tmp = TempDir::new().unwrap();
    let router = make_router(&tmp);
    router.dispatch(define_type("t", false), false).await;

    let touch = router
        .dispatch(
            Request::TouchCacheObject {
                path_name: "/nowhere/x/A/BCDEFGHI.ext".to_string(),
            },
            false,
        )
        .await;
    assert_eq!(error_code(&touch.response), ErrorCode::Exists);

    let filename = router
        .dispatch(
            Request::GetCacheObjectFilename {
                path_name: "/nowhere/x/A/BCDEFGHI.ext".to_string(),
            },
            false,
        )
        .await;
    assert_eq!(error_code(&filename.response), ErrorCode::Exists);
}
