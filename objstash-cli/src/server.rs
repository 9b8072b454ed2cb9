//! Unix-socket front-end for the request router.
//!
//! Transport only: newline-delimited JSON requests in, one JSON reply
//! per line out.  Subscription handles created by a connection are
//! owned by that connection's task, so a disconnect releases every pin
//! the caller still held.

use objstash::service::{Request, Router, SubscriptionHandle};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serve the router on `socket` until shutdown is signalled.
pub async fn serve(
    router: Arc<Router>,
    socket: PathBuf,
    shutdown: CancellationToken,
) -> io::Result<()> {
    if let Some(parent) = socket.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Remove a stale socket from a previous run.
    let _ = tokio::fs::remove_file(&socket).await;

    let listener = UnixListener::bind(&socket)?;
    info!(socket = %socket.display(), "objstash listening");

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                info!("socket server shutting down");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(router, stream).await {
                                debug!(error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                }
            }
        }
    }

    let _ = tokio::fs::remove_file(&socket).await;
    Ok(())
}

async fn handle_connection(router: Arc<Router>, stream: UnixStream) -> io::Result<()> {
    // Callers running as the daemon's own user get the privileged
    // operations; everyone else gets the public surface.
    let privileged = stream
        .peer_cred()
        .map(|cred| cred.uid() == unsafe { libc::getuid() })
        .unwrap_or(false);

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Pins held on behalf of this caller; dropped (and therefore
    // unsubscribed) when the connection goes away.
    let mut pins: Vec<SubscriptionHandle> = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let dispatched = router.dispatch(request, privileged).await;
                if let Some(handle) = dispatched.subscription {
                    pins.push(handle);
                }
                dispatched.response.to_value()
            }
            Err(e) => json!({
                "returnValue": false,
                "errorCode": 1,
                "errorText": format!("Malformed request: {e}"),
            }),
        };

        let mut payload = reply.to_string();
        payload.push('\n');
        write_half.write_all(payload.as_bytes()).await?;
    }

    debug!(pins = pins.len(), "connection closed, releasing subscriptions");
    Ok(())
}

/// One-shot client: send a single request line and return the reply.
pub async fn request_once(socket: &Path, request: &Request) -> io::Result<serde_json::Value> {
    let stream = UnixStream::connect(socket).await?;
    let (read_half, mut write_half) = stream.into_split();

    let mut payload = serde_json::to_string(request)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    payload.push('\n');
    write_half.write_all(payload.as_bytes()).await?;

    let mut lines = BufReader::new(read_half).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "daemon closed connection"))?;
    serde_json::from_str(&line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstash::cache::set::CacheSet;
    use objstash::service::SubscriptionRegistry;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    fn make_router(tmp: &TempDir) -> Arc<Router> {
        let set = CacheSet::new(&tmp.path().join("cache"), 10_000_000).unwrap();
        Arc::new(Router::new(
            Arc::new(Mutex::new(set)),
            SubscriptionRegistry::new(),
            tmp.path().join("downloads"),
        ))
    }

    #[tokio::test]
    async fn serves_requests_over_the_socket() {
        let tmp = TempDir::new().unwrap();
        let router = make_router(&tmp);
        let socket = tmp.path().join("objstash.sock");
        let shutdown = CancellationToken::new();

        let server = tokio::spawn(serve(router, socket.clone(), shutdown.clone()));
        // Wait for the listener to come up.
        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let reply = request_once(
            &socket,
            &Request::DefineType {
                type_name: "t".to_string(),
                lo_watermark: 10_000,
                hi_watermark: 100_000,
                size: 0,
                cost: 0,
                lifetime: 0,
                dir_type: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(reply["returnValue"], serde_json::json!(true));

        let status = request_once(&socket, &Request::GetCacheStatus).await.unwrap();
        assert_eq!(status["numTypes"], serde_json::json!(1));

        shutdown.cancel();
        server.await.unwrap().unwrap();
        assert!(!socket.exists(), "socket removed on shutdown");
    }

    #[tokio::test]
    async fn malformed_lines_get_an_error_reply() {
        let tmp = TempDir::new().unwrap();
        let router = make_router(&tmp);
        let socket = tmp.path().join("objstash.sock");
        let shutdown = CancellationToken::new();

        let server = tokio::spawn(serve(router, socket.clone(), shutdown.clone()));
        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stream = UnixStream::connect(&socket).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"this is not json\n").await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let reply: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["returnValue"], serde_json::json!(false));
        assert_eq!(reply["errorCode"], serde_json::json!(1));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
