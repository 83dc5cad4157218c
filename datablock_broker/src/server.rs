//! Async request/reply server for the discovery broker (§6.3, §5
//! "the broker...MAY use an async runtime").
//!
//! A `tokio::select!` between inbound connections and the shutdown
//! signal, one spawned task per connection. This never touches the data
//! plane — only registration bookkeeping — so it is exempt from the
//! core's own no-async-runtime rule (§5).

use crate::protocol::{read_frame, write_frame, Reply, Request};
use crate::registry::Registry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// Owns the registry and the bound Unix domain socket for the broker's
/// lifetime.
pub struct Broker {
    registry: Arc<Registry>,
    socket_path: PathBuf,
}

impl Broker {
    /// Bind a new broker at `socket_path`, removing a stale socket file
    /// left behind by a previous (uncleanly terminated) run.
    pub fn bind(socket_path: impl AsRef<Path>) -> std::io::Result<(Self, UnixListener)> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        info!(path = %socket_path.display(), "broker listening");
        Ok((
            Self {
                registry: Arc::new(Registry::new()),
                socket_path,
            },
            listener,
        ))
    }

    /// Accept connections until `shutdown` resolves, handling each on
    /// its own spawned task. Removes the socket file on exit.
    pub async fn serve(
        &self,
        listener: UnixListener,
        shutdown: impl std::future::Future<Output = ()>,
    ) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let registry = Arc::clone(&self.registry);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, registry).await {
                                    debug!(error = %e, "connection handler exited with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("broker shutting down");
                    break;
                }
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }

    /// Number of channels currently registered (diagnostics/tests).
    pub fn registered_count(&self) -> usize {
        self.registry.len()
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    registry: Arc<Registry>,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(()); // peer closed the connection
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;

        let reply = match serde_json::from_slice::<Request>(&body) {
            Ok(Request::Register(req)) => registry.register(req),
            Ok(Request::Discover(req)) => registry.discover(req),
            Ok(Request::Deregister(req)) => registry.deregister(req),
            Err(e) => {
                warn!(error = %e, "malformed broker request");
                Reply::Error { reason: e.to_string() }
            }
        };

        let encoded = serde_json::to_vec(&reply).expect("Reply serialization cannot fail");
        let len_prefix = (encoded.len() as u32).to_be_bytes();
        stream.write_all(&len_prefix).await?;
        stream.write_all(&encoded).await?;
    }
}

/// Blocking client helper used by producers/consumers (and tests) that
/// want to talk to a broker without pulling in `tokio` themselves —
/// matches [`read_frame`]/[`write_frame`]'s synchronous framing.
pub mod client {
    use super::*;
    use std::io::{self};
    use std::os::unix::net::UnixStream as StdUnixStream;

    /// Send one request over a fresh connection to `socket_path` and
    /// return the decoded reply.
    pub fn request(socket_path: impl AsRef<Path>, req: &Request) -> io::Result<Reply> {
        let mut stream = StdUnixStream::connect(socket_path.as_ref())?;
        let body = serde_json::to_vec(req)?;
        write_frame(&mut stream, &body)?;
        let reply_body = read_frame(&mut stream)?;
        serde_json::from_slice(&reply_body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DiscoverRequest, RegisterRequest};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn register_then_discover_over_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("broker.sock");
        let (broker, listener) = Broker::bind(&socket_path).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let serve_path = socket_path.clone();
        let handle = tokio::spawn(async move {
            broker.serve(listener, async { let _ = rx.await; }).await;
            let _ = serve_path;
        });

        // Give the accept loop a moment to start.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let reg_reply = client::request(
            &socket_path,
            &Request::Register(RegisterRequest {
                channel: "ticks".to_string(),
                shm_name: "ticks".to_string(),
                schema_hash: "ab".repeat(32),
                secret_hash: "cd".repeat(32),
                endpoint: None,
            }),
        )
        .unwrap();
        assert!(matches!(reg_reply, Reply::Ok));

        let disc_reply = client::request(
            &socket_path,
            &Request::Discover(DiscoverRequest {
                channel: "ticks".to_string(),
                secret_hash: "cd".repeat(32),
            }),
        )
        .unwrap();
        assert!(matches!(disc_reply, Reply::OkDiscover(_)));

        let _ = tx.send(());
        let _ = handle.await;
    }
}
