//! Single-connection socket accessor for line-oriented backends.
//!
//! One persistent connection, established eagerly on `connect()` and closed
//! on `disconnect()`. No pooling and no retry loop: with exactly one
//! connection to reason about, failures propagate immediately to the caller.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::accessor::{Accessor, AccessorCore};
use crate::config::AccessorConfig;
use crate::{Error, Result};

/// Socket accessor over one persistent line-oriented connection.
pub struct SocketAccessor {
    core: AccessorCore,
    config: AccessorConfig,
    stream: Mutex<Option<BufStream<TcpStream>>>,
}

impl SocketAccessor {
    /// Creates the accessor, validating its config slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the config is invalid. There is no
    /// meaningful default port for a plain socket backend, so `port` is
    /// required.
    pub fn new(kind: &str, store: &str, config: AccessorConfig) -> Result<Self> {
        let port = config.port.ok_or_else(|| {
            Error::Configuration("'port' is required for the socket accessor".to_string())
        })?;
        let core = AccessorCore::new(kind, store, &config, port)?;
        Ok(Self {
            core,
            config,
            stream: Mutex::new(None),
        })
    }

    /// Sends one line without waiting for a reply.
    pub async fn send(&self, line: &str) -> Result<()> {
        let deadline = self.config.request_timeout();
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| self.not_connected())?;

        let io = async {
            write_line(stream, line).await?;
            stream.flush().await
        };
        match tokio::time::timeout(deadline, io).await {
            Err(_) => Err(Error::timeout("send", deadline)),
            Ok(Err(e)) => Err(self.io_error("send", line, &e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Sends one line and reads one reply line, bounded by
    /// `request_timeout`.
    pub async fn request(&self, line: &str) -> Result<String> {
        let deadline = self.config.request_timeout();
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| self.not_connected())?;

        let io = async {
            write_line(stream, line).await?;
            stream.flush().await?;
            let mut reply = String::new();
            let read = stream.read_line(&mut reply).await?;
            Ok::<_, std::io::Error>((read, reply))
        };
        match tokio::time::timeout(deadline, io).await {
            Err(_) => Err(Error::timeout("request", deadline)),
            Ok(Err(e)) => Err(self.io_error("request", line, &e)),
            Ok(Ok((0, _))) => Err(Error::backend("request", "connection closed by peer")),
            Ok(Ok((_, mut reply))) => {
                while reply.ends_with('\n') || reply.ends_with('\r') {
                    reply.pop();
                }
                Ok(reply)
            },
        }
    }

    fn not_connected(&self) -> Error {
        Error::NotConnected {
            fingerprint: self.core.fingerprint().to_string(),
        }
    }

    fn io_error(&self, operation: &str, line: &str, e: &std::io::Error) -> Error {
        tracing::error!(
            fingerprint = self.core.fingerprint(),
            line,
            error = %e,
            "socket operation failed"
        );
        Error::backend(operation, e)
    }
}

async fn write_line(stream: &mut BufStream<TcpStream>, line: &str) -> std::io::Result<()> {
    stream.write_all(line.as_bytes()).await?;
    if !line.ends_with('\n') {
        stream.write_all(b"\n").await?;
    }
    Ok(())
}

#[async_trait]
impl Accessor for SocketAccessor {
    fn core(&self) -> &AccessorCore {
        &self.core
    }

    async fn open(&self) -> Result<()> {
        let deadline = self.config.connect_timeout();
        let addr = (self.core.host().to_string(), self.core.port());

        let stream = match tokio::time::timeout(deadline, TcpStream::connect(addr)).await {
            Err(_) => return Err(Error::timeout("socket_connect", deadline)),
            Ok(Err(e)) => return Err(Error::backend("socket_connect", e)),
            Ok(Ok(stream)) => stream,
        };

        *self.stream.lock().await = Some(BufStream::new(stream));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            // Best effort: the peer may already be gone.
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// One-shot echo server; replies `echo: <line>` to each received line.
    async fn spawn_echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufStream::new(stream);
            let mut line = String::new();
            while stream.read_line(&mut line).await.unwrap_or(0) > 0 {
                let reply = format!("echo: {}", line.trim_end());
                stream.write_all(reply.as_bytes()).await.unwrap();
                stream.write_all(b"\n").await.unwrap();
                stream.flush().await.unwrap();
                line.clear();
            }
        });
        port
    }

    fn accessor_for_port(port: u16) -> SocketAccessor {
        let config = AccessorConfig::new()
            .with_port(port)
            .with_connect_timeout(1.0)
            .with_request_timeout(1.0);
        SocketAccessor::new("socket", "store", config).unwrap()
    }

    #[test]
    fn test_port_is_required() {
        let result = SocketAccessor::new("socket", "store", AccessorConfig::new());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_full_lifecycle_against_local_server() {
        let port = spawn_echo_server().await;
        let accessor = accessor_for_port(port);

        accessor.connect().await.unwrap();
        assert!(accessor.connected());
        assert_eq!(accessor.fingerprint(), format!("socket://127.0.0.1:{port}"));

        let reply = accessor.request("hello").await.unwrap();
        assert_eq!(reply, "echo: hello");
        let reply = accessor.request("again").await.unwrap();
        assert_eq!(reply, "echo: again");

        accessor.disconnect().await.unwrap();
        assert!(!accessor.connected());
        assert!(matches!(
            accessor.request("late").await,
            Err(Error::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_propagates_immediately() {
        // Port 1 refuses: no retry loop, the error surfaces from connect().
        let accessor = accessor_for_port(1);
        let result = accessor.connect().await;
        assert!(matches!(result, Err(Error::Backend { .. })));
        assert!(!accessor.connected());
    }

    #[tokio::test]
    async fn test_request_before_connect_is_not_connected() {
        let accessor = accessor_for_port(9);
        assert!(matches!(
            accessor.request("ping").await,
            Err(Error::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_silent_server_times_out_request() {
        // Server accepts but never replies.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let mut stream = stream;
            while stream.read(&mut buf).await.unwrap_or(0) > 0 {}
        });

        let config = AccessorConfig::new()
            .with_port(port)
            .with_connect_timeout(1.0)
            .with_request_timeout(0.1);
        let accessor = SocketAccessor::new("socket", "store", config).unwrap();
        accessor.connect().await.unwrap();

        let result = accessor.request("anyone there?").await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }
}
