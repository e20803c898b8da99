//! Store lifecycle integration tests over the public API.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpListener;

use polystore::{
    Accessor, AccessorConfig, AccessorCore, Error, Registry, Result, SocketAccessor, Store,
    StoreConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Minimal accessor counting its lifecycle calls.
struct CountingAccessor {
    core: AccessorCore,
    opens: AtomicUsize,
    fail: bool,
}

impl CountingAccessor {
    fn new(kind: &str, fail: bool) -> Result<Self> {
        let config = AccessorConfig::new().with_port(4242);
        Ok(Self {
            core: AccessorCore::new(kind, "store", &config, 4242)?,
            opens: AtomicUsize::new(0),
            fail,
        })
    }
}

#[async_trait]
impl Accessor for CountingAccessor {
    fn core(&self) -> &AccessorCore {
        &self.core
    }

    async fn open(&self) -> Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        // Yield so overlapping connect calls actually overlap.
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.fail {
            return Err(Error::Backend {
                operation: "open".to_string(),
                cause: "backend refused".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn counting_registry() -> Registry {
    let mut registry = Registry::empty();
    registry.register("counting", |kind, _, _| {
        Ok(Arc::new(CountingAccessor::new(kind, false)?))
    });
    registry.register("flaky", |kind, _, _| {
        Ok(Arc::new(CountingAccessor::new(kind, true)?))
    });
    registry
}

#[tokio::test]
async fn concurrent_store_connects_open_each_accessor_once() {
    init_tracing();
    let config = StoreConfig::new().with_accessor("counting", AccessorConfig::new());
    let store = Arc::new(
        Store::with_registry(&config, &["counting"], &counting_registry()).unwrap(),
    );

    let (a, b) = tokio::join!(
        tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.connect().await }
        }),
        tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.connect().await }
        }),
    );
    a.unwrap();
    b.unwrap();

    let accessor = store.get_typed::<CountingAccessor>("counting").unwrap();
    assert_eq!(accessor.opens.load(Ordering::SeqCst), 1);
    assert!(accessor.connected());
}

#[tokio::test]
async fn failing_accessor_is_summarized_not_raised() {
    init_tracing();
    let config = StoreConfig::new()
        .with_accessor("counting", AccessorConfig::new())
        .with_accessor("flaky", AccessorConfig::new());
    let store =
        Store::with_registry(&config, &["counting", "flaky"], &counting_registry()).unwrap();

    let summary = store.connect().await;
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.failed, vec!["flaky".to_string()]);
    assert!(!summary.all_connected());

    assert!(store.get("counting").unwrap().connected());
    assert!(!store.get("flaky").unwrap().connected());

    // Shutdown stays best-effort and quiet.
    store.disconnect().await;
}

#[tokio::test]
async fn wait_connected_resolves_after_connect() {
    init_tracing();
    let config = StoreConfig::new().with_accessor("counting", AccessorConfig::new());
    let store = Store::with_registry(&config, &["counting"], &counting_registry()).unwrap();

    store.connect().await;
    tokio::time::timeout(Duration::from_millis(200), store.wait_connected())
        .await
        .expect("wait_connected must resolve after connect");
}

#[test]
fn unknown_need_name_fails_store_construction() {
    let config = StoreConfig::new().with_accessor("mysql", AccessorConfig::new());
    let result = Store::new(&config, &["mysql"]);
    assert!(matches!(result, Err(Error::UnknownAccessorType(_))));
}

#[tokio::test]
async fn socket_accessor_end_to_end_through_store() {
    init_tracing();

    // Line-oriented echo peer.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufStream::new(stream);
        let mut line = String::new();
        while stream.read_line(&mut line).await.unwrap_or(0) > 0 {
            let reply = format!("ok {}", line.trim_end());
            stream.write_all(reply.as_bytes()).await.unwrap();
            stream.write_all(b"\n").await.unwrap();
            stream.flush().await.unwrap();
            line.clear();
        }
    });

    let config = StoreConfig::new().with_accessor(
        "socket",
        AccessorConfig::new()
            .with_port(port)
            .with_connect_timeout(1.0)
            .with_request_timeout(1.0),
    );
    let store = Store::new(&config, &["socket"]).unwrap();

    let summary = store.connect().await;
    assert!(summary.all_connected());

    let socket = store.get_typed::<SocketAccessor>("socket").unwrap();
    assert_eq!(socket.request("status").await.unwrap(), "ok status");

    store.disconnect().await;
    assert!(!socket.connected());
}
