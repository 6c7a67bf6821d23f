//! Server-side listener for a remote object.
//!
//! A [`Skeleton`] accepts connections on its bound address and hands each one
//! to its own task. The task reads one request record, dispatches it onto the
//! owner, writes one response record and closes the connection.
//!
//! # Thread Safety
//!
//! The owner is shared via `Arc` between all connection tasks. The skeleton
//! keeps no mutable state of its own; synchronization is the owner's job.
//!
//! Handler concurrency is bounded by a semaphore: once
//! `OrbConfig::MAX_CONNECTIONS` handlers are in flight, the accept loop waits
//! for one to finish before accepting again.

use crate::config::OrbConfig;
use crate::wire::{decode_request, encode_response, read_record, write_record, RemoteFault, Response};
use crate::Result;
use futures::FutureExt;
use serde_json::Value;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Target of dispatched requests.
#[async_trait::async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Run `method` with positional `args` and return its result.
    async fn dispatch(&self, method: &str, args: Vec<Value>) -> std::result::Result<Value, RemoteFault>;
}

/// A bound listener that is not serving yet.
///
/// Connections that arrive before [`Skeleton::start`] wait in the listen
/// backlog.
pub struct Skeleton {
    listener: TcpListener,
    addr: SocketAddr,
}

impl Skeleton {
    /// Bind the listener. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start accepting and dispatching onto `owner`.
    pub fn start<D: Dispatch>(self, owner: Arc<D>) -> SkeletonHandle {
        info!("Skeleton listening on {}", self.addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(OrbConfig::MAX_CONNECTIONS));

        let task_handle = tokio::spawn(accept_loop(
            self.listener,
            owner,
            shutdown_rx,
            conn_shutdown_rx,
            permits.clone(),
        ));

        SkeletonHandle {
            addr: self.addr,
            permits,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        }
    }
}

/// Handle to a running skeleton. Dropping shuts it down.
pub struct SkeletonHandle {
    addr: SocketAddr,
    permits: Arc<Semaphore>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl SkeletonHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of connection handlers currently running.
    pub fn active_connections(&self) -> usize {
        OrbConfig::MAX_CONNECTIONS - self.permits.available_permits()
    }

    /// Stop accepting and tell in-flight handlers to give up.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for SkeletonHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

async fn accept_loop<D: Dispatch>(
    listener: TcpListener,
    owner: Arc<D>,
    mut shutdown_rx: oneshot::Receiver<()>,
    conn_shutdown_rx: watch::Receiver<bool>,
    permits: Arc<Semaphore>,
) {
    loop {
        let permit = tokio::select! {
            _ = &mut shutdown_rx => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        tokio::select! {
            _ = &mut shutdown_rx => break,
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let owner = owner.clone();
                        let mut conn_shutdown = conn_shutdown_rx.clone();

                        tokio::spawn(async move {
                            debug!("Serving request from {}", peer_addr);
                            if let Err(e) = handle_connection(stream, &*owner, &mut conn_shutdown).await {
                                debug!("Connection {} ended: {}", peer_addr, e);
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }
    info!("Skeleton shutting down");
}

async fn handle_connection<D: Dispatch>(
    mut stream: TcpStream,
    owner: &D,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);

    let record = tokio::select! {
        result = read_record(&mut reader) => result,
        _ = shutdown_rx.changed() => return Ok(()),
    };

    let response = match record {
        Ok(Some(record)) => process_request(&record, owner).await,
        // Peer connected and went away without asking anything.
        Ok(None) => return Ok(()),
        Err(e) => Response::Error(e.to_fault()),
    };

    let record = encode_response(&response)?;
    write_record(&mut writer, &record).await
}

/// Decode, dispatch and convert every failure into an error response.
async fn process_request<D: Dispatch>(record: &str, owner: &D) -> Response {
    let request = match decode_request(record) {
        Ok(request) => request,
        Err(e) => return Response::Error(e.to_fault()),
    };

    let outcome = AssertUnwindSafe(owner.dispatch(&request.method, request.args))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(value)) => Response::Result(value),
        Ok(Err(fault)) => {
            debug!("{} failed: {} {:?}", request.method, fault.name, fault.args);
            Response::Error(fault)
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            warn!("{} panicked: {}", request.method, message);
            Response::Error(RemoteFault::new("RuntimeError", vec![Value::String(message)]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods::{arg, expect_arity, reply, MethodTable};
    use crate::stub::Stub;
    use crate::OrbError;
    use futures::future::BoxFuture;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    struct Echo {
        methods: MethodTable<Echo>,
    }

    fn echo(_: &Echo, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            expect_arity("echo", &args, 1)?;
            let x: Value = arg("echo", &args, 0)?;
            reply(x)
        })
    }

    fn explode(_: &Echo, args: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            if args.is_empty() {
                panic!("boom");
            }
            reply(args)
        })
    }

    fn fail(_: &Echo, _: Vec<Value>) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move { Err(OrbError::LockNotHeld) })
    }

    impl Echo {
        fn new() -> Self {
            Self {
                methods: MethodTable::new()
                    .with("echo", echo)
                    .with("explode", explode)
                    .with("fail", fail),
            }
        }
    }

    #[async_trait::async_trait]
    impl Dispatch for Echo {
        async fn dispatch(&self, method: &str, args: Vec<Value>) -> std::result::Result<Value, RemoteFault> {
            self.methods.invoke(self, method, args).await
        }
    }

    async fn start_echo() -> SkeletonHandle {
        let skeleton = Skeleton::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        skeleton.start(Arc::new(Echo::new()))
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let mut handle = start_echo().await;
        let stub = Stub::new(handle.addr());

        let result = stub.call("echo", vec![json!("x")]).await.unwrap();
        assert_eq!(result, json!("x"));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_undefined_method_is_attribute_error() {
        let mut handle = start_echo().await;
        let stub = Stub::new(handle.addr());

        match stub.call("nope", vec![]).await.unwrap_err() {
            OrbError::Remote { name, .. } => assert_eq!(name, "AttributeError"),
            other => panic!("Expected Remote, got: {:?}", other),
        }

        // The listener survives and keeps serving.
        assert_eq!(stub.call("echo", vec![json!(1)]).await.unwrap(), json!(1));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let mut handle = start_echo().await;
        let stub = Stub::new(handle.addr());

        match stub.call("fail", vec![]).await.unwrap_err() {
            OrbError::Remote { name, .. } => assert_eq!(name, "LockNotHeld"),
            other => panic!("Expected Remote, got: {:?}", other),
        }
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_listener() {
        let mut handle = start_echo().await;
        let stub = Stub::new(handle.addr());

        match stub.call("explode", vec![]).await.unwrap_err() {
            OrbError::Remote { name, args } => {
                assert_eq!(name, "RuntimeError");
                assert_eq!(args, vec![json!("boom")]);
            }
            other => panic!("Expected Remote, got: {:?}", other),
        }

        assert_eq!(stub.call("echo", vec![json!("still")]).await.unwrap(), json!("still"));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_protocol_error() {
        let mut handle = start_echo().await;

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let (reader, mut writer) = stream.split();
        writer.write_all(b"not valid json\n").await.unwrap();

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await.unwrap();
        let response: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(response["error"]["name"], json!("ProtocolError"));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_concurrent_calls() {
        let mut handle = start_echo().await;
        let stub = Stub::new(handle.addr());

        let calls = (0..32).map(|i| async move { stub.call("echo", vec![json!(i)]).await });
        let results = futures::future::join_all(calls).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!(i));
        }
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let mut handle = start_echo().await;
        let stub = Stub::new(handle.addr());
        assert!(stub.call("echo", vec![json!(0)]).await.is_ok());

        handle.shutdown();

        let mut refused = false;
        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if stub.call("echo", vec![json!(0)]).await.is_err() {
                refused = true;
                break;
            }
        }
        assert!(refused, "Skeleton should stop serving after shutdown");
    }
}
