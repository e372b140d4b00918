//! Bouncer: a test-fixture RPC service for protocol conformance harnesses.
//!
//! The crate is split in two layers. This module is the transport: a small
//! TCP RPC server/client pair speaking length-prefixed bincode frames, with
//! handlers registered by method name. [`service`] holds the Bouncer
//! operations themselves (`Greet`, `Bounce`, `GrowTail`), which are plain
//! stateless functions registered onto the transport.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    future::Future,
    io::ErrorKind,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream},
    net::{TcpListener, TcpStream},
    sync::{oneshot, Mutex, RwLock},
};
use tracing::{debug, info};

pub mod service;

#[cfg(not(test))]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames above this size are refused unless the config raises the limit.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Request timeout")]
    Timeout,

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Remote error: {0}")]
    RemoteError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    id: u64,
    method: String,
    params: Vec<u8>,
}

impl RpcRequest {
    pub fn new(id: u64, method: String, params: Vec<u8>) -> Self {
        Self { id, method, params }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    id: u64,
    result: Option<Vec<u8>>,
    error: Option<String>,
}

impl RpcResponse {
    pub fn new(id: u64, result: Option<Vec<u8>>, error: Option<String>) -> Self {
        Self { id, result, error }
    }

    pub fn from_result(id: u64, result: Result<Vec<u8>, RpcError>) -> Self {
        match result {
            Ok(data) => Self::new(id, Some(data), None),
            Err(e) => Self::new(id, None, Some(e.to_string())),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn result(&self) -> Option<&Vec<u8>> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&String> {
        self.error.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Address the server binds to, e.g. `"127.0.0.1:15010"`. Port 0 asks
    /// the OS for an ephemeral port; the resolved address is available from
    /// [`RpcServer::socket_addr`] after `bind`.
    pub bind_address: String,

    pub max_frame_size: usize,

    pub call_timeout: Duration,
}

impl RpcConfig {
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            call_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

type AsyncHandlerFn = Box<
    dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, RpcError>> + Send>>
        + Send
        + Sync,
>;

/// Writes one length-prefixed frame: 4-byte little-endian length, then payload.
async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| RpcError::ConnectionError("frame exceeds u32 length prefix".to_string()))?;
    writer.write_u32_le(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the connection cleanly
/// at a frame boundary; EOF mid-frame is an error.
async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Vec<u8>>, RpcError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(RpcError::IoError(e)),
    };

    if len > max_frame_size {
        return Err(RpcError::ConnectionError(format!(
            "frame of {len} bytes exceeds limit of {max_frame_size}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[derive(Clone)]
pub struct RpcServer {
    pub handlers: Arc<RwLock<HashMap<String, AsyncHandlerFn>>>,

    /// Resolved listen address, set by [`bind`](Self::bind).
    pub socket_addr: Option<SocketAddr>,

    pub config: RpcConfig,
}

impl RpcServer {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            socket_addr: None,
            config,
        }
    }

    pub async fn register<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, RpcError>> + Send + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.insert(
            method.to_string(),
            Box::new(move |params: Vec<u8>| {
                Box::pin(handler(params)) as Pin<Box<dyn Future<Output = _> + Send>>
            }),
        );
    }

    /// Registers a handler with serde request/response types; bincode at the
    /// boundary.
    pub async fn register_typed<Req, Resp, F, Fut>(&self, method: &str, handler: F)
    where
        Req: serde::de::DeserializeOwned + Send + 'static,
        Resp: serde::Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |params: Vec<u8>| {
            let handler = handler.clone();
            async move {
                let request: Req =
                    bincode::deserialize(&params).map_err(RpcError::SerializationError)?;

                let response = handler(request).await?;

                bincode::serialize(&response).map_err(RpcError::SerializationError)
            }
        })
        .await;
    }

    /// Binds the listener and records the resolved local address. Failure to
    /// bind is the first of the two fatal bootstrap conditions.
    pub async fn bind(&mut self) -> Result<TcpListener, RpcError> {
        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| {
                RpcError::ConfigError(format!("failed to bind {}: {e}", self.config.bind_address))
            })?;

        let local_addr = listener.local_addr()?;
        self.socket_addr = Some(local_addr);
        info!(addr = %local_addr, "rpc server listening");
        Ok(listener)
    }

    /// Accepts connections until `shutdown` fires, spawning one task per
    /// connection. Resolves `Ok(())` on shutdown (including a dropped
    /// sender); an accept-loop failure is the second fatal bootstrap
    /// condition and is returned to the caller.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<(), RpcError> {
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("shutdown signal received, leaving accept loop");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "accepted connection");
                    let handlers = self.handlers.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(handlers, config, stream).await {
                            debug!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
            }
        }
    }

    /// Serves one connection: sequential decode/dispatch/encode until EOF.
    /// An undecodable request frame closes the connection; handler errors
    /// become per-call error responses and the connection stays open.
    async fn handle_connection(
        handlers: Arc<RwLock<HashMap<String, AsyncHandlerFn>>>,
        config: RpcConfig,
        stream: TcpStream,
    ) -> Result<(), RpcError> {
        let mut stream = BufStream::new(stream);

        while let Some(frame) = read_frame(&mut stream, config.max_frame_size).await? {
            let request: RpcRequest = bincode::deserialize(&frame)?;
            debug!(method = %request.method(), id = request.id(), "dispatching request");

            let response = {
                let handlers = handlers.read().await;
                match handlers.get(request.method()) {
                    Some(handler) => {
                        let result = handler(request.params().to_vec()).await;
                        RpcResponse::from_result(request.id(), result)
                    }
                    None => RpcResponse::from_result(
                        request.id(),
                        Err(RpcError::UnknownMethod(request.method().to_string())),
                    ),
                }
            };

            let payload = bincode::serialize(&response)?;
            write_frame(&mut stream, &payload).await?;
        }

        Ok(())
    }
}

pub struct RpcClient {
    stream: Mutex<BufStream<TcpStream>>,
    config: RpcConfig,
    next_id: AtomicU64,
}

impl RpcClient {
    pub async fn connect(addr: SocketAddr, config: RpcConfig) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RpcError::ConnectionError(format!("failed to connect to {addr}: {e}")))?;

        Ok(Self {
            stream: Mutex::new(BufStream::new(stream)),
            config,
            next_id: AtomicU64::new(1),
        })
    }

    /// Issues one request and waits for its response. Calls are serialized
    /// on the connection, so concurrent callers queue on the stream lock.
    pub async fn call(&self, method: &str, params: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = RpcRequest::new(id, method.to_string(), params);
        let frame = bincode::serialize(&request)?;

        let exchange = async {
            let mut stream = self.stream.lock().await;
            write_frame(&mut *stream, &frame).await?;

            let payload = read_frame(&mut *stream, self.config.max_frame_size)
                .await?
                .ok_or_else(|| {
                    RpcError::ConnectionError("connection closed before response".to_string())
                })?;

            let response: RpcResponse = bincode::deserialize(&payload)?;
            if response.id() != id {
                return Err(RpcError::ConnectionError(format!(
                    "response id {} does not match request id {id}",
                    response.id()
                )));
            }

            match (response.result(), response.error()) {
                (Some(data), None) => Ok(data.to_vec()),
                (None, Some(message)) => Err(RpcError::RemoteError(message.clone())),
                _ => Err(RpcError::ConnectionError(
                    "malformed response envelope".to_string(),
                )),
            }
        };

        match tokio::time::timeout(self.config.call_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout),
        }
    }
}
