//! QUIC server that streams a camera source to connected clients
//!
//! Lifecycle: [`Server::bind`] takes the UDP socket, [`BoundSocket::listen`]
//! wraps it in a QUIC endpoint, [`Server::serve`] accepts connections. For
//! every connection the server opens one bidirectional stream and writes raw
//! camera bytes into it; the client never writes back.

mod distributor;
mod pump;
mod stats;

pub use distributor::{forward, ChunkReceiver, ChunkRecvError, DistributionStats, FrameDistributor};
pub use pump::{spawn_reader, Chunk};
pub use stats::{ServerCounters, ServerStats};

use std::future::Future;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use quinn::{Connection, Endpoint, EndpointConfig, Incoming, SendStream, TokioRuntime, VarInt};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::camera::{CameraError, CameraSource};
use crate::config::ServerSection;
use crate::tls::{TlsConfig, TlsError};

/// Chunks buffered between the camera reader and its consumer
const READER_DEPTH: usize = 8;

/// Stream reset code telling the client the camera failed mid-stream
const SOURCE_FAILED: VarInt = VarInt::from_u32(1);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to start QUIC listener: {0}")]
    Listen(#[source] std::io::Error),

    #[error("invalid server options: {0}")]
    InvalidOptions(String),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("endpoint closed before a connection arrived")]
    Accept,

    #[error("handshake failed: {0}")]
    Handshake(#[source] quinn::ConnectionError),

    #[error("failed to open stream: {0}")]
    StreamOpen(#[source] quinn::ConnectionError),

    #[error("stream write failed: {0}")]
    StreamWrite(#[from] quinn::WriteError),

    #[error("stream already closed: {0}")]
    StreamClosed(#[from] quinn::ClosedStream),

    #[error("camera source failed: {0}")]
    Source(#[from] CameraError),
}

impl ServerError {
    /// Process exit status for a server that stops with this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::Bind(_) => 1,
            ServerError::Tls(_) => 3,
            _ => 4,
        }
    }
}

/// How many connections a server accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// Accept one connection, stream to it, then stop listening.
    /// Any failure is returned from [`Server::serve`].
    Single,

    /// Accept until shutdown, serving at most `max_connections` at once.
    /// A failing connection is logged and does not affect the others.
    Concurrent { max_connections: usize },
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub mode: ServeMode,
    pub chunk_size: usize,
    pub broadcast_capacity: usize,
    /// Period of the throughput log line
    pub stats_interval: Duration,
}

impl ServerOptions {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.chunk_size == 0 {
            return Err(ServerError::InvalidOptions(
                "chunk_size must be > 0".to_string(),
            ));
        }

        if self.broadcast_capacity == 0 {
            return Err(ServerError::InvalidOptions(
                "broadcast_capacity must be > 0".to_string(),
            ));
        }

        if let ServeMode::Concurrent { max_connections: 0 } = self.mode {
            return Err(ServerError::InvalidOptions(
                "max_connections must be > 0".to_string(),
            ));
        }

        if self.stats_interval.is_zero() {
            return Err(ServerError::InvalidOptions(
                "stats_interval must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl From<&ServerSection> for ServerOptions {
    fn from(section: &ServerSection) -> Self {
        let mode = if section.single {
            ServeMode::Single
        } else {
            ServeMode::Concurrent {
                max_connections: section.max_connections,
            }
        };

        Self {
            mode,
            chunk_size: section.chunk_size,
            broadcast_capacity: section.broadcast_capacity,
            stats_interval: Duration::from_secs(section.stats_interval_secs),
        }
    }
}

/// A UDP socket not yet carrying QUIC
pub struct BoundSocket {
    socket: UdpSocket,
}

impl BoundSocket {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Starts a QUIC listener on the socket. Must run inside a tokio runtime.
    pub fn listen(
        self,
        tls: &TlsConfig,
        source: Box<dyn CameraSource>,
        options: ServerOptions,
    ) -> Result<Server, ServerError> {
        options.validate()?;
        let server_config = tls.server_config()?;
        let endpoint = Endpoint::new(
            EndpointConfig::default(),
            Some(server_config),
            self.socket,
            Arc::new(TokioRuntime),
        )
        .map_err(ServerError::Listen)?;

        info!(
            local = %endpoint.local_addr().map_err(ServerError::Listen)?,
            mode = ?options.mode,
            "QUIC listener started"
        );

        Ok(Server {
            endpoint,
            source,
            options,
            counters: Arc::new(ServerCounters::default()),
        })
    }
}

pub struct Server {
    endpoint: Endpoint,
    source: Box<dyn CameraSource>,
    options: ServerOptions,
    counters: Arc<ServerCounters>,
}

impl Server {
    pub fn bind(addr: SocketAddr) -> Result<BoundSocket, ServerError> {
        let socket = UdpSocket::bind(addr).map_err(ServerError::Bind)?;
        debug!(%addr, "UDP socket bound");
        Ok(BoundSocket { socket })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Serves until the mode's natural end or until `shutdown` completes.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Server {
            endpoint,
            source,
            options,
            counters,
        } = self;

        let serving = async {
            match options.mode {
                ServeMode::Single => {
                    serve_single(&endpoint, source, &options, &counters, shutdown).await
                }
                ServeMode::Concurrent { max_connections } => {
                    serve_concurrent(
                        &endpoint,
                        source,
                        &options,
                        max_connections,
                        &counters,
                        shutdown,
                    )
                    .await
                }
            }
        };
        tokio::pin!(serving);

        let mut ticker = tokio::time::interval(options.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut previous = counters.snapshot();
        let mut last_tick = Instant::now();

        let result = loop {
            tokio::select! {
                result = &mut serving => break result,
                _ = ticker.tick() => {
                    let current = counters.snapshot();
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    info!(
                        active = current.active_connections(),
                        bytes = current.bytes_sent,
                        kbps = current.calculate_bitrate_kbps(&previous, elapsed),
                        "Streaming progress"
                    );
                    previous = current;
                    last_tick = Instant::now();
                }
            }
        };

        endpoint.close(0u32.into(), b"server closing");
        endpoint.wait_idle().await;

        let stats = counters.snapshot();
        info!(
            accepted = stats.connections_accepted,
            refused = stats.connections_refused,
            failed = stats.connections_failed,
            bytes = stats.bytes_sent,
            "QUIC listener closed"
        );

        result
    }
}

async fn serve_single<F>(
    endpoint: &Endpoint,
    source: Box<dyn CameraSource>,
    options: &ServerOptions,
    counters: &ServerCounters,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    debug!("Waiting for a connection");
    let incoming = tokio::select! {
        incoming = endpoint.accept() => incoming.ok_or(ServerError::Accept)?,
        _ = &mut shutdown => {
            info!("Shutdown requested before any connection");
            return Ok(());
        }
    };

    let connection = incoming.await.map_err(ServerError::Handshake)?;
    counters.record_accepted();
    info!(remote = %connection.remote_address(), "Connection established");

    let chunks = spawn_reader(source, options.chunk_size, READER_DEPTH);

    let sent = tokio::select! {
        sent = stream_chunks(&connection, ChunkFeed::Reader(chunks), counters) => sent?,
        _ = &mut shutdown => {
            info!("Shutdown requested while streaming");
            return Ok(());
        }
    };

    counters.record_completed();
    info!(bytes = sent, "Stream finished");
    Ok(())
}

async fn serve_concurrent<F>(
    endpoint: &Endpoint,
    source: Box<dyn CameraSource>,
    options: &ServerOptions,
    max_connections: usize,
    counters: &Arc<ServerCounters>,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    let distributor = Arc::new(FrameDistributor::new(options.broadcast_capacity));
    let chunks = spawn_reader(source, options.chunk_size, READER_DEPTH);
    let mut forwarder = tokio::spawn(forward(chunks, Arc::clone(&distributor)));

    let limit = Arc::new(Semaphore::new(max_connections));
    let mut handlers = JoinSet::new();
    let mut next_client_id = 0u64;

    tokio::pin!(shutdown);

    let source_result = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break None;
            }
            finished = &mut forwarder => {
                info!("Camera source finished, no longer accepting connections");
                let result = match finished {
                    Ok(result) => result,
                    Err(e) => {
                        error!(error = %e, "Chunk forwarder panicked");
                        Err(CameraError::DeviceRead("chunk forwarder panicked".to_string()))
                    }
                };
                break Some(result);
            }
            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Connection handler panicked");
                }
            }
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else {
                    break None;
                };

                let permit = match Arc::clone(&limit).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(
                            remote = %incoming.remote_address(),
                            max_connections,
                            "Connection limit reached, refusing"
                        );
                        counters.record_refused();
                        incoming.refuse();
                        continue;
                    }
                };

                next_client_id += 1;
                let client_id = next_client_id;
                let distributor = Arc::clone(&distributor);
                let counters = Arc::clone(counters);

                handlers.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = handle_subscriber(client_id, incoming, &distributor, &counters).await {
                        counters.record_failed();
                        warn!(client_id, error = %e, "Connection handler failed");
                    }
                });
            }
        }
    };

    match source_result {
        Some(result) => {
            // Streams end on their own once the buffered bytes are sent
            while let Some(joined) = handlers.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Connection handler panicked");
                }
            }
            result.map_err(ServerError::Source)
        }
        None => {
            handlers.shutdown().await;
            forwarder.abort();
            distributor.close();
            Ok(())
        }
    }
}

async fn handle_subscriber(
    client_id: u64,
    incoming: Incoming,
    distributor: &Arc<FrameDistributor>,
    counters: &ServerCounters,
) -> Result<(), ServerError> {
    let connection = incoming.await.map_err(ServerError::Handshake)?;
    counters.record_accepted();
    info!(client_id, remote = %connection.remote_address(), "Connection established");

    let Some(rx) = distributor.subscribe(client_id) else {
        if let Some(e) = distributor.failure() {
            connection.close(SOURCE_FAILED, b"camera failed");
            return Err(ServerError::Source(e));
        }
        debug!(client_id, "Camera source already finished");
        connection.close(0u32.into(), b"source finished");
        counters.record_completed();
        return Ok(());
    };

    let sent = stream_chunks(&connection, ChunkFeed::Broadcast(rx), counters).await?;

    counters.record_completed();
    info!(client_id, bytes = sent, "Stream finished");
    Ok(())
}

/// Where a connection's bytes come from
enum ChunkFeed {
    /// Sole consumer of the camera reader
    Reader(mpsc::Receiver<Chunk>),
    /// One of many subscribers to the camera reader
    Broadcast(ChunkReceiver),
}

impl ChunkFeed {
    /// Next chunk, `None` at end of input
    async fn next(&mut self) -> Option<Result<Bytes, ServerError>> {
        match self {
            ChunkFeed::Reader(rx) => rx.recv().await.map(|chunk| chunk.map_err(ServerError::from)),
            ChunkFeed::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(chunk) => return Some(Ok(chunk)),
                    Err(ChunkRecvError::Lagged(_)) => continue,
                    Err(ChunkRecvError::Closed) => return None,
                    Err(ChunkRecvError::Failed(e)) => return Some(Err(ServerError::Source(e))),
                }
            },
        }
    }
}

/// Opens the connection's stream and copies `feed` into it until end of
/// input. Returns the number of bytes written.
async fn stream_chunks(
    connection: &Connection,
    mut feed: ChunkFeed,
    counters: &ServerCounters,
) -> Result<u64, ServerError> {
    let (mut send, _recv) = connection.open_bi().await.map_err(ServerError::StreamOpen)?;
    debug!(stream = %send.id(), "Stream opened, copying camera data");

    let mut total = 0u64;
    while let Some(chunk) = feed.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                // A reset tells the client this is not a clean end of input
                let _ = send.reset(SOURCE_FAILED);
                return Err(e);
            }
        };
        send.write_all(&chunk).await?;
        counters.record_bytes(chunk.len());
        total += chunk.len() as u64;
    }

    finish_stream(send).await?;
    Ok(total)
}

/// Finishes the send half and waits until the peer has received everything
/// or stopped reading, so dropping the connection cannot discard data.
async fn finish_stream(mut send: SendStream) -> Result<(), ServerError> {
    send.finish()?;
    if let Err(e) = send.stopped().await {
        debug!(error = %e, "Stream ended before the peer acknowledged it");
    }
    Ok(())
}
