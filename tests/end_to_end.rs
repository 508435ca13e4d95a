//! Server and client talking over loopback QUIC

use anyhow::Result;
use camera_quic::camera::{CameraError, CameraSource, FrameCamera, TestPatternDevice};
use camera_quic::client::{Client, ClientError, ClientOptions, Session};
use camera_quic::server::{ServeMode, Server, ServerError, ServerOptions};
use camera_quic::tls::{TlsConfig, ALPN};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Replays a fixed list of reads, then reports end of input
struct ScriptedSource {
    reads: VecDeque<Result<Vec<u8>, CameraError>>,
}

impl ScriptedSource {
    fn new(reads: Vec<Result<Vec<u8>, CameraError>>) -> Box<dyn CameraSource> {
        Box::new(Self {
            reads: reads.into(),
        })
    }
}

impl CameraSource for ScriptedSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CameraError> {
        match self.reads.pop_front() {
            Some(Ok(bytes)) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Some(Err(e)) => Err(e),
            None => Ok(0),
        }
    }

    fn close(&mut self) -> Result<(), CameraError> {
        Ok(())
    }
}

/// Trickles 0xAA bytes until released, then fails like an unplugged camera
struct FailOnRelease {
    release: std::sync::mpsc::Receiver<()>,
}

impl CameraSource for FailOnRelease {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CameraError> {
        // A dropped sender releases too
        match self.release.try_recv() {
            Err(std::sync::mpsc::TryRecvError::Empty) => {
                std::thread::sleep(Duration::from_millis(2));
                buf[0] = 0xAA;
                Ok(1)
            }
            _ => Err(CameraError::DeviceRead("unplugged".to_string())),
        }
    }

    fn close(&mut self) -> Result<(), CameraError> {
        Ok(())
    }
}

/// Endless wrapping byte counter, a little slower than loopback
fn counting_source() -> Box<dyn CameraSource> {
    Box::new(FrameCamera::new(TestPatternDevice::new(
        64,
        Duration::from_millis(2),
    )))
}

fn options(mode: ServeMode) -> ServerOptions {
    ServerOptions {
        mode,
        chunk_size: 1024,
        broadcast_capacity: 256,
        stats_interval: Duration::from_secs(1),
    }
}

fn client_options(server_addr: SocketAddr) -> ClientOptions {
    ClientOptions {
        server_addr,
        dial_timeout: Duration::from_secs(5),
        alpn: ALPN.to_vec(),
    }
}

/// A running server plus the handle that stops it
struct TestServer {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    fn start(source: Box<dyn CameraSource>, options: ServerOptions) -> Result<Self> {
        let socket = Server::bind("127.0.0.1:0".parse()?)?;
        let addr = socket.local_addr()?;
        let tls = TlsConfig::build()?;
        let server = socket.listen(&tls, source, options)?;

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(async move {
            let _ = stopped.await;
        }));

        Ok(Self {
            addr,
            stop: Some(stop),
            task,
        })
    }

    /// Waits for the server to return on its own
    async fn finished(self) -> Result<(), ServerError> {
        let _stop = self.stop;
        timeout(TEST_TIMEOUT, self.task)
            .await
            .expect("server did not finish in time")
            .expect("server task panicked")
    }

    /// Requests shutdown and waits for the server to return
    async fn shutdown(mut self) -> Result<(), ServerError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.finished().await
    }
}

async fn read_counting(session: &mut Session, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    timeout(TEST_TIMEOUT, session.recv().read_exact(&mut buf)).await??;
    Ok(buf)
}

fn assert_consecutive(bytes: &[u8]) {
    for (i, pair) in bytes.windows(2).enumerate() {
        assert_eq!(
            pair[1],
            pair[0].wrapping_add(1),
            "gap at offset {}: {} then {}",
            i + 1,
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test]
async fn test_single_mode_delivers_source_bytes_exactly() -> Result<()> {
    let server = TestServer::start(
        ScriptedSource::new(vec![Ok(vec![0x01, 0x02, 0x03])]),
        options(ServeMode::Single),
    )?;

    let mut session = Client::connect(&client_options(server.addr)).await?;
    let mut out = Vec::new();
    let copied = timeout(TEST_TIMEOUT, session.copy_to(&mut out)).await??;
    session.close().await;

    assert_eq!(out, vec![0x01, 0x02, 0x03]);
    assert_eq!(copied, 3);

    // Single mode stops listening after its one connection
    server.finished().await?;
    Ok(())
}

#[tokio::test]
async fn test_single_mode_source_error_surfaces() -> Result<()> {
    let server = TestServer::start(
        ScriptedSource::new(vec![
            Ok(vec![0xAA]),
            Err(CameraError::DeviceRead("unplugged".to_string())),
        ]),
        options(ServeMode::Single),
    )?;

    // The server may tear the connection down before the stream is accepted
    if let Ok(mut session) = Client::connect(&client_options(server.addr)).await {
        let mut out = Vec::new();
        let copied = timeout(TEST_TIMEOUT, session.copy_to(&mut out)).await?;
        assert!(copied.is_err(), "stream should end abnormally");
    }

    match server.finished().await {
        Err(e @ ServerError::Source(CameraError::DeviceRead(_))) => assert_eq!(e.exit_code(), 4),
        other => panic!("expected source error, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_concurrent_mode_source_error_surfaces() -> Result<()> {
    let (release, gate) = std::sync::mpsc::channel();
    let server = TestServer::start(
        Box::new(FailOnRelease { release: gate }),
        options(ServeMode::Concurrent { max_connections: 4 }),
    )?;

    // The connection subscribes before its stream opens, so once the
    // session exists the failure is guaranteed to reach it
    let mut session = Client::connect(&client_options(server.addr)).await?;
    release.send(())?;

    let mut out = Vec::new();
    let copied = timeout(TEST_TIMEOUT, session.copy_to(&mut out)).await?;
    assert!(
        matches!(copied, Err(ClientError::StreamRead(_))),
        "stream should be reset, got {:?}",
        copied
    );
    assert!(out.iter().all(|&b| b == 0xAA));

    match server.finished().await {
        Err(e @ ServerError::Source(CameraError::DeviceRead(_))) => assert_eq!(e.exit_code(), 4),
        other => panic!("expected source error, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_concurrent_clients_each_see_contiguous_stream() -> Result<()> {
    let server = TestServer::start(
        counting_source(),
        options(ServeMode::Concurrent { max_connections: 4 }),
    )?;

    let dial = client_options(server.addr);
    let first = Client::connect(&dial);
    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Client::connect(&dial).await
    };
    let (first, second) = tokio::join!(first, second);
    let (mut first, mut second) = (first?, second?);

    let (a, b) = tokio::join!(
        read_counting(&mut first, 2048),
        read_counting(&mut second, 2048)
    );
    let (a, b) = (a?, b?);

    assert_consecutive(&a);
    assert_consecutive(&b);

    first.close().await;
    second.close().await;
    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_mode_survives_failed_connection() -> Result<()> {
    let server = TestServer::start(
        counting_source(),
        options(ServeMode::Concurrent { max_connections: 4 }),
    )?;

    let mut wrong = client_options(server.addr);
    wrong.alpn = b"some-other-protocol".to_vec();
    match Client::connect(&wrong).await {
        Err(ClientError::Handshake(_)) => {}
        Err(other) => panic!("expected handshake failure, got {}", other),
        Ok(_) => panic!("handshake succeeded with a foreign protocol"),
    }

    // The failure stays with that connection; the server keeps serving
    let mut session = Client::connect(&client_options(server.addr)).await?;
    let bytes = read_counting(&mut session, 256).await?;
    assert_consecutive(&bytes);

    session.close().await;
    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_single_mode_handshake_failure_surfaces() -> Result<()> {
    let server = TestServer::start(counting_source(), options(ServeMode::Single))?;

    let mut wrong = client_options(server.addr);
    wrong.alpn = b"h3".to_vec();
    assert!(Client::connect(&wrong).await.is_err());

    match server.finished().await {
        Err(ServerError::Handshake(_)) => {}
        other => panic!("expected handshake error, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_connections_over_limit_are_refused() -> Result<()> {
    let server = TestServer::start(
        counting_source(),
        options(ServeMode::Concurrent { max_connections: 1 }),
    )?;

    let mut first = Client::connect(&client_options(server.addr)).await?;
    read_counting(&mut first, 64).await?;

    match Client::connect(&client_options(server.addr)).await {
        Err(ClientError::Handshake(_)) => {}
        Err(other) => panic!("expected refusal, got {}", other),
        Ok(_) => panic!("second connection accepted over the limit"),
    }

    // The first connection is unaffected
    let bytes = read_counting(&mut first, 256).await?;
    assert_consecutive(&bytes);

    first.close().await;
    server.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_streams_finish_when_source_ends() -> Result<()> {
    let server = TestServer::start(
        ScriptedSource::new(Vec::new()),
        options(ServeMode::Concurrent { max_connections: 4 }),
    )?;

    // With the source already exhausted the server stops by itself
    server.finished().await?;
    Ok(())
}

#[tokio::test]
async fn test_dial_without_server_times_out() -> Result<()> {
    // Reserve a port, then free it so nothing listens there
    let addr = std::net::UdpSocket::bind("127.0.0.1:0")?.local_addr()?;

    let mut options = client_options(addr);
    options.dial_timeout = Duration::from_secs(2);

    let start = Instant::now();
    let result = Client::connect(&options).await;
    let elapsed = start.elapsed();

    match result {
        Err(ClientError::DialTimeout(bound)) => assert_eq!(bound, Duration::from_secs(2)),
        Err(other) => panic!("expected dial timeout, got {}", other),
        Ok(_) => panic!("connected with no server listening"),
    }
    assert!(elapsed < Duration::from_secs(4), "took {:?}", elapsed);
    Ok(())
}
