//! Camera QUIC server CLI

use std::path::PathBuf;
use std::process::ExitCode;

use camera_quic::camera::{CameraError, CameraSource, FrameCamera, TestPatternDevice};
use camera_quic::config::Config;
use camera_quic::server::{Server, ServerOptions};
use camera_quic::tls::TlsConfig;
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

const EXIT_CAMERA: u8 = 2;
const EXIT_TLS: u8 = 3;
const EXIT_CONFIG: u8 = 5;

#[derive(Parser, Debug)]
#[command(name = "camera-quic-server")]
#[command(about = "Streams raw camera frames to QUIC clients")]
#[command(version)]
struct Cli {
    /// Path to configuration file (built-in defaults when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Stream a synthetic counting pattern instead of the camera
    #[arg(long)]
    test_mode: bool,

    /// UDP port to listen on, overriding the configuration
    #[arg(long)]
    port: Option<u16>,

    /// Serve a single connection, then exit
    #[arg(long)]
    single: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("Camera QUIC server starting");

    let mut config = match Config::load_or_default(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Some(port) = cli.port {
        config.server.listen_addr.set_port(port);
    }
    if cli.single {
        config.server.single = true;
    }

    debug!(addr = %config.server.listen_addr, "Binding UDP socket");
    let socket = match Server::bind(config.server.listen_addr) {
        Ok(socket) => socket,
        Err(e) => {
            error!(addr = %config.server.listen_addr, error = %e, "Failed to listen on UDP port");
            return exit_code(e.exit_code());
        }
    };

    debug!("Starting camera");
    let source = match open_camera(&cli, &config) {
        Ok(source) => source,
        Err(e) => {
            error!(error = %e, "Failed to initialize camera");
            return ExitCode::from(EXIT_CAMERA);
        }
    };

    debug!("Setting up TLS config");
    let tls = match TlsConfig::build() {
        Ok(tls) => tls,
        Err(e) => {
            error!(error = %e, "Failed to initialize TLS config");
            return ExitCode::from(EXIT_TLS);
        }
    };

    let options = ServerOptions::from(&config.server);
    let server = match socket.listen(&tls, source, options) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start QUIC listener");
            return exit_code(e.exit_code());
        }
    };

    info!("Serving camera stream, press Ctrl+C to stop");
    if let Err(e) = server.serve(shutdown_signal()).await {
        error!(error = %e, "Failed to run QUIC server");
        return exit_code(e.exit_code());
    }

    info!("Shutting down");
    ExitCode::SUCCESS
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Cannot listen for Ctrl+C, running until killed");
        std::future::pending::<()>().await;
    }
}

fn open_camera(cli: &Cli, config: &Config) -> Result<Box<dyn CameraSource>, CameraError> {
    if cli.test_mode {
        info!(
            frame_bytes = config.camera.frame_size(),
            fps = config.camera.fps,
            "Using synthetic test pattern"
        );
        let device =
            TestPatternDevice::new(config.camera.frame_size(), config.camera.frame_interval());
        return Ok(Box::new(FrameCamera::new(device)));
    }

    open_device(config)
}

#[cfg(all(feature = "v4l", target_os = "linux"))]
fn open_device(config: &Config) -> Result<Box<dyn CameraSource>, CameraError> {
    use camera_quic::camera::{V4lDevice, CAMERA_INDEX};

    let device = V4lDevice::open(CAMERA_INDEX, &config.camera)?;
    Ok(Box::new(FrameCamera::new(device)))
}

#[cfg(not(all(feature = "v4l", target_os = "linux")))]
fn open_device(_config: &Config) -> Result<Box<dyn CameraSource>, CameraError> {
    Err(CameraError::Init(
        "built without V4L2 support; rebuild with --features v4l or pass --test-mode".to_string(),
    ))
}
