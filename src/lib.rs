//! Raw camera frame streaming over QUIC
//!
//! The server reads frame bytes from a [`camera::CameraSource`] and writes
//! them, undelimited, into one QUIC stream per client. The client copies the
//! stream to any async writer. Each process run uses a fresh self-signed
//! certificate, and both peers advertise the [`tls::ALPN`] token.
//!
//! # Example
//!
//! ```no_run
//! use camera_quic::camera::{FrameCamera, TestPatternDevice};
//! use camera_quic::server::{ServeMode, Server, ServerOptions};
//! use camera_quic::tls::TlsConfig;
//! use std::time::Duration;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let socket = Server::bind("0.0.0.0:3030".parse()?)?;
//! let source = FrameCamera::new(TestPatternDevice::new(640 * 480 * 2, Duration::from_millis(33)));
//! let tls = TlsConfig::build()?;
//! let options = ServerOptions {
//!     mode: ServeMode::Single,
//!     chunk_size: 32 * 1024,
//!     broadcast_capacity: 256,
//!     stats_interval: Duration::from_secs(10),
//! };
//! let server = socket.listen(&tls, Box::new(source), options)?;
//! server.serve(std::future::pending()).await?;
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod client;
pub mod config;
pub mod server;
pub mod tls;

// Re-exports for convenience
pub use camera::{CameraError, CameraSource, FrameCamera, FrameDevice, TestPatternDevice};
pub use client::{Client, ClientError, ClientOptions, Session};
pub use config::{Config, ConfigError};
pub use server::{ServeMode, Server, ServerError, ServerOptions, ServerStats};
pub use tls::{TlsConfig, TlsError, ALPN};
