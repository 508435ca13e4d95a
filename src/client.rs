//! QUIC client that receives the camera stream

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use quinn::{Connection, Endpoint, RecvStream};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::ClientSection;
use crate::tls::{TlsConfig, TlsError, ALPN};

/// Name presented to the server; the certificate is not checked against it
const SERVER_NAME: &str = "localhost";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to create client endpoint: {0}")]
    Endpoint(#[source] std::io::Error),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("failed to dial {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: quinn::ConnectError,
    },

    #[error("handshake failed: {0}")]
    Handshake(#[source] quinn::ConnectionError),

    #[error("no stream within {0:?}")]
    DialTimeout(Duration),

    #[error("failed to accept stream: {0}")]
    AcceptStream(#[source] quinn::ConnectionError),

    #[error("stream read failed: {0}")]
    StreamRead(#[source] std::io::Error),

    #[error("output write failed: {0}")]
    Output(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: SocketAddr,
    /// Bound on handshake plus stream accept
    pub dial_timeout: Duration,
    pub alpn: Vec<u8>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions::from(&ClientSection::default())
    }
}

impl From<&ClientSection> for ClientOptions {
    fn from(section: &ClientSection) -> Self {
        Self {
            server_addr: section.server_addr,
            dial_timeout: Duration::from_secs(section.dial_timeout_secs),
            alpn: ALPN.to_vec(),
        }
    }
}

pub struct Client;

impl Client {
    /// Dials the server and waits for it to open the camera stream.
    ///
    /// Both the handshake and the stream accept must complete within
    /// `options.dial_timeout`.
    pub async fn connect(options: &ClientOptions) -> Result<Session, ClientError> {
        let bind_addr = if options.server_addr.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };

        let mut endpoint = Endpoint::client(bind_addr).map_err(ClientError::Endpoint)?;
        endpoint.set_default_client_config(TlsConfig::client_config_with_alpn(&options.alpn)?);

        info!(server = %options.server_addr, "Dialing camera server");

        let dial = async {
            let connection = endpoint
                .connect(options.server_addr, SERVER_NAME)
                .map_err(|source| ClientError::Connect {
                    addr: options.server_addr,
                    source,
                })?
                .await
                .map_err(ClientError::Handshake)?;
            debug!("QUIC connection established");

            let (_send, recv) = connection
                .accept_bi()
                .await
                .map_err(ClientError::AcceptStream)?;
            Ok::<_, ClientError>((connection, recv))
        };

        let (connection, recv) = match tokio::time::timeout(options.dial_timeout, dial).await {
            Ok(result) => result?,
            Err(_) => {
                endpoint.close(0u32.into(), b"dial timeout");
                return Err(ClientError::DialTimeout(options.dial_timeout));
            }
        };
        info!("Camera stream accepted");

        Ok(Session {
            endpoint,
            connection,
            recv,
        })
    }
}

/// An established connection with the server's stream accepted
pub struct Session {
    endpoint: Endpoint,
    connection: Connection,
    recv: RecvStream,
}

impl Session {
    /// Raw access to the camera stream
    pub fn recv(&mut self) -> &mut RecvStream {
        &mut self.recv
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Copies the stream into `out` until the server finishes it.
    /// Returns the number of bytes copied.
    pub async fn copy_to<W>(&mut self, out: &mut W) -> Result<u64, ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; 32 * 1024];
        let mut total = 0u64;

        loop {
            let n = match self.recv.read(&mut buf).await {
                Ok(Some(n)) => n,
                Ok(None) => break,
                Err(e) => return Err(ClientError::StreamRead(e.into())),
            };
            out.write_all(&buf[..n]).await.map_err(ClientError::Output)?;
            total += n as u64;
        }

        out.flush().await.map_err(ClientError::Output)?;
        debug!(bytes = total, "Stream finished");
        Ok(total)
    }

    /// Closes the connection and waits for the close to reach the server
    pub async fn close(self) {
        self.connection.close(0u32.into(), b"done");
        self.endpoint.wait_idle().await;
    }
}
