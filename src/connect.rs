//! Opening byte streams to servers.
//!
//! The pool only needs "connect(host, port, tls) -> stream". [`Connect`] is
//! that seam, [`TcpConnector`] the default implementation over tokio.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::Error;

/// A duplex byte channel.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

pub type BoxStream = Box<dyn ByteStream>;

pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<BoxStream, Error>> + Send>>;

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Local address to bind before connecting.
    pub local_addr: Option<SocketAddr>,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Opens connections.
///
/// Failures should be reported as [`Error::NotResolvable`],
/// [`Error::NotContactable`] or [`Error::Tls`].
pub trait Connect: Send + Sync + 'static {
    fn connect(&self, target: &Target) -> ConnectFuture;
}

#[cfg(feature = "tls")]
type TlsConfig = Option<std::sync::Arc<tokio_rustls::rustls::ClientConfig>>;

#[cfg(not(feature = "tls"))]
type TlsConfig = ();

/// TCP connector with optional TLS.
#[derive(Clone, Default)]
pub struct TcpConnector {
    tls: TlsConfig,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this rustls config instead of one with the webpki roots.
    #[cfg(feature = "tls")]
    pub fn with_tls_config(config: std::sync::Arc<tokio_rustls::rustls::ClientConfig>) -> Self {
        TcpConnector { tls: Some(config) }
    }
}

impl fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnector").finish()
    }
}

impl Connect for TcpConnector {
    fn connect(&self, target: &Target) -> ConnectFuture {
        let target = target.clone();
        let tls = self.tls.clone();

        Box::pin(async move {
            let tcp = connect_tcp(&target).await?;

            if !target.tls {
                return Ok(Box::new(tcp) as BoxStream);
            }

            wrap_tls(tcp, &target, tls).await
        })
    }
}

#[cfg(feature = "tls")]
async fn wrap_tls(tcp: TcpStream, target: &Target, config: TlsConfig) -> Result<BoxStream, Error> {
    let stream = tls::wrap(tcp, &target.host, config).await?;
    Ok(Box::new(stream))
}

#[cfg(not(feature = "tls"))]
async fn wrap_tls(_tcp: TcpStream, target: &Target, _config: TlsConfig) -> Result<BoxStream, Error> {
    Err(Error::Tls(format!("{} requires the tls feature", target)))
}

async fn connect_tcp(target: &Target) -> Result<TcpStream, Error> {
    // Uri hosts keep the brackets around IPv6 literals.
    let host = target.host.trim_start_matches('[').trim_end_matches(']');

    let addrs: Vec<SocketAddr> = lookup_host((host, target.port))
        .await
        .map_err(|e| Error::NotResolvable(format!("{}: {}", host, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(Error::NotResolvable(host.to_string()));
    }

    let mut last_err: Option<io::Error> = None;

    for addr in addrs {
        trace!("Try connect: {}", addr);

        match connect_addr(addr, target.local_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!("Connected to {} ({})", target, addr);
                return Ok(stream);
            }
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    let reason = last_err.map(|e| e.to_string()).unwrap_or_default();

    Err(Error::NotContactable(format!("{}: {}", target, reason)))
}

async fn connect_addr(addr: SocketAddr, local: Option<SocketAddr>) -> io::Result<TcpStream> {
    let Some(local) = local else {
        return TcpStream::connect(addr).await;
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    socket.bind(local)?;
    socket.connect(addr).await
}

#[cfg(feature = "tls")]
mod tls {
    use std::sync::Arc;

    use tokio::net::TcpStream;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    use crate::Error;

    fn default_config() -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    pub(super) async fn wrap(
        tcp: TcpStream,
        host: &str,
        config: Option<Arc<ClientConfig>>,
    ) -> Result<TlsStream<TcpStream>, Error> {
        let config = config.unwrap_or_else(default_config);

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Tls(format!("{}: {}", host, e)))?;

        let stream = TlsConnector::from(config)
            .connect(name, tcp)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;

        debug!("TLS handshake done: {}", host);

        Ok(stream)
    }
}
