//! Stream dialing: TCP and Unix sockets, with optional TLS on TCP.

use std::fmt;
use std::io;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::Options;

/// Address of one server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    /// TCP host and port.
    Tcp(String, u16),
    /// Filesystem path of a local socket.
    Unix(PathBuf),
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddr::Tcp(host, port) => write!(f, "{host}:{port}"),
            ServerAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<(&str, u16)> for ServerAddr {
    fn from((host, port): (&str, u16)) -> ServerAddr {
        ServerAddr::Tcp(host.to_owned(), port)
    }
}

impl From<PathBuf> for ServerAddr {
    fn from(path: PathBuf) -> ServerAddr {
        ServerAddr::Unix(path)
    }
}

/// TLS settings for TCP endpoints.
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsOptions {
    /// Client TLS configuration.
    pub config: std::sync::Arc<rustls::ClientConfig>,
    /// Server name presented for certificate validation.
    pub server_name: String,
}

#[cfg(feature = "tls")]
impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

pub(crate) trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

/// One established, possibly TLS-wrapped stream.
pub(crate) type IoStream = Box<dyn RawStream>;

/// Dials streams for connection attempts. Read-only after construction.
#[derive(Clone)]
pub(crate) struct Dialer {
    #[cfg(feature = "tls")]
    tls: Option<TlsOptions>,
}

impl Dialer {
    pub fn new(options: &Options) -> Dialer {
        #[cfg(not(feature = "tls"))]
        let _ = options;
        Dialer {
            #[cfg(feature = "tls")]
            tls: options.tls.clone(),
        }
    }

    pub async fn connect(&self, addr: &ServerAddr) -> io::Result<IoStream> {
        match addr {
            ServerAddr::Tcp(host, port) => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                // frames are small; send them immediately
                stream.set_nodelay(true)?;

                #[cfg(feature = "tls")]
                if let Some(tls) = &self.tls {
                    let connector = tokio_rustls::TlsConnector::from(tls.config.clone());
                    let name = rustls::pki_types::ServerName::try_from(tls.server_name.clone())
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
                    let stream = connector.connect(name, stream).await?;
                    return Ok(Box::new(stream));
                }

                Ok(Box::new(stream))
            }
            ServerAddr::Unix(path) => {
                #[cfg(unix)]
                {
                    Ok(Box::new(UnixStream::connect(path).await?))
                }
                #[cfg(not(unix))]
                {
                    let _ = path;
                    Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "local sockets are not available on this platform",
                    ))
                }
            }
        }
    }
}
