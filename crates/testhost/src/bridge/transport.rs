//! Local duplex channel between a controller and a test host.
//!
//! Endpoint flavours:
//! - **Named**: filesystem Unix socket (macOS, Linux, BSD), removed on drop
//! - **Abstract**: Linux abstract namespace (no filesystem entry, auto-cleanup)
//!
//! The controller binds and accepts exactly one connection; the host connects
//! with exponential backoff because it may start before the listener is up.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("timed out connecting to {endpoint} after {elapsed:?}")]
    ConnectTimeout { endpoint: String, elapsed: Duration },

    #[error("invalid endpoint descriptor: {0}")]
    InvalidEndpoint(String),

    #[error("channel I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Where a test host finds its controller. Travels to the child as JSON in an
/// environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointName {
    Named {
        path: PathBuf,
    },
    #[cfg(target_os = "linux")]
    Abstract {
        name: String,
    },
}

impl EndpointName {
    /// A fresh, unique endpoint using the platform default flavour.
    pub fn generate() -> Self {
        let unique = format!(
            "testhost-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        );
        #[cfg(target_os = "linux")]
        {
            Self::Abstract { name: unique }
        }
        #[cfg(not(target_os = "linux"))]
        {
            Self::Named {
                path: std::env::temp_dir().join(format!("{unique}.sock")),
            }
        }
    }

    pub fn named(path: impl Into<PathBuf>) -> Self {
        Self::Named { path: path.into() }
    }

    pub fn to_env_value(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::InvalidEndpoint(e.to_string()))
    }

    pub fn from_env_value(value: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(value).map_err(|e| ChannelError::InvalidEndpoint(e.to_string()))
    }
}

impl fmt::Display for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named { path } => write!(f, "{}", path.display()),
            #[cfg(target_os = "linux")]
            Self::Abstract { name } => write!(f, "@{name}"),
        }
    }
}

/// A connected duplex byte stream.
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// In-process connected pair.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a), Self::from_stream(b)))
    }

    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

/// Server side of an endpoint. Accepts a single connection.
#[derive(Debug)]
pub struct ChannelListener {
    endpoint: EndpointName,
    listener: UnixListener,
    cleanup_path: Option<PathBuf>,
}

impl ChannelListener {
    pub fn bind(endpoint: &EndpointName) -> Result<Self, ChannelError> {
        use std::os::unix::net::UnixListener as StdUnixListener;

        let (std_listener, cleanup_path) = match endpoint {
            EndpointName::Named { path } => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                (StdUnixListener::bind(path)?, Some(path.clone()))
            }
            #[cfg(target_os = "linux")]
            EndpointName::Abstract { name } => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::SocketAddr;

                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                (StdUnixListener::bind_addr(&addr)?, None)
            }
        };
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        tracing::debug!(endpoint = %endpoint, "Bound endpoint");
        Ok(Self {
            endpoint: endpoint.clone(),
            listener,
            cleanup_path,
        })
    }

    pub fn endpoint(&self) -> &EndpointName {
        &self.endpoint
    }

    pub async fn accept(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Channel, ChannelError> {
        let started = Instant::now();
        let timed_out = || ChannelError::ConnectTimeout {
            endpoint: self.endpoint.to_string(),
            elapsed: started.elapsed(),
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(timed_out()),
            accepted = tokio::time::timeout(timeout, self.listener.accept()) => match accepted {
                Ok(Ok((stream, _))) => {
                    tracing::debug!(endpoint = %self.endpoint, "Peer connected");
                    Ok(Channel::from_stream(stream))
                }
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(timed_out()),
            },
        }
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        let Some(path) = &self.cleanup_path else {
            return;
        };
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket file");
            }
            _ => {}
        }
    }
}

async fn try_connect(endpoint: &EndpointName) -> io::Result<UnixStream> {
    match endpoint {
        EndpointName::Named { path } => UnixStream::connect(path).await,
        #[cfg(target_os = "linux")]
        EndpointName::Abstract { name } => {
            use std::os::linux::net::SocketAddrExt;
            use std::os::unix::net::SocketAddr;

            // tokio doesn't support abstract sockets directly
            let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
            let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            std_stream.set_nonblocking(true)?;
            UnixStream::from_std(std_stream)
        }
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

/// Connect to `endpoint`, retrying with exponential backoff while the
/// listener is not up yet.
pub async fn connect(
    endpoint: &EndpointName,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Channel, ChannelError> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut backoff = INITIAL_BACKOFF;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match try_connect(endpoint).await {
            Ok(stream) => {
                tracing::debug!(endpoint = %endpoint, attempts, "Connected");
                return Ok(Channel::from_stream(stream));
            }
            Err(e) if is_retryable(&e) => {
                tracing::trace!(endpoint = %endpoint, attempts, error = %e, "Endpoint not ready");
            }
            Err(e) => return Err(e.into()),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ChannelError::ConnectTimeout {
                endpoint: endpoint.to_string(),
                elapsed: started.elapsed(),
            });
        }
        let pause = backoff.min(deadline - now);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ChannelError::ConnectTimeout {
                    endpoint: endpoint.to_string(),
                    elapsed: started.elapsed(),
                });
            }
            _ = tokio::time::sleep(pause) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
