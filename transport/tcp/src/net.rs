//! abstract the common interface for Tcp & Unix

use std::os::unix::fs::PermissionsExt;
use std::str::FromStr;
use std::{
    fmt, fs, io,
    net::{AddrParseError, IpAddr, SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
};

use log::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream, tcp, unix};
use wirerpc_core::SocketOptions;
use wirerpc_core::io::{AsyncConn, AsyncListener, AsyncRead, AsyncWrite};

/// Unify behavior of tcp & unix addr
#[derive(Clone)]
pub enum UnifyAddr {
    Socket(SocketAddr),
    Path(PathBuf),
}

/// Unify behavior of tcp & unix stream
pub enum UnifyStream {
    Tcp(TcpStream),
    /// With the socket path, unix peers have no address of their own
    Unix(UnixStream, String),
}

/// Unify behavior of tcp & unix socket listener
pub enum UnifyListener {
    Tcp(TcpListener, SocketOptions),
    Unix(UnixListener, PathBuf),
}

/// The read half of a [UnifyStream]
pub enum UnifyReader {
    Tcp(tcp::OwnedReadHalf),
    Unix(unix::OwnedReadHalf),
}

/// The write half of a [UnifyStream]
pub enum UnifyWriter {
    Tcp(tcp::OwnedWriteHalf),
    Unix(unix::OwnedWriteHalf),
}

impl fmt::Display for UnifyAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(s) => write!(f, "{}", s),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

impl fmt::Debug for UnifyAddr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for UnifyAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('/') {
            return Ok(Self::Path(PathBuf::from(s)));
        }
        match s.parse::<SocketAddr>() {
            Ok(a) => Ok(Self::Socket(a)),
            // Can't directly resolve the IP, try to resolve it through the domain name.
            // If multiple IP addresses are resolved, only the first result is taken
            Err(e) => match s.to_socket_addrs() {
                Ok(mut v) => match v.next() {
                    Some(a) => Ok(Self::Socket(a)),
                    None => Err(e),
                },
                Err(_) => Err(e),
            },
        }
    }
}

impl UnifyAddr {
    /// Like `from_str`, but resolves host names without blocking the runtime.
    ///
    /// If multiple IP addresses are resolved, only the first result is taken.
    pub async fn resolve(s: &str) -> io::Result<Self> {
        if s.starts_with('/') {
            return Ok(Self::Path(PathBuf::from(s)));
        }
        if let Ok(a) = s.parse::<SocketAddr>() {
            return Ok(Self::Socket(a));
        }
        match tokio::net::lookup_host(s).await?.next() {
            Some(a) => Ok(Self::Socket(a)),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("addr {:?} resolved to nothing", s),
            )),
        }
    }
}

impl PartialEq<str> for UnifyAddr {
    fn eq(&self, other: &str) -> bool {
        match self {
            Self::Socket(s) => {
                match other.parse::<SocketAddr>() {
                    Ok(addr) => *s == addr,
                    Err(_) => {
                        // compatibility case: ‘other’ is IpAddr
                        match other.parse::<IpAddr>() {
                            Ok(addr) => s.ip() == addr,
                            Err(_) => false,
                        }
                    }
                }
            }
            Self::Path(p) => p == Path::new(other),
        }
    }
}

/// Apply keep-alive idle time to a tcp socket
fn set_keepalive(stream: &TcpStream, idle: std::time::Duration) -> io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};
    setsockopt(stream, sockopt::KeepAlive, &true)?;
    #[cfg(target_os = "linux")]
    {
        let secs = idle.as_secs().clamp(1, u32::MAX as u64) as u32;
        setsockopt(stream, sockopt::TcpKeepIdle, &secs)?;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = idle;
    Ok(())
}

impl UnifyStream {
    pub(crate) fn from_tcp(stream: TcpStream, opts: &SocketOptions) -> io::Result<Self> {
        if opts.nodelay {
            stream.set_nodelay(true)?;
        }
        if let Some(idle) = opts.keepalive {
            set_keepalive(&stream, idle)?;
        }
        Ok(Self::Tcp(stream))
    }

    #[inline]
    pub(crate) fn from_unix(stream: UnixStream, path: String) -> Self {
        Self::Unix(stream, path)
    }
}

impl fmt::Debug for UnifyStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp(s) => match (s.local_addr(), s.peer_addr()) {
                (Ok(addr), Ok(peer)) => write!(f, "{}->{}", addr, peer),
                (Ok(addr), Err(_)) => write!(f, "{}", addr),
                _ => write!(f, "tcp addr unknown"),
            },
            Self::Unix(_, path) => write!(f, "{}", path),
        }
    }
}

impl AsyncConn for UnifyStream {
    type Reader = UnifyReader;
    type Writer = UnifyWriter;

    fn peer_addr(&self) -> String {
        match self {
            Self::Tcp(s) => match s.peer_addr() {
                Ok(addr) => addr.to_string(),
                Err(_) => "tcp peer unknown".to_string(),
            },
            Self::Unix(_, path) => path.clone(),
        }
    }

    fn into_split(self) -> (UnifyReader, UnifyWriter) {
        match self {
            Self::Tcp(s) => {
                let (r, w) = s.into_split();
                (UnifyReader::Tcp(r), UnifyWriter::Tcp(w))
            }
            Self::Unix(s, _) => {
                let (r, w) = s.into_split();
                (UnifyReader::Unix(r), UnifyWriter::Unix(w))
            }
        }
    }
}

impl AsyncRead for UnifyReader {
    #[inline]
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf).await,
            Self::Unix(s) => s.read(buf).await,
        }
    }
}

impl AsyncWrite for UnifyWriter {
    #[inline]
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf).await,
            Self::Unix(s) => s.write(buf).await,
        }
    }

    /// Shutdown the write direction, the peer reads EOF
    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => AsyncWriteExt::shutdown(s).await,
            Self::Unix(s) => AsyncWriteExt::shutdown(s).await,
        }
    }
}

impl fmt::Debug for UnifyReader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp(s) => write!(f, "tcp reader {:?}", s.peer_addr().ok()),
            Self::Unix(_) => write!(f, "unix reader"),
        }
    }
}

impl fmt::Debug for UnifyWriter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp(s) => write!(f, "tcp writer {:?}", s.peer_addr().ok()),
            Self::Unix(_) => write!(f, "unix writer"),
        }
    }
}

impl AsyncListener for UnifyListener {
    type Conn = UnifyStream;

    /// Must be called inside a tokio runtime
    fn bind(addr: &str, opts: &SocketOptions) -> io::Result<Self> {
        match UnifyAddr::from_str(addr) {
            Err(e) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("addr {:?} invalid: {:?}", addr, e),
            )),
            Ok(UnifyAddr::Socket(a)) => {
                let l = std::net::TcpListener::bind(a)?;
                l.set_nonblocking(true)?;
                Ok(Self::Tcp(TcpListener::from_std(l)?, opts.clone()))
            }
            Ok(UnifyAddr::Path(path)) => {
                // A stale socket file from the last run
                if path.exists() {
                    fs::remove_file(&path)?;
                }
                let l = UnixListener::bind(&path)?;
                if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(0o666)) {
                    error!("cannot set permissions of {}: {:?}", path.display(), e);
                    return Err(e);
                }
                Ok(Self::Unix(l, path))
            }
        }
    }

    #[inline]
    async fn accept(&mut self) -> io::Result<UnifyStream> {
        match self {
            Self::Tcp(l, opts) => loop {
                let (stream, peer) = l.accept().await?;
                match UnifyStream::from_tcp(stream, opts) {
                    Ok(s) => return Ok(s),
                    // Only this socket is bad, keep the listener going
                    Err(e) => warn!("drop accepted {}: setsockopt failed: {}", peer, e),
                }
            },
            Self::Unix(l, path) => {
                let (stream, _) = l.accept().await?;
                Ok(UnifyStream::from_unix(stream, path.display().to_string()))
            }
        }
    }

    #[inline]
    fn local_addr(&self) -> io::Result<String> {
        match self {
            Self::Tcp(l, _) => Ok(l.local_addr()?.to_string()),
            Self::Unix(_, path) => Ok(path.display().to_string()),
        }
    }
}

impl Drop for UnifyListener {
    fn drop(&mut self) {
        if let Self::Unix(_, path) = self {
            let _ = fs::remove_file(path);
        }
    }
}

impl fmt::Debug for UnifyListener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp(l, _) => match l.local_addr() {
                Ok(addr) => write!(f, "listener {}", addr),
                Err(_) => write!(f, "tcp listener unknown"),
            },
            Self::Unix(_, path) => write!(f, "listener {}", path.display()),
        }
    }
}
