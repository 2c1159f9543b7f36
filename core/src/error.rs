use std::fmt;
use std::io;

pub const RPC_ERR_PREFIX: &'static str = "rpc_";

/// Status codes carried in the `err_code` field of a response packet.
///
/// A handler may return any other value, the transport carries it verbatim.
pub mod code {
    pub const OK: u32 = 0;
    /// The request names a command that has no registered handler
    pub const INVALID_PARAM: u32 = 400;
    /// The handler panicked while serving the request
    pub const INTERNAL_SERVER_ERROR: u32 = 500;
}

/// "rpc_" prefix is reserved for internal error
///
/// NOTE Only `Timeout` is retried by the client, see [RpcErr::is_retriable]
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    PartialEq,
    Eq,
    PartialOrd,
    Clone,
    Copy,
    thiserror::Error,
)]
#[repr(u8)]
pub enum RpcErr {
    /// Call exceeded its deadline
    #[strum(serialize = "rpc_timeout")]
    Timeout = 0,
    /// Decode, checksum or sentinel failure, the stream is no longer trustworthy
    #[strum(serialize = "rpc_invalid_frame")]
    InvalidFrame = 1,
    /// Request queue or pending table capacity exceeded
    #[strum(serialize = "rpc_overflow")]
    Overflow = 2,
    /// Handler panic or uncaught failure
    #[strum(serialize = "rpc_internal_err")]
    InternalServerError = 3,
    /// Unknown command id
    #[strum(serialize = "rpc_invalid_param")]
    InvalidParam = 4,
    /// Socket error
    #[strum(serialize = "rpc_io_err")]
    IO = 5,
    /// Connect failed after all attempts
    #[strum(serialize = "rpc_unreachable")]
    Unreachable = 6,
    /// Peer closed the connection, or the local side is stopping
    #[strum(serialize = "rpc_closed")]
    Closed = 7,
}

// The default Debug derive just ignore strum customized string, by strum only have a Display derive
impl fmt::Debug for RpcErr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl RpcErr {
    #[inline]
    pub fn as_bytes<'a>(&'a self) -> &'a [u8] {
        self.as_ref().as_bytes()
    }

    /// Whether the client retry loop should re-issue the call.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        *self == RpcErr::Timeout
    }

    /// Map a coded error response onto the taxonomy, None for codes owned by the application.
    #[inline]
    pub fn from_code(err_code: u32) -> Option<Self> {
        match err_code {
            code::INVALID_PARAM => Some(RpcErr::InvalidParam),
            code::INTERNAL_SERVER_ERROR => Some(RpcErr::InternalServerError),
            _ => None,
        }
    }
}

impl From<io::Error> for RpcErr {
    #[inline(always)]
    fn from(e: io::Error) -> Self {
        // A socket timeout is a broken connection, not an expired call deadline
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::IO,
        }
    }
}
