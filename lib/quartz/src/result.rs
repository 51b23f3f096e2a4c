use std::fmt;
use std::io;

/// Transport error codes as they appear in CLOSE frames.
pub const ERR_NONE: u16 = 0x0;
pub const ERR_INTERNAL: u16 = 0x1;
pub const ERR_FLOW_CONTROL: u16 = 0x3;
pub const ERR_STREAM_ID: u16 = 0x4;
pub const ERR_FRAME_ENC: u16 = 0x7;
pub const ERR_TRANSPORT_PARAMETER: u16 = 0x8;
pub const ERR_PROTOCOL_VIOLATION: u16 = 0xa;

/// TLS alerts map into the transport error space above 0x100.
#[inline]
pub const fn err_tls(alert: u8) -> u16 {
    0x100 + alert as u16
}

pub type QuicResult<T> = Result<T, QuicError>;

/// Errors raised by the protocol core.
///
/// `Need` is the recoverable case: not enough bytes arrived yet (or the socket would block) and
/// the operation should be retried later. Everything else is fatal for the connection and carries
/// the wire error code a CLOSE frame will use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuicError {
    Need,
    Close {
        code: u16,
        frame: u8,
        reason: String,
    },
}

impl QuicError {
    #[inline]
    pub fn close<R: Into<String>>(code: u16, frame: u8, reason: R) -> QuicError {
        QuicError::Close {
            code,
            frame,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for QuicError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QuicError::Need => write!(f, "insufficient data"),
            QuicError::Close { code, frame, reason } => {
                write!(f, "close err=0x{:04x} frame=0x{:02x}: {}", code, frame, reason)
            }
        }
    }
}

impl From<io::Error> for QuicError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => QuicError::Need,
            kind => QuicError::close(ERR_INTERNAL, 0, format!("io error: {:?}", kind)),
        }
    }
}

pub trait ErrorUtils {
    /// True when the result is neither success nor the recoverable wait case.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for QuicResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(QuicError::Need) => false,
            _ => true,
        }
    }
}
