use std::io;

pub type ProtoResult<T> = Result<T, ProtoError>;

/// Mirrors the `Wait` / `Fatal` split the daemon uses everywhere a socket operation can
/// either be incomplete (try again on the next readiness event) or broken beyond repair
/// (close the session or device).
#[derive(Debug, Eq, PartialEq)]
pub enum ProtoError {
    /// The operation would block; not an error, just "nothing to do yet".
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The header declared a length outside the valid range for its message type.
    SizeOutOfRange,
    /// The body length did not match the declared/embedded count fields.
    SizeMismatch,
    /// `type` in the header is not one of the closed set of message types.
    UnknownMessageType(u32),
    /// The 16-byte magic string did not match.
    BadMagic,
    /// The endian sentinel was neither the canonical value nor its byte-swap.
    BadEndianMagic,
    /// `ConnectRequest.version` does not match this daemon's `COMPAT_VERSION`.
    IncompatibleVersion,
    /// A message arrived while the session was in a state that does not accept it.
    UnexpectedMessage,
    Io(io::ErrorKind),
}

impl From<io::Error> for ProtoError {
    #[inline]
    fn from(err: io::Error) -> ProtoError {
        match err.kind() {
            io::ErrorKind::WouldBlock => ProtoError::Wait,
            kind => ProtoError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

/// Augments a `Result` with the "did this fail for real, or just block" question, following
/// the same convention the wire codec uses for every I/O result.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for ProtoResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(ProtoError::Wait))
    }
}
