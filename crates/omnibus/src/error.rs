use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;

use crate::proto::{FieldCode, Type};
use crate::{ObjectPathError, SignatureError};

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }

    #[inline]
    pub(crate) fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Construct an error indicating memory pressure.
    ///
    /// Routing reports this error to roll transactions back and trigger the
    /// main loop's back-off.
    #[inline]
    pub fn no_memory() -> Error {
        Self::new(ErrorKind::NoMemory)
    }

    /// Test if the error was caused by memory pressure.
    #[inline]
    pub fn is_no_memory(&self) -> bool {
        matches!(self.kind, ErrorKind::NoMemory)
    }
}

impl From<SignatureError> for Error {
    #[inline]
    fn from(error: SignatureError) -> Self {
        Self::new(ErrorKind::Signature(error))
    }
}

impl From<ObjectPathError> for Error {
    #[inline]
    fn from(error: ObjectPathError) -> Self {
        Self::new(ErrorKind::ObjectPath(error))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::WouldBlock => Self::new(ErrorKind::WouldBlock),
            _ => Self::new(ErrorKind::Io(error)),
        }
    }
}

impl From<Utf8Error> for Error {
    #[inline]
    fn from(error: Utf8Error) -> Self {
        Self::new(ErrorKind::Utf8Error(error))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Io(..) => write!(f, "I/O error"),
            ErrorKind::Signature(..) => write!(f, "Signature error"),
            ErrorKind::ObjectPath(..) => write!(f, "Object path error"),
            ErrorKind::Utf8Error(..) => write!(f, "UTF-8 error"),
            ErrorKind::WouldBlock => write!(f, "Would block"),
            ErrorKind::BufferUnderflow => write!(f, "Buffer underflow"),
            ErrorKind::NotNullTerminated => write!(f, "String is not null terminated"),
            ErrorKind::NoMemory => write!(f, "Out of memory"),
            ErrorKind::InvalidAddress => write!(f, "Invalid bus address"),
            ErrorKind::InvalidSasl => write!(f, "Invalid authentication exchange"),
            ErrorKind::InvalidProtocol => write!(f, "Invalid protocol"),
            ErrorKind::InvalidBoolean => write!(f, "Boolean is not zero or one"),
            ErrorKind::MissingPath => write!(f, "Missing required PATH header"),
            ErrorKind::MissingInterface => write!(f, "Missing required INTERFACE header"),
            ErrorKind::MissingMember => write!(f, "Missing required MEMBER header"),
            ErrorKind::MissingReplySerial => {
                write!(f, "Missing required REPLY_SERIAL header")
            }
            ErrorKind::MissingErrorName => write!(f, "Missing required ERROR_NAME header"),
            ErrorKind::MissingDestination => {
                write!(f, "Missing required DESTINATION header")
            }
            ErrorKind::UnexpectedField(field) => {
                write!(f, "Header field {field:?} not allowed for message type")
            }
            ErrorKind::ZeroSerial => write!(f, "Zero in header serial"),
            ErrorKind::ZeroReplySerial => write!(f, "Zero REPLY_SERIAL header"),
            ErrorKind::ArrayTooLong(length) => {
                write!(f, "Array of length {length} is too long (max is 67108864)")
            }
            ErrorKind::BodyTooLong(length) => {
                write!(f, "Body of length {length} is too long (max is 134217728)")
            }
            ErrorKind::HeaderTooLong(length) => {
                write!(
                    f,
                    "Header of length {length} is too long (max is 134217728)"
                )
            }
            ErrorKind::SignatureMismatch => {
                write!(f, "Body does not match its declared signature")
            }
            ErrorKind::NotAContainer(ty) => {
                write!(f, "Cannot recurse into non-container type {ty:?}")
            }
            ErrorKind::NotABasicType(ty) => {
                write!(f, "Not a basic type: {ty:?}")
            }
            ErrorKind::TypeMismatch { expected, actual } => {
                write!(f, "Expected type {expected:?} but wrote {actual:?}")
            }
            ErrorKind::EmptyArray => {
                write!(f, "Cannot recurse into an empty array")
            }
            ErrorKind::NotSingleCompleteType => {
                write!(f, "Signature does not contain exactly one complete type")
            }
            ErrorKind::TypesOnly => {
                write!(f, "Reader has no values to read")
            }
            ErrorKind::IncompleteContainer => {
                write!(f, "Closed container before its signature was complete")
            }
            ErrorKind::MismatchedContainer => {
                write!(f, "Close does not match the innermost open container")
            }
            ErrorKind::InvalidMatchRule => write!(f, "Invalid match rule"),
            ErrorKind::Disconnected => write!(f, "Peer disconnected"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(error) => Some(error),
            ErrorKind::Signature(error) => Some(error),
            ErrorKind::ObjectPath(error) => Some(error),
            ErrorKind::Utf8Error(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Io(io::Error),
    Signature(SignatureError),
    ObjectPath(ObjectPathError),
    Utf8Error(Utf8Error),
    WouldBlock,
    BufferUnderflow,
    NotNullTerminated,
    NoMemory,
    InvalidAddress,
    InvalidSasl,
    InvalidProtocol,
    InvalidBoolean,
    MissingPath,
    MissingInterface,
    MissingMember,
    MissingReplySerial,
    MissingErrorName,
    MissingDestination,
    UnexpectedField(FieldCode),
    ZeroSerial,
    ZeroReplySerial,
    ArrayTooLong(u32),
    BodyTooLong(u32),
    HeaderTooLong(u32),
    SignatureMismatch,
    NotAContainer(Type),
    NotABasicType(Type),
    TypeMismatch { expected: Type, actual: Type },
    EmptyArray,
    NotSingleCompleteType,
    TypesOnly,
    IncompleteContainer,
    MismatchedContainer,
    InvalidMatchRule,
    Disconnected,
}
