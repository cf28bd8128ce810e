use std::num::NonZeroU32;

use crate::ObjectPath;
use crate::proto::MessageType;

/// The type-specific fields of a borrowed [`Message`].
///
/// [`Message`]: crate::Message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind<'a> {
    /// A method call, which may prompt a reply.
    MethodCall {
        /// The path of the object the call is addressed to.
        path: &'a ObjectPath,
        /// The method being called.
        member: &'a str,
    },
    /// A reply carrying returned data.
    MethodReturn {
        /// The serial of the call this replies to.
        reply_serial: NonZeroU32,
    },
    /// An error reply.
    Error {
        /// The name of the error.
        error_name: &'a str,
        /// The serial of the call this replies to.
        reply_serial: NonZeroU32,
    },
    /// A signal emission.
    Signal {
        /// The path of the object emitting the signal.
        path: &'a ObjectPath,
        /// The member of the emitted signal.
        member: &'a str,
    },
}

impl MessageKind<'_> {
    /// The wire message type of the kind.
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageKind::MethodCall { .. } => MessageType::METHOD_CALL,
            MessageKind::MethodReturn { .. } => MessageType::METHOD_RETURN,
            MessageKind::Error { .. } => MessageType::ERROR,
            MessageKind::Signal { .. } => MessageType::SIGNAL,
        }
    }
}
