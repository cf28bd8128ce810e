use std::num::NonZeroU32;

use crate::proto::{Flags, MessageType};
use crate::{Body, MessageBuf, MessageKind, ObjectPath, Signature};

/// A borrowed message: the typed header fields plus a read-only view of the
/// body.
///
/// This is the borrowed variant of [`MessageBuf`]; convert with
/// [`Message::to_owned`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<'a> {
    /// The type-specific fields of the message.
    pub(crate) kind: MessageKind<'a>,
    /// Serial of the message.
    pub(crate) serial: NonZeroU32,
    /// Message flags.
    pub(crate) flags: Flags,
    /// The interface of the message.
    pub(crate) interface: Option<&'a str>,
    /// The destination of the message.
    pub(crate) destination: Option<&'a str>,
    /// The sender of the message.
    pub(crate) sender: Option<&'a str>,
    /// The body of the message.
    pub(crate) body: Body<'a>,
}

impl<'a> Message<'a> {
    /// Construct a method call.
    pub fn method_call(path: &'a ObjectPath, member: &'a str, serial: NonZeroU32) -> Self {
        Self {
            kind: MessageKind::MethodCall { path, member },
            serial,
            flags: Flags::EMPTY,
            interface: None,
            destination: None,
            sender: None,
            body: Body::empty(),
        }
    }

    /// Construct a signal.
    pub fn signal(path: &'a ObjectPath, member: &'a str, serial: NonZeroU32) -> Self {
        Self {
            kind: MessageKind::Signal { path, member },
            serial,
            flags: Flags::EMPTY,
            interface: None,
            destination: None,
            sender: None,
            body: Body::empty(),
        }
    }

    /// Construct a method return replying to this message, with sender and
    /// destination swapped.
    pub fn method_return(&self, serial: NonZeroU32) -> Self {
        Self {
            kind: MessageKind::MethodReturn {
                reply_serial: self.serial,
            },
            serial,
            flags: Flags::EMPTY,
            interface: None,
            destination: self.sender,
            sender: self.destination,
            body: Body::empty(),
        }
    }

    /// Construct an error replying to this message, with sender and
    /// destination swapped.
    pub fn error(&self, error_name: &'a str, serial: NonZeroU32) -> Self {
        Self {
            kind: MessageKind::Error {
                error_name,
                reply_serial: self.serial,
            },
            serial,
            flags: Flags::EMPTY,
            interface: None,
            destination: self.sender,
            sender: self.destination,
            body: Body::empty(),
        }
    }

    /// Convert into an owned [`MessageBuf`], copying the body.
    pub fn to_owned(&self) -> MessageBuf {
        MessageBuf::from_message(self)
    }

    /// The type-specific fields of the message.
    pub fn kind(&self) -> MessageKind<'a> {
        self.kind
    }

    /// The wire message type.
    pub fn message_type(&self) -> MessageType {
        self.kind.message_type()
    }

    /// The serial of the message.
    pub fn serial(&self) -> NonZeroU32 {
        self.serial
    }

    /// The flags of the message.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// The interface of the message, if any.
    pub fn interface(&self) -> Option<&'a str> {
        self.interface
    }

    /// The destination of the message, if any.
    pub fn destination(&self) -> Option<&'a str> {
        self.destination
    }

    /// The sender of the message, if any.
    pub fn sender(&self) -> Option<&'a str> {
        self.sender
    }

    /// The signature of the body.
    pub fn signature(&self) -> &'a Signature {
        self.body.signature()
    }

    /// A read-only view of the body.
    pub fn body(&self) -> Body<'a> {
        self.body.clone()
    }

    /// Modify the flags of the message.
    #[must_use]
    pub fn with_flags(self, flags: Flags) -> Self {
        Self { flags, ..self }
    }

    /// Modify the interface of the message.
    #[must_use]
    pub fn with_interface(self, interface: &'a str) -> Self {
        Self {
            interface: Some(interface),
            ..self
        }
    }

    /// Modify the destination of the message.
    #[must_use]
    pub fn with_destination(self, destination: &'a str) -> Self {
        Self {
            destination: Some(destination),
            ..self
        }
    }

    /// Modify the sender of the message.
    #[must_use]
    pub fn with_sender(self, sender: &'a str) -> Self {
        Self {
            sender: Some(sender),
            ..self
        }
    }

    /// Modify the body of the message.
    #[must_use]
    pub fn with_body(self, body: Body<'a>) -> Self {
        Self { body, ..self }
    }
}
