use std::num::NonZeroU32;

use crate::buf::AlignedBuf;
use crate::message::OwnedMessageKind;
use crate::proto::{Flags, MessageType};
use crate::{Body, BodyBuf, Message, MessageKind, ObjectPath, Signature};

/// An owned message.
///
/// This is the owned variant of a [`Message`]; borrow with
/// [`MessageBuf::borrow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBuf {
    /// The type-specific fields of the message.
    pub(crate) kind: OwnedMessageKind,
    /// Serial of the message.
    pub(crate) serial: NonZeroU32,
    /// Message flags.
    pub(crate) flags: Flags,
    /// The interface of the message.
    pub(crate) interface: Option<Box<str>>,
    /// The destination of the message.
    pub(crate) destination: Option<Box<str>>,
    /// The sender of the message.
    pub(crate) sender: Option<Box<str>>,
    /// The body of the message.
    pub(crate) body: BodyBuf,
}

impl MessageBuf {
    /// Construct a method call.
    #[must_use]
    pub fn method_call(path: Box<ObjectPath>, member: Box<str>, serial: NonZeroU32) -> Self {
        Self {
            kind: OwnedMessageKind::MethodCall { path, member },
            serial,
            flags: Flags::EMPTY,
            interface: None,
            destination: None,
            sender: None,
            body: BodyBuf::new(),
        }
    }

    /// Construct a signal.
    #[must_use]
    pub fn signal(path: Box<ObjectPath>, member: Box<str>, serial: NonZeroU32) -> Self {
        Self {
            kind: OwnedMessageKind::Signal { path, member },
            serial,
            flags: Flags::EMPTY,
            interface: None,
            destination: None,
            sender: None,
            body: BodyBuf::new(),
        }
    }

    /// Construct an owned copy of a borrowed message.
    pub(crate) fn from_message(message: &Message<'_>) -> Self {
        let body = &message.body;

        Self {
            kind: message.kind.to_owned(),
            serial: message.serial,
            flags: message.flags,
            interface: message.interface.map(Box::from),
            destination: message.destination.map(Box::from),
            sender: message.sender.map(Box::from),
            body: BodyBuf::from_parts(
                AlignedBuf::from(body.get()),
                body.signature(),
                body.endianness(),
            ),
        }
    }

    /// Borrow as a [`Message`].
    #[must_use]
    pub fn borrow(&self) -> Message<'_> {
        Message {
            kind: self.kind.borrow(),
            serial: self.serial,
            flags: self.flags,
            interface: self.interface.as_deref(),
            destination: self.destination.as_deref(),
            sender: self.sender.as_deref(),
            body: self.body.as_body(),
        }
    }

    /// The type-specific fields of the message.
    #[must_use]
    pub fn kind(&self) -> MessageKind<'_> {
        self.kind.borrow()
    }

    /// The wire message type.
    pub fn message_type(&self) -> MessageType {
        self.kind().message_type()
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
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// The destination of the message, if any.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// The sender of the message, if any.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// The signature of the body.
    pub fn signature(&self) -> &Signature {
        self.body.signature()
    }

    /// A read-only view of the body.
    #[must_use]
    pub fn body(&self) -> Body<'_> {
        self.body.as_body()
    }

    /// Replace the sender of the message.
    ///
    /// Routing stamps every forwarded message with the unique name of the
    /// originating connection.
    pub fn set_sender(&mut self, sender: &str) {
        self.sender = Some(Box::from(sender));
    }

    /// Modify the flags of the message.
    #[must_use]
    pub fn with_flags(self, flags: Flags) -> Self {
        Self { flags, ..self }
    }

    /// Modify the interface of the message.
    #[must_use]
    pub fn with_interface(self, interface: Box<str>) -> Self {
        Self {
            interface: Some(interface),
            ..self
        }
    }

    /// Modify the destination of the message.
    #[must_use]
    pub fn with_destination(self, destination: Box<str>) -> Self {
        Self {
            destination: Some(destination),
            ..self
        }
    }

    /// Modify the sender of the message.
    #[must_use]
    pub fn with_sender(self, sender: Box<str>) -> Self {
        Self {
            sender: Some(sender),
            ..self
        }
    }

    /// Replace the body and signature of the message with the contents of
    /// the provided body buffer.
    #[must_use]
    pub fn with_body(self, body: BodyBuf) -> Self {
        Self { body, ..self }
    }

    /// A conservative estimate of the marshalled size of the message,
    /// used for outgoing quota accounting.
    pub fn size_hint(&self) -> usize {
        let fields = self.interface.as_deref().map_or(0, str::len)
            + self.destination.as_deref().map_or(0, str::len)
            + self.sender.as_deref().map_or(0, str::len)
            + match &self.kind {
                OwnedMessageKind::MethodCall { path, member } => path.len() + member.len(),
                OwnedMessageKind::Error { error_name, .. } => error_name.len(),
                OwnedMessageKind::Signal { path, member } => path.len() + member.len(),
                OwnedMessageKind::MethodReturn { .. } => 0,
            };

        // Preamble, one field header per field worst case, the body
        // signature, and the body itself.
        64 + fields + 2 * 16 + self.body.signature().len() + self.body.len()
    }
}
