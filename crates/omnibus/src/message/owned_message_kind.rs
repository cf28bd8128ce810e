use std::num::NonZeroU32;

use crate::{MessageKind, ObjectPath};

/// The owned variant of [`MessageKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OwnedMessageKind {
    MethodCall {
        path: Box<ObjectPath>,
        member: Box<str>,
    },
    MethodReturn {
        reply_serial: NonZeroU32,
    },
    Error {
        error_name: Box<str>,
        reply_serial: NonZeroU32,
    },
    Signal {
        path: Box<ObjectPath>,
        member: Box<str>,
    },
}

impl OwnedMessageKind {
    /// Borrow as a [`MessageKind`].
    pub(crate) fn borrow(&self) -> MessageKind<'_> {
        match self {
            OwnedMessageKind::MethodCall { path, member } => MessageKind::MethodCall {
                path,
                member,
            },
            OwnedMessageKind::MethodReturn { reply_serial } => MessageKind::MethodReturn {
                reply_serial: *reply_serial,
            },
            OwnedMessageKind::Error {
                error_name,
                reply_serial,
            } => MessageKind::Error {
                error_name,
                reply_serial: *reply_serial,
            },
            OwnedMessageKind::Signal { path, member } => MessageKind::Signal { path, member },
        }
    }
}

impl MessageKind<'_> {
    /// Convert into an [`OwnedMessageKind`].
    pub(crate) fn to_owned(self) -> OwnedMessageKind {
        match self {
            MessageKind::MethodCall { path, member } => OwnedMessageKind::MethodCall {
                path: path.into(),
                member: member.into(),
            },
            MessageKind::MethodReturn { reply_serial } => {
                OwnedMessageKind::MethodReturn { reply_serial }
            }
            MessageKind::Error {
                error_name,
                reply_serial,
            } => OwnedMessageKind::Error {
                error_name: error_name.into(),
                reply_serial,
            },
            MessageKind::Signal { path, member } => OwnedMessageKind::Signal {
                path: path.into(),
                member: member.into(),
            },
        }
    }
}
