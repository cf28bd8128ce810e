//! A local message bus in the style of D-Bus: a broker daemon which accepts
//! connections over byte-stream transports, names them, and routes typed
//! messages between them under a security policy.
//!
//! The crate is split in two layers:
//!
//! * The wire layer: a self-describing binary format with signature strings,
//!   alignment-sensitive packing and nested containers, exposed through
//!   [`BodyBuf`]/[`Body`], the recursive [`Reader`]/[`Writer`] pair, and the
//!   [`RecvBuf`]/[`SendBuf`] framing buffers.
//! * The broker layer: the [`bus::Broker`] with its single-threaded
//!   cooperative [`mainloop`], name registry, match store and transactional
//!   dispatcher.

#![allow(clippy::module_inception)]

#[doc(inline)]
pub use self::proto::{Endianness, FieldCode, Flags, MessageType, Type};
pub(crate) mod proto;

#[doc(inline)]
pub use self::error::{Error, Result};
mod error;

#[doc(inline)]
pub use self::frame::Frame;
mod frame;

pub(crate) mod buf;

#[doc(inline)]
pub use self::read::Read;
mod read;

#[doc(inline)]
pub use self::write::Write;
mod write;

#[doc(inline)]
pub use self::object_path::{ObjectPath, ObjectPathError};
mod object_path;

#[doc(inline)]
pub use self::body::{Basic, Body, Reader};
mod body;

#[doc(inline)]
pub use self::body_buf::{BodyBuf, Writer};
mod body_buf;

#[doc(inline)]
pub use self::message::{Message, MessageBuf, MessageKind};
mod message;

#[doc(inline)]
pub use self::recv::RecvBuf;
mod recv;

#[doc(inline)]
pub use self::send::SendBuf;
mod send;

#[doc(inline)]
pub use self::sasl::SaslServer;
mod sasl;

#[doc(inline)]
pub use self::address::Address;
mod address;

pub mod mainloop;

pub mod bus;

#[doc(inline)]
pub use omnibus_core::signature::{Signature, SignatureBuf, SignatureError};
