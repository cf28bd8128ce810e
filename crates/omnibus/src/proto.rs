//! Low level details of the wire protocol.

#[doc(inline)]
pub use omnibus_core::proto::{Endianness, FieldCode, Flags, MessageType, Type};

use crate::Frame;

/// The fixed-length preamble of every message.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct Header {
    pub(crate) endianness: Endianness,
    pub(crate) message_type: MessageType,
    pub(crate) flags: Flags,
    pub(crate) version: u8,
    pub(crate) body_length: u32,
    pub(crate) serial: u32,
}

/// The protocol version emitted and accepted in the preamble.
pub(crate) const VERSION: u8 = 1;

impl crate::frame::sealed::Sealed for Header {}

// SAFETY: Header is repr(C), 4-aligned and inhabits any bit pattern.
unsafe impl Frame for Header {
    fn adjust(&mut self, endianness: Endianness) {
        self.body_length.adjust(endianness);
        self.serial.adjust(endianness);
    }
}

macro_rules! implement_frame {
    ($($ty:ty),* $(,)?) => {
        $(
            impl crate::frame::sealed::Sealed for $ty {}

            // SAFETY: The type is repr(transparent) over a single byte.
            unsafe impl Frame for $ty {
                #[inline]
                fn adjust(&mut self, _: Endianness) {}
            }
        )*
    }
}

implement_frame!(Endianness, MessageType, Flags, FieldCode, Type);
