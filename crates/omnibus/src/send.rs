use std::num::NonZeroU32;

use crate::buf::UnalignedBuf;
use crate::error::{Error, ErrorKind, Result};
use crate::proto::{self, Endianness, FieldCode};
use crate::{Frame, Message, MessageKind, Signature};

/// The buffer in which outgoing messages are marshalled before being written
/// to the transport.
///
/// Messages are emitted in the byte order their body carries, so bodies can
/// be forwarded verbatim. Locally constructed messages use host order.
///
/// # Examples
///
/// ```
/// use omnibus::{Message, ObjectPath, SendBuf};
///
/// const PATH: &ObjectPath = ObjectPath::new_const(b"/org/example/Broker");
///
/// let mut send = SendBuf::new();
/// assert_ne!(send.next_serial(), send.next_serial());
///
/// let serial = send.next_serial();
/// send.write_message(&Message::method_call(PATH, "Hello", serial)
///     .with_interface("org.example.Broker")
///     .with_destination("org.example.Broker"))?;
///
/// assert!(!send.is_empty());
/// # Ok::<_, omnibus::Error>(())
/// ```
pub struct SendBuf {
    buf: UnalignedBuf,
    serial: u32,
}

impl SendBuf {
    /// Construct a new empty send buffer.
    pub fn new() -> Self {
        Self {
            buf: UnalignedBuf::new(),
            serial: 0,
        }
    }

    /// Get the next serial of this send buffer, which is never zero.
    pub fn next_serial(&mut self) -> NonZeroU32 {
        loop {
            if let Some(serial) = NonZeroU32::new(self.serial.wrapping_add(1)) {
                self.serial = serial.get();
                break serial;
            }

            self.serial = 0;
        }
    }

    /// Test if the buffer has no pending bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The number of pending bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// The bytes waiting to be written to the transport.
    pub fn get(&self) -> &[u8] {
        self.buf.get()
    }

    /// Indicate that `n` bytes have been written to the transport.
    pub fn advance(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Append raw bytes, used for the authentication exchange which runs
    /// before message framing starts.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Marshal a message onto the end of the buffer.
    pub fn write_message(&mut self, message: &Message<'_>) -> Result<()> {
        self.buf.update_base_align();

        let body = message.body();
        let endianness = body.endianness();

        let Ok(body_length) = u32::try_from(body.len()) else {
            return Err(Error::new(ErrorKind::BodyTooLong(u32::MAX)));
        };

        let mut header = proto::Header {
            endianness,
            message_type: message.message_type(),
            flags: message.flags(),
            version: proto::VERSION,
            body_length,
            serial: message.serial().get(),
        };

        header.adjust(endianness);
        self.buf.store(header);

        let length = self.buf.alloc::<u32>();
        let start = self.buf.len();

        match message.kind() {
            MessageKind::MethodCall { path, member } => {
                self.field_str(FieldCode::PATH, Signature::OBJECT_PATH, path.as_str(), endianness);
                self.field_str(FieldCode::MEMBER, Signature::STRING, member, endianness);
            }
            MessageKind::MethodReturn { reply_serial } => {
                self.field_u32(FieldCode::REPLY_SERIAL, reply_serial.get(), endianness);
            }
            MessageKind::Error {
                error_name,
                reply_serial,
            } => {
                self.field_str(FieldCode::ERROR_NAME, Signature::STRING, error_name, endianness);
                self.field_u32(FieldCode::REPLY_SERIAL, reply_serial.get(), endianness);
            }
            MessageKind::Signal { path, member } => {
                self.field_str(FieldCode::PATH, Signature::OBJECT_PATH, path.as_str(), endianness);
                self.field_str(FieldCode::MEMBER, Signature::STRING, member, endianness);
            }
        }

        if let Some(interface) = message.interface() {
            self.field_str(FieldCode::INTERFACE, Signature::STRING, interface, endianness);
        }

        if let Some(destination) = message.destination() {
            self.field_str(FieldCode::DESTINATION, Signature::STRING, destination, endianness);
        }

        if let Some(sender) = message.sender() {
            self.field_str(FieldCode::SENDER, Signature::STRING, sender, endianness);
        }

        if !body.signature().is_empty() {
            self.field_signature(FieldCode::SIGNATURE, body.signature());
        }

        let Ok(mut header_length) = u32::try_from(self.buf.len().saturating_sub(start)) else {
            return Err(Error::new(ErrorKind::HeaderTooLong(u32::MAX)));
        };

        header_length.adjust(endianness);
        self.buf.store_at(length, header_length);

        self.buf.align_mut::<u64>();
        self.buf.extend_from_slice(body.get());
        Ok(())
    }

    /// Emit one header field holding a string-like value.
    ///
    /// Every field is a struct of a field code and a variant, so each begins
    /// on an 8-byte boundary and the variant's value is padded to 8.
    fn field_str(&mut self, code: FieldCode, sig: &Signature, value: &str, endianness: Endianness) {
        self.field_preamble(code, sig);

        let mut len = value.len() as u32;
        len.adjust(endianness);
        self.buf.store(len);
        self.buf.extend_from_slice_nul(value.as_bytes());
    }

    /// Emit one header field holding a `u32`.
    fn field_u32(&mut self, code: FieldCode, value: u32, endianness: Endianness) {
        self.field_preamble(code, Signature::UINT32);

        let mut value = value;
        value.adjust(endianness);
        self.buf.store(value);
    }

    /// Emit one header field holding a signature.
    fn field_signature(&mut self, code: FieldCode, value: &Signature) {
        self.field_preamble(code, Signature::SIGNATURE);
        self.buf.store(value.len() as u8);
        self.buf.extend_from_slice_nul(value.as_bytes());
    }

    fn field_preamble(&mut self, code: FieldCode, sig: &Signature) {
        self.buf.align_mut::<u64>();
        self.buf.store(code);
        self.buf.store(sig.len() as u8);
        self.buf.extend_from_slice_nul(sig.as_bytes());
        self.buf.align_mut::<u64>();
    }
}

impl Default for SendBuf {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
