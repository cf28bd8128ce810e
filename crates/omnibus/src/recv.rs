use std::io;
use std::mem::size_of;
use std::num::NonZeroU32;

use crate::body::validate_body;
use crate::buf::{AlignedBuf, MAX_BODY_LENGTH, padding_to_align};
use crate::error::{Error, ErrorKind, Result};
use crate::proto::{self, Endianness, FieldCode, MessageType};
use crate::{Body, Frame, Message, MessageBuf, MessageKind, ObjectPath, Signature};

/// The fixed preamble plus the length of the header-fields array.
const PREAMBLE: usize = size_of::<proto::Header>() + size_of::<u32>();

/// The buffer into which a transport is read and out of which complete
/// messages are framed.
///
/// Bytes are appended with [`feed()`] or [`read_from()`] and complete
/// messages extracted with [`try_parse()`], which validates framing, header
/// fields and the body layout before handing out an owned message.
///
/// [`feed()`]: Self::feed
/// [`read_from()`]: Self::read_from
/// [`try_parse()`]: Self::try_parse
pub struct RecvBuf {
    buf: AlignedBuf,
}

impl RecvBuf {
    /// Construct a new empty receive buffer.
    pub fn new() -> Self {
        Self {
            buf: AlignedBuf::new(),
        }
    }

    /// Append raw bytes received from a transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Perform one read from the given transport into the buffer.
    ///
    /// Returns the number of bytes read; zero indicates end of stream.
    pub fn read_from<R>(&mut self, read: &mut R) -> io::Result<usize>
    where
        R: ?Sized + io::Read,
    {
        self.buf.reserve_bytes(4096);
        let n = read.read(self.buf.get_mut())?;
        self.buf.advance(n);
        Ok(n)
    }

    /// The number of buffered bytes not yet framed into a message.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Test if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Try to frame one complete message out of the buffer.
    ///
    /// Returns `None` if more bytes are needed. Any error indicates a
    /// malformed peer and the connection should be dropped.
    pub fn try_parse(&mut self) -> Result<Option<MessageBuf>> {
        if self.buf.len() < PREAMBLE {
            return Ok(None);
        }

        let mut view = self.buf.as_aligned();
        let mut header = view.load::<proto::Header>()?;

        let endianness = match header.endianness {
            Endianness::LITTLE | Endianness::BIG => header.endianness,
            _ => return Err(Error::new(ErrorKind::InvalidProtocol)),
        };

        header.adjust(endianness);

        if header.version != proto::VERSION {
            return Err(Error::new(ErrorKind::InvalidProtocol));
        }

        if header.body_length > MAX_BODY_LENGTH {
            return Err(Error::new(ErrorKind::BodyTooLong(header.body_length)));
        }

        let mut headers = view.load::<u32>()?;
        headers.adjust(endianness);

        if headers > MAX_BODY_LENGTH {
            return Err(Error::new(ErrorKind::HeaderTooLong(headers)));
        }

        let headers = headers as usize;
        let body_length = header.body_length as usize;

        let total =
            PREAMBLE + headers + padding_to_align(8, PREAMBLE + headers) + body_length;

        if self.buf.len() < total {
            self.buf.reserve_bytes(total - self.buf.len());
            return Ok(None);
        }

        let message = parse_message(&header, headers, body_length, self.buf.as_aligned())?;
        let owned = message.to_owned();

        self.buf.consume_front(total);
        Ok(Some(owned))
    }
}

impl Default for RecvBuf {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Collected header fields, tracked for required/forbidden validation.
struct Fields<'a> {
    path: Option<&'a ObjectPath>,
    interface: Option<&'a str>,
    member: Option<&'a str>,
    error_name: Option<&'a str>,
    reply_serial: Option<NonZeroU32>,
    destination: Option<&'a str>,
    sender: Option<&'a str>,
    signature: &'a Signature,
}

fn parse_message<'a>(
    header: &proto::Header,
    headers: usize,
    body_length: usize,
    view: crate::buf::Aligned<'a>,
) -> Result<Message<'a>> {
    let endianness = header.endianness;

    let serial = NonZeroU32::new(header.serial).ok_or(ErrorKind::ZeroSerial)?;

    let mut buf = Body::from_raw_parts(view, endianness, Signature::EMPTY);
    buf.advance(PREAMBLE)?;

    let mut st = buf.read_until(headers);

    let mut fields = Fields {
        path: None,
        interface: None,
        member: None,
        error_name: None,
        reply_serial: None,
        destination: None,
        sender: None,
        signature: Signature::empty(),
    };

    while !st.is_empty() {
        // Each field entry is a struct, aligned to 8.
        st.align::<u64>()?;
        let code = st.load::<FieldCode>()?;
        let sig = st.read::<Signature>()?;

        if !sig.is_single_complete_type() {
            return Err(Error::new(ErrorKind::NotSingleCompleteType));
        }

        // The field value lives in a variant, whose content is padded to 8.
        st.align::<u64>()?;

        match (code, sig.as_bytes()) {
            (FieldCode::PATH, b"o") => {
                fields.path = Some(st.read::<ObjectPath>()?);
            }
            (FieldCode::INTERFACE, b"s") => {
                fields.interface = Some(st.read::<str>()?);
            }
            (FieldCode::MEMBER, b"s") => {
                fields.member = Some(st.read::<str>()?);
            }
            (FieldCode::ERROR_NAME, b"s") => {
                fields.error_name = Some(st.read::<str>()?);
            }
            (FieldCode::REPLY_SERIAL, b"u") => {
                let number = st.load::<u32>()?;
                let number = NonZeroU32::new(number).ok_or(ErrorKind::ZeroReplySerial)?;
                fields.reply_serial = Some(number);
            }
            (FieldCode::DESTINATION, b"s") => {
                fields.destination = Some(st.read::<str>()?);
            }
            (FieldCode::SIGNATURE, b"g") => {
                fields.signature = st.read::<Signature>()?;
            }
            (FieldCode::SENDER, b"s") => {
                fields.sender = Some(st.read::<str>()?);
            }
            (_, _) => {
                crate::body::skip_body(&mut st, sig)?;
            }
        }
    }

    buf.align::<u64>()?;
    let body = buf.read_until(body_length);

    let kind = match header.message_type {
        MessageType::METHOD_CALL => {
            if fields.reply_serial.is_some() {
                return Err(Error::new(ErrorKind::UnexpectedField(FieldCode::REPLY_SERIAL)));
            }

            if fields.error_name.is_some() {
                return Err(Error::new(ErrorKind::UnexpectedField(FieldCode::ERROR_NAME)));
            }

            let Some(path) = fields.path else {
                return Err(Error::new(ErrorKind::MissingPath));
            };

            if fields.interface.is_none() {
                return Err(Error::new(ErrorKind::MissingInterface));
            }

            if fields.destination.is_none() {
                return Err(Error::new(ErrorKind::MissingDestination));
            }

            let Some(member) = fields.member else {
                return Err(Error::new(ErrorKind::MissingMember));
            };

            MessageKind::MethodCall { path, member }
        }
        MessageType::METHOD_RETURN => {
            if fields.error_name.is_some() {
                return Err(Error::new(ErrorKind::UnexpectedField(FieldCode::ERROR_NAME)));
            }

            let Some(reply_serial) = fields.reply_serial else {
                return Err(Error::new(ErrorKind::MissingReplySerial));
            };

            MessageKind::MethodReturn { reply_serial }
        }
        MessageType::ERROR => {
            let Some(error_name) = fields.error_name else {
                return Err(Error::new(ErrorKind::MissingErrorName));
            };

            let Some(reply_serial) = fields.reply_serial else {
                return Err(Error::new(ErrorKind::MissingReplySerial));
            };

            MessageKind::Error {
                error_name,
                reply_serial,
            }
        }
        MessageType::SIGNAL => {
            if fields.reply_serial.is_some() {
                return Err(Error::new(ErrorKind::UnexpectedField(FieldCode::REPLY_SERIAL)));
            }

            if fields.error_name.is_some() {
                return Err(Error::new(ErrorKind::UnexpectedField(FieldCode::ERROR_NAME)));
            }

            let Some(path) = fields.path else {
                return Err(Error::new(ErrorKind::MissingPath));
            };

            let Some(member) = fields.member else {
                return Err(Error::new(ErrorKind::MissingMember));
            };

            MessageKind::Signal { path, member }
        }
        _ => return Err(Error::new(ErrorKind::InvalidProtocol)),
    };

    let body = body.with_signature(fields.signature);

    // The body must demarshal under its declared signature and consume its
    // length exactly.
    validate_body(&body)?;

    Ok(Message {
        kind,
        serial,
        flags: header.flags,
        interface: fields.interface,
        destination: fields.destination,
        sender: fields.sender,
        body,
    })
}
