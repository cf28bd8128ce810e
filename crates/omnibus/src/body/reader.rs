use core::str::from_utf8;

use crate::buf::{Aligned, MAX_ARRAY_LENGTH};
use crate::error::{Error, ErrorKind, Result};
use crate::proto::{Endianness, Type};
use crate::{Body, ObjectPath, Signature};

/// A basic value read out of or written into a body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Basic<'a> {
    /// An 8-bit unsigned integer.
    Byte(u8),
    /// A boolean, marshalled as a single byte.
    Bool(bool),
    /// A 16-bit signed integer.
    I16(i16),
    /// A 16-bit unsigned integer.
    U16(u16),
    /// A 32-bit signed integer.
    I32(i32),
    /// A 32-bit unsigned integer.
    U32(u32),
    /// A 64-bit signed integer.
    I64(i64),
    /// A 64-bit unsigned integer.
    U64(u64),
    /// A double precision floating point number.
    Double(f64),
    /// A length-prefixed string.
    Str(&'a str),
    /// An object path.
    Path(&'a ObjectPath),
    /// A signature.
    Sig(&'a Signature),
}

impl<'a> Basic<'a> {
    /// The type code of the value.
    pub fn ty(&self) -> Type {
        match self {
            Basic::Byte(..) => Type::BYTE,
            Basic::Bool(..) => Type::BOOLEAN,
            Basic::I16(..) => Type::INT16,
            Basic::U16(..) => Type::UINT16,
            Basic::I32(..) => Type::INT32,
            Basic::U32(..) => Type::UINT32,
            Basic::I64(..) => Type::INT64,
            Basic::U64(..) => Type::UINT64,
            Basic::Double(..) => Type::DOUBLE,
            Basic::Str(..) => Type::STRING,
            Basic::Path(..) => Type::OBJECT_PATH,
            Basic::Sig(..) => Type::SIGNATURE,
        }
    }

    /// Coerce into a string if the value is one.
    pub fn as_str(&self) -> Option<&'a str> {
        match *self {
            Basic::Str(string) => Some(string),
            _ => None,
        }
    }
}

/// The traversal policy of a [`Reader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    /// Reading the top level sequence of a body.
    Body,
    /// Reading the fields of a struct or dict entry, terminated by the
    /// closing bracket in the signature.
    Struct,
    /// Reading array elements which all share one signature; terminated by
    /// the value position reaching `value_end`, or for types-only readers by
    /// the signature position reaching `sig_end`.
    Array { value_end: usize, sig_end: usize },
    /// Reading the single value of a variant whose signature was drawn from
    /// the body itself.
    Variant,
}

/// A recursive typed reader: a cursor over a signature and a body position
/// which can traverse nested containers without copying.
///
/// A clone of a reader is a cheap mark which can be restored by assigning it
/// back, capturing signature position, value position, class and array
/// bounds.
///
/// # Examples
///
/// ```
/// use omnibus::{Basic, BodyBuf, Type};
///
/// let mut buf = BodyBuf::new();
/// buf.store(10u32)?;
/// buf.store("foo")?;
///
/// let body = buf.as_body();
/// let mut reader = body.reader();
///
/// assert_eq!(reader.current_type(), Type::UINT32);
/// assert_eq!(reader.read_basic()?, Basic::U32(10));
/// assert!(reader.next()?);
/// assert_eq!(reader.read_basic()?, Basic::Str("foo"));
/// assert!(!reader.next()?);
/// assert_eq!(reader.current_type(), Type::INVALID);
/// # Ok::<_, omnibus::Error>(())
/// ```
#[derive(Clone)]
pub struct Reader<'a> {
    sig: &'a Signature,
    sig_pos: usize,
    data: Aligned<'a>,
    endianness: Endianness,
    class: Class,
    values: bool,
}

impl<'a> Reader<'a> {
    /// Construct a reader over the top level of a body.
    pub(crate) fn new(data: Aligned<'a>, endianness: Endianness, sig: &'a Signature) -> Self {
        Self {
            sig,
            sig_pos: 0,
            data,
            endianness,
            class: Class::Body,
            values: true,
        }
    }

    /// Construct a reader which steps through a signature without a body.
    ///
    /// Value reads error on such a reader, but [`current_type()`],
    /// [`recurse()`] and [`next()`] operate as usual.
    ///
    /// [`current_type()`]: Self::current_type
    /// [`recurse()`]: Self::recurse
    /// [`next()`]: Self::next
    pub fn types_only(sig: &'a Signature) -> Self {
        Self {
            sig,
            sig_pos: 0,
            data: Aligned::empty(),
            endianness: Endianness::NATIVE,
            class: Class::Body,
            values: false,
        }
    }

    /// The type code of the value under the cursor, or [`Type::INVALID`]
    /// when the current container is exhausted.
    pub fn current_type(&self) -> Type {
        match self.class {
            Class::Array { value_end, sig_end } => {
                if self.values {
                    if self.data.pos() >= value_end {
                        return Type::INVALID;
                    }
                } else if self.sig_pos >= sig_end {
                    return Type::INVALID;
                }

                self.sig.type_at(self.sig_pos)
            }
            Class::Struct => match self.sig.type_at(self.sig_pos) {
                Type::CLOSE_PAREN | Type::CLOSE_BRACE => Type::INVALID,
                t => t,
            },
            Class::Body | Class::Variant => self.sig.type_at(self.sig_pos),
        }
    }

    /// Save a mark capturing the current cursor.
    #[inline]
    pub fn mark(&self) -> Reader<'a> {
        self.clone()
    }

    /// Restore the cursor from a previously saved mark.
    #[inline]
    pub fn restore(&mut self, mark: Reader<'a>) {
        *self = mark;
    }

    /// Read the basic value under the cursor without advancing.
    ///
    /// Errors if the current type is a container or the container is
    /// exhausted.
    pub fn read_basic(&self) -> Result<Basic<'a>> {
        if !self.values {
            return Err(Error::new(ErrorKind::TypesOnly));
        }

        let t = self.current_type();
        let mut data = self.data.clone();

        let value = match t {
            Type::BYTE => Basic::Byte(data.load::<u8>()?),
            Type::BOOLEAN => match data.load::<u8>()? {
                0 => Basic::Bool(false),
                1 => Basic::Bool(true),
                _ => return Err(Error::new(ErrorKind::InvalidBoolean)),
            },
            Type::INT16 => Basic::I16(data.load_adjusted(self.endianness)?),
            Type::UINT16 => Basic::U16(data.load_adjusted(self.endianness)?),
            Type::INT32 => Basic::I32(data.load_adjusted(self.endianness)?),
            Type::UINT32 => Basic::U32(data.load_adjusted(self.endianness)?),
            Type::INT64 => Basic::I64(data.load_adjusted(self.endianness)?),
            Type::UINT64 => Basic::U64(data.load_adjusted(self.endianness)?),
            Type::DOUBLE => Basic::Double(data.load_adjusted(self.endianness)?),
            Type::STRING => Basic::Str(load_string(&mut data, self.endianness)?),
            Type::OBJECT_PATH => Basic::Path(load_path(&mut data, self.endianness)?),
            Type::SIGNATURE => Basic::Sig(load_signature(&mut data)?),
            t => return Err(Error::new(ErrorKind::NotABasicType(t))),
        };

        Ok(value)
    }

    /// Open a child reader positioned at the first element of the container
    /// under the cursor.
    ///
    /// Errors if the current type is not a container, or for arrays if the
    /// array is empty: the element type is known from the signature but
    /// there is no value to position the child at.
    pub fn recurse(&self) -> Result<Reader<'a>> {
        match self.current_type() {
            Type::OPEN_PAREN | Type::OPEN_BRACE => {
                let mut data = self.data.clone();

                if self.values {
                    data.align_to(8)?;
                }

                Ok(Reader {
                    sig: self.sig,
                    sig_pos: self.sig_pos + 1,
                    data,
                    endianness: self.endianness,
                    class: Class::Struct,
                    values: self.values,
                })
            }
            Type::ARRAY => {
                let elem = self.array_element_signature()?;
                let sig_end = self.sig_pos + 1 + elem.len();

                if !self.values {
                    return Ok(Reader {
                        sig: self.sig,
                        sig_pos: self.sig_pos + 1,
                        data: Aligned::empty(),
                        endianness: self.endianness,
                        class: Class::Array { value_end: 0, sig_end },
                        values: false,
                    });
                }

                let mut data = self.data.clone();
                let len = data.load_adjusted::<u32>(self.endianness)?;

                if len > MAX_ARRAY_LENGTH {
                    return Err(Error::new(ErrorKind::ArrayTooLong(len)));
                }

                data.align_to(elem.type_at(0).alignment())?;

                if len == 0 {
                    return Err(Error::new(ErrorKind::EmptyArray));
                }

                let value_end = data.pos() + len as usize;

                Ok(Reader {
                    sig: self.sig,
                    sig_pos: self.sig_pos + 1,
                    data,
                    endianness: self.endianness,
                    class: Class::Array { value_end, sig_end },
                    values: true,
                })
            }
            Type::VARIANT => {
                if !self.values {
                    return Err(Error::new(ErrorKind::TypesOnly));
                }

                let mut data = self.data.clone();
                let sig = load_variant_signature(&mut data)?;
                data.align_to(8)?;

                Ok(Reader {
                    sig,
                    sig_pos: 0,
                    data,
                    endianness: self.endianness,
                    class: Class::Variant,
                    values: true,
                })
            }
            t => Err(Error::new(ErrorKind::NotAContainer(t))),
        }
    }

    /// Advance past the value under the cursor.
    ///
    /// Returns whether another sibling follows.
    pub fn next(&mut self) -> Result<bool> {
        if let Class::Array { value_end, sig_end } = self.class {
            if self.values {
                if self.data.pos() >= value_end {
                    return Ok(false);
                }

                let elem = self.complete()?;
                skip_one(&mut self.data, elem, self.endianness)?;

                if self.data.pos() > value_end {
                    return Err(Error::new(ErrorKind::SignatureMismatch));
                }

                return Ok(self.data.pos() < value_end);
            }

            if self.sig_pos >= sig_end {
                return Ok(false);
            }

            let elem = self.complete()?;
            self.sig_pos += elem.len();
            return Ok(self.sig_pos < sig_end);
        }

        if self.current_type() == Type::INVALID {
            return Ok(false);
        }

        let one = self.complete()?;

        if self.values {
            skip_one(&mut self.data, one, self.endianness)?;
        }

        self.sig_pos += one.len();
        Ok(self.current_type() != Type::INVALID)
    }

    /// The signature of the elements of the array under the cursor.
    pub(crate) fn array_element_signature(&self) -> Result<&'a Signature> {
        if self.current_type() != Type::ARRAY {
            return Err(Error::new(ErrorKind::NotAContainer(self.current_type())));
        }

        self.sig
            .complete_at(self.sig_pos + 1)
            .ok_or_else(|| Error::new(ErrorKind::SignatureMismatch))
    }

    /// The full signature this reader traverses, used to recover the content
    /// signature of a variant after recursing into it.
    pub(crate) fn full_signature(&self) -> &'a Signature {
        self.sig
    }

    /// The complete type under the cursor.
    fn complete(&self) -> Result<&'a Signature> {
        self.sig
            .complete_at(self.sig_pos)
            .ok_or_else(|| Error::new(ErrorKind::SignatureMismatch))
    }
}

impl core::fmt::Debug for Reader<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reader")
            .field("signature", &self.sig)
            .field("sig_pos", &self.sig_pos)
            .field("pos", &self.data.pos())
            .field("class", &self.class)
            .field("values", &self.values)
            .finish()
    }
}

fn load_string<'a>(data: &mut Aligned<'a>, endianness: Endianness) -> Result<&'a str> {
    let len = data.load_adjusted::<u32>(endianness)? as usize;
    let bytes = data.load_slice_nul(len)?;
    Ok(from_utf8(bytes)?)
}

fn load_path<'a>(data: &mut Aligned<'a>, endianness: Endianness) -> Result<&'a ObjectPath> {
    let len = data.load_adjusted::<u32>(endianness)? as usize;
    let bytes = data.load_slice_nul(len)?;
    Ok(ObjectPath::new(bytes)?)
}

fn load_signature<'a>(data: &mut Aligned<'a>) -> Result<&'a Signature> {
    let len = data.load::<u8>()? as usize;
    let bytes = data.load_slice_nul(len)?;
    Ok(Signature::new(bytes)?)
}

/// Load the inline signature of a variant, which must contain exactly one
/// complete type.
fn load_variant_signature<'a>(data: &mut Aligned<'a>) -> Result<&'a Signature> {
    let sig = load_signature(data)?;

    if !sig.is_single_complete_type() {
        return Err(Error::new(ErrorKind::NotSingleCompleteType));
    }

    Ok(sig)
}

/// The fields of a struct or dict entry signature, with the brackets
/// stripped.
fn fields_of(one: &Signature) -> &Signature {
    let bytes = one.as_bytes();
    // SAFETY: The fields of a valid container are a valid sequence of
    // complete types.
    unsafe { Signature::new_unchecked(&bytes[1..bytes.len() - 1]) }
}

/// Skip one complete value under the cursor without validating its contents.
fn skip_one(data: &mut Aligned<'_>, one: &Signature, endianness: Endianness) -> Result<()> {
    let t = one.type_at(0);

    if let Some(size) = t.fixed_size() {
        data.align_to(t.alignment())?;
        data.advance(size)?;
        return Ok(());
    }

    match t {
        Type::STRING | Type::OBJECT_PATH => {
            let len = data.load_adjusted::<u32>(endianness)? as usize;
            data.advance(len + 1)?;
        }
        Type::SIGNATURE => {
            let len = data.load::<u8>()? as usize;
            data.advance(len + 1)?;
        }
        Type::VARIANT => {
            let sig = load_variant_signature(data)?;
            data.align_to(8)?;
            skip_values(data, sig, endianness)?;
        }
        Type::ARRAY => {
            let elem = one
                .complete_at(1)
                .ok_or_else(|| Error::new(ErrorKind::SignatureMismatch))?;

            let len = data.load_adjusted::<u32>(endianness)?;

            if len > MAX_ARRAY_LENGTH {
                return Err(Error::new(ErrorKind::ArrayTooLong(len)));
            }

            data.align_to(elem.type_at(0).alignment())?;
            data.advance(len as usize)?;
        }
        Type::OPEN_PAREN | Type::OPEN_BRACE => {
            data.align_to(8)?;
            skip_values(data, fields_of(one), endianness)?;
        }
        _ => return Err(Error::new(ErrorKind::SignatureMismatch)),
    }

    Ok(())
}

/// Skip every complete value described by `sig`.
fn skip_values(data: &mut Aligned<'_>, sig: &Signature, endianness: Endianness) -> Result<()> {
    for one in sig.iter() {
        skip_one(data, one, endianness)?;
    }

    Ok(())
}

/// Skip the values described by `sig` in the given body.
pub(crate) fn skip_body(body: &mut Body<'_>, sig: &Signature) -> Result<()> {
    let endianness = body.endianness();
    skip_values(&mut body.data, sig, endianness)
}

/// Validate that the body matches its declared signature exactly: every
/// value demarshals, including string content, and the final position lands
/// exactly at the end of the body.
pub(crate) fn validate_body(body: &Body<'_>) -> Result<()> {
    let mut data = body.data.clone();

    validate_values(&mut data, body.signature(), body.endianness())?;

    if !data.is_empty() {
        return Err(Error::new(ErrorKind::SignatureMismatch));
    }

    Ok(())
}

fn validate_values(data: &mut Aligned<'_>, sig: &Signature, endianness: Endianness) -> Result<()> {
    for one in sig.iter() {
        validate_one(data, one, endianness)?;
    }

    Ok(())
}

fn validate_one(data: &mut Aligned<'_>, one: &Signature, endianness: Endianness) -> Result<()> {
    let t = one.type_at(0);

    match t {
        Type::BOOLEAN => {
            if !matches!(data.load::<u8>()?, 0 | 1) {
                return Err(Error::new(ErrorKind::InvalidBoolean));
            }
        }
        Type::STRING => {
            load_string(data, endianness)?;
        }
        Type::OBJECT_PATH => {
            load_path(data, endianness)?;
        }
        Type::SIGNATURE => {
            load_signature(data)?;
        }
        Type::VARIANT => {
            let sig = load_variant_signature(data)?;
            data.align_to(8)?;
            validate_values(data, sig, endianness)?;
        }
        Type::ARRAY => {
            let elem = one
                .complete_at(1)
                .ok_or_else(|| Error::new(ErrorKind::SignatureMismatch))?;

            let len = data.load_adjusted::<u32>(endianness)?;

            if len > MAX_ARRAY_LENGTH {
                return Err(Error::new(ErrorKind::ArrayTooLong(len)));
            }

            data.align_to(elem.type_at(0).alignment())?;
            let end = data.pos() + len as usize;

            while data.pos() < end {
                validate_one(data, elem, endianness)?;
            }

            if data.pos() != end {
                return Err(Error::new(ErrorKind::SignatureMismatch));
            }
        }
        Type::OPEN_PAREN | Type::OPEN_BRACE => {
            data.align_to(8)?;
            validate_values(data, fields_of(one), endianness)?;
        }
        t => match t.fixed_size() {
            Some(size) => {
                data.align_to(t.alignment())?;
                data.advance(size)?;
            }
            None => return Err(Error::new(ErrorKind::SignatureMismatch)),
        },
    }

    Ok(())
}
