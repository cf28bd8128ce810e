use omnibus_core::signature::SignatureBuf;

use crate::buf::{Alloc, MAX_ARRAY_LENGTH};
use crate::error::{Error, ErrorKind, Result};
use crate::proto::Type;
use crate::{Basic, BodyBuf, Reader, Signature};

/// An open container scope of a [`Writer`].
enum Scope {
    /// A struct or dict entry. In the absence of an enclosing array or
    /// variant the field codes are appended to the signature as they are
    /// written.
    Struct { dict: bool },
    /// An array. The element signature is fixed up front; every element
    /// written must match it, and the byte length is back-patched when the
    /// scope closes.
    Array {
        len_at: Alloc<u32>,
        start: usize,
        elem: SignatureBuf,
        elem_pos: usize,
    },
    /// A variant. The content signature was written into the body up front
    /// and every write must match it.
    Variant { sig: SignatureBuf, pos: usize },
}

/// A recursive typed writer over a [`BodyBuf`].
///
/// Outside of arrays and variants the writer appends type codes to the
/// body's signature as values are written. Inside them the signature is
/// already determined, and writes are checked against the expected type
/// codes instead.
///
/// # Examples
///
/// ```
/// use omnibus::{Basic, BodyBuf, Signature};
///
/// let mut buf = BodyBuf::new();
///
/// let mut w = buf.writer();
/// w.write_basic(Basic::U32(7))?;
/// w.open_array(Signature::STRING)?;
/// w.write_basic(Basic::Str("foo"))?;
/// w.write_basic(Basic::Str("bar"))?;
/// w.close_array()?;
/// w.finish()?;
///
/// assert_eq!(buf.signature(), "uas");
/// # Ok::<_, omnibus::Error>(())
/// ```
pub struct Writer<'a> {
    buf: &'a mut BodyBuf,
    scopes: Vec<Scope>,
}

impl<'a> Writer<'a> {
    pub(super) fn new(buf: &'a mut BodyBuf) -> Self {
        Self {
            buf,
            scopes: Vec::new(),
        }
    }

    /// Write a basic value, inserting its type code when appending or
    /// checking it against the expected signature inside arrays and
    /// variants.
    pub fn write_basic(&mut self, value: Basic<'_>) -> Result<()> {
        self.claim(value.ty())?;

        let data = self.buf.data_mut();

        match value {
            Basic::Byte(v) => data.store(v),
            Basic::Bool(v) => data.store(v as u8),
            Basic::I16(v) => data.store(v),
            Basic::U16(v) => data.store(v),
            Basic::I32(v) => data.store(v),
            Basic::U32(v) => data.store(v),
            Basic::I64(v) => data.store(v),
            Basic::U64(v) => data.store(v),
            Basic::Double(v) => data.store(v),
            Basic::Str(v) => {
                data.store(v.len() as u32);
                data.extend_from_slice_nul(v.as_bytes());
            }
            Basic::Path(v) => {
                data.store(v.len() as u32);
                data.extend_from_slice_nul(v.as_bytes());
            }
            Basic::Sig(v) => {
                data.store(v.len() as u8);
                data.extend_from_slice_nul(v.as_bytes());
            }
        }

        Ok(())
    }

    /// Open a struct scope.
    pub fn open_struct(&mut self) -> Result<()> {
        if self.matching_scope().is_some() {
            self.claim_matching(Type::OPEN_PAREN)?;
        } else {
            self.buf.sig_mut().open_struct()?;
        }

        self.buf.data_mut().pad_to(8);
        self.scopes.push(Scope::Struct { dict: false });
        Ok(())
    }

    /// Close the innermost scope, which must be a struct.
    pub fn close_struct(&mut self) -> Result<()> {
        match self.scopes.pop() {
            Some(Scope::Struct { dict: false }) => {}
            _ => return Err(Error::new(ErrorKind::MismatchedContainer)),
        }

        if self.matching_scope().is_some() {
            self.claim_matching(Type::CLOSE_PAREN)?;
        } else {
            self.buf.sig_mut().close_struct()?;
        }

        Ok(())
    }

    /// Open a dict entry scope.
    pub fn open_dict(&mut self) -> Result<()> {
        if self.matching_scope().is_some() {
            self.claim_matching(Type::OPEN_BRACE)?;
        } else {
            self.buf.sig_mut().open_dict()?;
        }

        self.buf.data_mut().pad_to(8);
        self.scopes.push(Scope::Struct { dict: true });
        Ok(())
    }

    /// Close the innermost scope, which must be a dict entry.
    pub fn close_dict(&mut self) -> Result<()> {
        match self.scopes.pop() {
            Some(Scope::Struct { dict: true }) => {}
            _ => return Err(Error::new(ErrorKind::MismatchedContainer)),
        }

        if self.matching_scope().is_some() {
            self.claim_matching(Type::CLOSE_BRACE)?;
        } else {
            self.buf.sig_mut().close_dict()?;
        }

        Ok(())
    }

    /// Open an array scope with the given element signature.
    ///
    /// The length field is reserved immediately and back-patched when the
    /// scope closes. Padding between the length field and the first element
    /// position is emitted even when no element follows, so the element
    /// start offset is deterministic for empty arrays.
    pub fn open_array(&mut self, elem: &Signature) -> Result<()> {
        if !elem.is_single_complete_type() {
            return Err(Error::new(ErrorKind::NotSingleCompleteType));
        }

        if self.matching_scope().is_some() {
            self.claim_matching(Type::ARRAY)?;

            for &code in elem.as_bytes() {
                self.claim_matching(Type::new(code))?;
            }
        } else {
            let sig = self.buf.sig_mut();
            sig.open_array()?;
            sig.extend_from_signature(elem)?;
            sig.close_array();
        }

        let data = self.buf.data_mut();
        let len_at = data.alloc::<u32>();
        data.pad_to(elem.type_at(0).alignment());
        let start = data.len();

        self.scopes.push(Scope::Array {
            len_at,
            start,
            elem_pos: elem.len(),
            elem: elem.to_owned(),
        });

        Ok(())
    }

    /// Close the innermost scope, which must be an array, back-patching its
    /// byte length.
    ///
    /// The length covers the packed elements and the padding between them,
    /// but no trailing padding and not the padding in front of the first
    /// element.
    pub fn close_array(&mut self) -> Result<()> {
        let (len_at, start, elem, elem_pos) = match self.scopes.pop() {
            Some(Scope::Array {
                len_at,
                start,
                elem,
                elem_pos,
            }) => (len_at, start, elem, elem_pos),
            _ => return Err(Error::new(ErrorKind::MismatchedContainer)),
        };

        if elem_pos != elem.len() {
            return Err(Error::new(ErrorKind::IncompleteContainer));
        }

        let data = self.buf.data_mut();
        let len = data.len() - start;

        if len > MAX_ARRAY_LENGTH as usize {
            return Err(Error::new(ErrorKind::ArrayTooLong(len as u32)));
        }

        data.store_at(len_at, len as u32);
        Ok(())
    }

    /// Open a variant scope with the given content signature.
    ///
    /// The signature is written into the body followed by padding to an
    /// 8-byte boundary, after which the single content value is written.
    pub fn open_variant(&mut self, content: &Signature) -> Result<()> {
        if !content.is_single_complete_type() {
            return Err(Error::new(ErrorKind::NotSingleCompleteType));
        }

        self.claim(Type::VARIANT)?;

        let data = self.buf.data_mut();
        data.store(content.len() as u8);
        data.extend_from_slice_nul(content.as_bytes());
        data.pad_to(8);

        self.scopes.push(Scope::Variant {
            sig: content.to_owned(),
            pos: 0,
        });

        Ok(())
    }

    /// Close the innermost scope, which must be a variant whose content has
    /// been written in full.
    pub fn close_variant(&mut self) -> Result<()> {
        match self.scopes.pop() {
            Some(Scope::Variant { sig, pos }) => {
                if pos != sig.len() {
                    return Err(Error::new(ErrorKind::IncompleteContainer));
                }

                Ok(())
            }
            _ => Err(Error::new(ErrorKind::MismatchedContainer)),
        }
    }

    /// Splice all remaining values from `reader` into the writer, preserving
    /// structure.
    ///
    /// On error both the body and the signature are truncated to their
    /// lengths from before the call and open scopes are unwound, so a failed
    /// splice leaves the writer as it was.
    pub fn write_reader(&mut self, reader: &mut Reader<'_>) -> Result<()> {
        let data_mark = self.buf.len();
        let sig_mark = self.buf.sig_len();
        let depth = self.scopes.len();

        match self.splice(reader) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.scopes.truncate(depth);
                self.buf.truncate_to(data_mark, sig_mark);
                Err(error)
            }
        }
    }

    /// The current length of the underlying body in bytes.
    pub fn body_len(&self) -> usize {
        self.buf.len()
    }

    /// Finish the writer, ensuring that every opened scope was closed.
    pub fn finish(self) -> Result<()> {
        if !self.scopes.is_empty() {
            return Err(Error::new(ErrorKind::IncompleteContainer));
        }

        Ok(())
    }

    fn splice(&mut self, reader: &mut Reader<'_>) -> Result<()> {
        loop {
            match reader.current_type() {
                Type::INVALID => return Ok(()),
                Type::OPEN_PAREN => {
                    let mut sub = reader.recurse()?;
                    self.open_struct()?;
                    self.splice(&mut sub)?;
                    self.close_struct()?;
                }
                Type::OPEN_BRACE => {
                    let mut sub = reader.recurse()?;
                    self.open_dict()?;
                    self.splice(&mut sub)?;
                    self.close_dict()?;
                }
                Type::ARRAY => {
                    self.open_array(reader.array_element_signature()?)?;

                    match reader.recurse() {
                        Ok(mut sub) => self.splice(&mut sub)?,
                        Err(error) if matches!(error.kind(), ErrorKind::EmptyArray) => {}
                        Err(error) => return Err(error),
                    }

                    self.close_array()?;
                }
                Type::VARIANT => {
                    let mut sub = reader.recurse()?;
                    self.open_variant(sub.full_signature())?;
                    self.splice(&mut sub)?;
                    self.close_variant()?;
                }
                _ => {
                    self.write_basic(reader.read_basic()?)?;
                }
            }

            if !reader.next()? {
                return Ok(());
            }
        }
    }

    /// Consume `ty` from the innermost array or variant signature, or append
    /// it when no such scope is open.
    fn claim(&mut self, ty: Type) -> Result<()> {
        if self.matching_scope().is_some() {
            return self.claim_matching(ty);
        }

        self.buf.sig_mut().push(ty.get())?;
        Ok(())
    }

    /// Consume `ty` from the signature cursor of the innermost array or
    /// variant scope.
    fn claim_matching(&mut self, ty: Type) -> Result<()> {
        let Some(scope) = self.matching_scope() else {
            return Err(Error::new(ErrorKind::MismatchedContainer));
        };

        let (sig, pos) = match scope {
            Scope::Array { elem, elem_pos, .. } => {
                // A fully consumed element signature means a new element
                // begins.
                if *elem_pos == elem.len() {
                    *elem_pos = 0;
                }

                (elem.as_signature(), elem_pos)
            }
            Scope::Variant { sig, pos } => (sig.as_signature(), pos),
            Scope::Struct { .. } => return Err(Error::new(ErrorKind::MismatchedContainer)),
        };

        let expected = match sig.as_bytes().get(*pos) {
            Some(&code) => Type::new(code),
            None => Type::INVALID,
        };

        if expected != ty {
            return Err(Error::new(ErrorKind::TypeMismatch {
                expected,
                actual: ty,
            }));
        }

        *pos += 1;
        Ok(())
    }

    /// The innermost array or variant scope, whose signature constrains
    /// writes.
    fn matching_scope(&mut self) -> Option<&mut Scope> {
        self.scopes
            .iter_mut()
            .rev()
            .find(|scope| !matches!(scope, Scope::Struct { .. }))
    }
}
