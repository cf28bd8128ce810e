pub use self::reader::{Basic, Reader};
pub(crate) use self::reader::{skip_body, validate_body};
mod reader;

#[cfg(test)]
mod tests;

use std::fmt;

use crate::buf::Aligned;
use crate::error::Result;
use crate::proto::Endianness;
use crate::{BodyBuf, Frame, Read, Signature};

/// A read-only view into the body of a message: a byte buffer, the byte
/// order it was written in, and the signature describing its layout.
///
/// # Examples
///
/// ```
/// use omnibus::{BodyBuf, Body};
///
/// let mut buf = BodyBuf::new();
/// buf.store(42u32)?;
/// buf.store("foo")?;
///
/// let mut body: Body<'_> = buf.as_body();
/// assert_eq!(body.load::<u32>()?, 42);
/// assert_eq!(body.read::<str>()?, "foo");
/// # Ok::<_, omnibus::Error>(())
/// ```
pub struct Body<'a> {
    data: Aligned<'a>,
    endianness: Endianness,
    signature: &'a Signature,
}

impl<'a> Body<'a> {
    /// Construct an empty body.
    pub(crate) const fn empty() -> Self {
        Self::from_raw_parts(Aligned::empty(), Endianness::NATIVE, Signature::EMPTY)
    }

    /// Construct a new body wrapping pointed to data.
    #[inline]
    pub(crate) const fn from_raw_parts(
        data: Aligned<'a>,
        endianness: Endianness,
        signature: &'a Signature,
    ) -> Self {
        Self {
            data,
            endianness,
            signature,
        }
    }

    /// Get the byte order of the body.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Get the signature of the body.
    pub fn signature(&self) -> &'a Signature {
        self.signature
    }

    /// Replace the signature of the body.
    pub(crate) fn with_signature(self, signature: &'a Signature) -> Self {
        Self { signature, ..self }
    }

    /// Get the bytes that remain to be read.
    pub fn get(&self) -> &'a [u8] {
        self.data.get()
    }

    /// Test if the body has been fully consumed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining bytes to be read.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Construct a recursive typed reader over the body.
    ///
    /// # Examples
    ///
    /// ```
    /// use omnibus::{Basic, BodyBuf};
    ///
    /// let mut buf = BodyBuf::new();
    /// buf.store(7u16)?;
    ///
    /// let body = buf.as_body();
    /// let reader = body.reader();
    /// assert_eq!(reader.read_basic()?, Basic::U16(7));
    /// # Ok::<_, omnibus::Error>(())
    /// ```
    pub fn reader(&self) -> Reader<'a> {
        Reader::new(self.data.clone(), self.endianness, self.signature)
    }

    /// Read a string-like type from the buffer.
    pub fn read<T>(&mut self) -> Result<&'a T>
    where
        T: ?Sized + Read,
    {
        T::read_from(self)
    }

    /// Read `len` bytes from the buffer and make them accessible through
    /// another [`Body`] constituting that sub-slice.
    ///
    /// # Panics
    ///
    /// Panics if `len` is larger than [`len()`].
    ///
    /// [`len()`]: Self::len
    pub fn read_until(&mut self, len: usize) -> Body<'a> {
        Body::from_raw_parts(self.data.read_until(len), self.endianness, self.signature)
    }

    /// Load a frame of the given type, adjusted to the body's byte order.
    pub fn load<T>(&mut self) -> Result<T>
    where
        T: Frame,
    {
        self.data.load_adjusted(self.endianness)
    }

    /// Advance the read cursor by `n`.
    #[inline]
    pub(crate) fn advance(&mut self, n: usize) -> Result<()> {
        self.data.advance(n)
    }

    /// Align the read cursor to the alignment of `T`.
    #[inline]
    pub(crate) fn align<T>(&mut self) -> Result<()> {
        self.data.align::<T>()
    }

    /// Load a slice.
    #[inline]
    pub(crate) fn load_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.data.load_slice(len)
    }

    /// Load a slice ending with a NUL byte, excluding the NUL.
    #[inline]
    pub(crate) fn load_slice_nul(&mut self, len: usize) -> Result<&'a [u8]> {
        self.data.load_slice_nul(len)
    }
}

impl Clone for Body<'_> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            endianness: self.endianness,
            signature: self.signature,
        }
    }
}

impl fmt::Debug for Body<'_> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("len", &self.len())
            .field("endianness", &self.endianness)
            .field("signature", &self.signature)
            .finish()
    }
}

impl<'a> PartialEq<Body<'a>> for Body<'_> {
    #[inline]
    fn eq(&self, other: &Body<'a>) -> bool {
        self.get() == other.get() && self.endianness == other.endianness
    }
}

impl PartialEq<BodyBuf> for Body<'_> {
    #[inline]
    fn eq(&self, other: &BodyBuf) -> bool {
        self.get() == other.get() && self.endianness == other.endianness()
    }
}

impl Eq for Body<'_> {}
