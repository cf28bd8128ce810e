pub use self::writer::Writer;
mod writer;

#[cfg(test)]
mod tests;

use std::fmt;

use omnibus_core::signature::SignatureBuilder;

use crate::buf::AlignedBuf;
use crate::error::Result;
use crate::proto::Endianness;
use crate::{Body, Frame, Signature, Write};

/// An owned message body under construction: the marshalled bytes plus the
/// signature describing them.
///
/// Basic values can be stored directly with [`store()`]; nested containers
/// are written through the recursive [`writer()`].
///
/// [`store()`]: Self::store
/// [`writer()`]: Self::writer
///
/// # Examples
///
/// ```
/// use omnibus::BodyBuf;
///
/// let mut buf = BodyBuf::new();
/// buf.store(10u16)?;
/// buf.store(10u32)?;
///
/// assert_eq!(buf.signature(), "qu");
/// # Ok::<_, omnibus::Error>(())
/// ```
pub struct BodyBuf {
    data: AlignedBuf,
    sig: SignatureBuilder,
    endianness: Endianness,
}

impl BodyBuf {
    /// Construct a new empty body in the host byte order.
    pub fn new() -> Self {
        Self::with_endianness(Endianness::NATIVE)
    }

    /// Construct a new empty body with the given byte order.
    ///
    /// Values are only byte-swapped on read; locally constructed bodies are
    /// always written in host order, so this is primarily useful to label
    /// bodies copied from foreign messages.
    pub fn with_endianness(endianness: Endianness) -> Self {
        Self {
            data: AlignedBuf::new(),
            sig: SignatureBuilder::new(),
            endianness,
        }
    }

    /// Construct a body from already marshalled bytes and their signature.
    pub(crate) fn from_parts(data: AlignedBuf, sig: &Signature, endianness: Endianness) -> Self {
        let mut builder = SignatureBuilder::new();

        // The signature was validated by the caller, so it fits the builder.
        let _ = builder.extend_from_signature(sig);

        Self {
            data,
            sig: builder,
            endianness,
        }
    }

    /// Clear the body.
    pub fn clear(&mut self) {
        self.data.clear();
        self.sig.clear();
    }

    /// Get the byte order of the body.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Get the signature of the body.
    pub fn signature(&self) -> &Signature {
        self.sig.to_signature()
    }

    /// Get the marshalled bytes of the body.
    pub fn get(&self) -> &[u8] {
        self.data.get()
    }

    /// The length of the marshalled body in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Test if the body is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Access the body as a read-only [`Body`].
    pub fn as_body(&self) -> Body<'_> {
        Body::from_raw_parts(
            self.data.as_aligned(),
            self.endianness,
            self.sig.to_signature(),
        )
    }

    /// Store a basic typed value, appending its type code to the signature.
    ///
    /// # Examples
    ///
    /// ```
    /// use omnibus::BodyBuf;
    ///
    /// let mut buf = BodyBuf::new();
    /// buf.store("Hello")?;
    /// buf.store(true)?;
    ///
    /// assert_eq!(buf.signature(), "sb");
    /// # Ok::<_, omnibus::Error>(())
    /// ```
    pub fn store<T>(&mut self, value: T) -> Result<()>
    where
        T: Storable,
    {
        value.store_into(self)
    }

    /// Open a recursive writer over the body.
    ///
    /// # Examples
    ///
    /// ```
    /// use omnibus::{Basic, BodyBuf, Signature};
    ///
    /// let mut buf = BodyBuf::new();
    ///
    /// let mut w = buf.writer();
    /// w.open_array(Signature::new(b"(yv)")?)?;
    /// w.open_struct()?;
    /// w.write_basic(Basic::Byte(1))?;
    /// w.open_variant(Signature::INT32)?;
    /// w.write_basic(Basic::I32(42))?;
    /// w.close_variant()?;
    /// w.close_struct()?;
    /// w.close_array()?;
    /// w.finish()?;
    ///
    /// assert_eq!(buf.signature(), "a(yv)");
    /// # Ok::<_, omnibus::Error>(())
    /// ```
    pub fn writer(&mut self) -> Writer<'_> {
        Writer::new(self)
    }

    /// Store a frame without touching the signature.
    pub(crate) fn store_frame<T>(&mut self, frame: T)
    where
        T: Frame,
    {
        self.data.store(frame);
    }

    /// Extend the body with a slice without touching the signature.
    pub(crate) fn extend_from_slice_nul(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice_nul(bytes);
    }

    pub(crate) fn data_mut(&mut self) -> &mut AlignedBuf {
        &mut self.data
    }

    pub(crate) fn sig_mut(&mut self) -> &mut SignatureBuilder {
        &mut self.sig
    }

    pub(crate) fn sig_len(&self) -> usize {
        self.sig.len()
    }

    /// Roll both buffers back to previously observed lengths.
    pub(crate) fn truncate_to(&mut self, data_len: usize, sig_len: usize) {
        self.data.truncate(data_len);
        self.sig.truncate(sig_len);
    }
}

impl Default for BodyBuf {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for BodyBuf {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            sig: self.sig.clone(),
            endianness: self.endianness,
        }
    }
}

impl fmt::Debug for BodyBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyBuf")
            .field("len", &self.len())
            .field("signature", &self.signature())
            .field("endianness", &self.endianness)
            .finish()
    }
}

impl PartialEq for BodyBuf {
    fn eq(&self, other: &Self) -> bool {
        self.endianness == other.endianness
            && self.get() == other.get()
            && self.signature() == other.signature()
    }
}

impl Eq for BodyBuf {}

/// A basic value which can be stored into a [`BodyBuf`] through
/// [`BodyBuf::store`].
pub trait Storable {
    /// Append the value and its type code to the buffer.
    #[doc(hidden)]
    fn store_into(self, buf: &mut BodyBuf) -> Result<()>;
}

macro_rules! impl_storable_number {
    ($($ty:ty, $code:literal),* $(,)?) => {
        $(
            impl Storable for $ty {
                #[inline]
                fn store_into(self, buf: &mut BodyBuf) -> Result<()> {
                    buf.sig.push($code)?;
                    buf.data.store(self);
                    Ok(())
                }
            }
        )*
    }
}

impl_storable_number! {
    u8, b'y',
    i16, b'n',
    u16, b'q',
    i32, b'i',
    u32, b'u',
    i64, b'x',
    u64, b't',
    f64, b'd',
}

impl Storable for bool {
    #[inline]
    fn store_into(self, buf: &mut BodyBuf) -> Result<()> {
        buf.sig.push(b'b')?;
        buf.data.store(self as u8);
        Ok(())
    }
}

impl<T> Storable for &T
where
    T: ?Sized + Write,
{
    #[inline]
    fn store_into(self, buf: &mut BodyBuf) -> Result<()> {
        buf.sig.push(T::TYPE.get())?;
        self.write_to(buf);
        Ok(())
    }
}
