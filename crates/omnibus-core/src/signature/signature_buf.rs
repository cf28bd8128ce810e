use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use super::{MAX_SIGNATURE, Signature, SignatureError, validate};

/// An owned signature stored inline.
///
/// Dereferences to [`Signature`].
///
/// # Examples
///
/// ```
/// use omnibus_core::signature::{Signature, SignatureBuf};
///
/// let sig = SignatureBuf::new(b"a(yv)")?;
/// assert_eq!(&*sig, Signature::new(b"a(yv)")?);
/// # Ok::<_, omnibus_core::signature::SignatureError>(())
/// ```
#[derive(Clone)]
pub struct SignatureBuf {
    data: [u8; MAX_SIGNATURE],
    len: usize,
}

impl SignatureBuf {
    /// Construct a new empty signature.
    pub const fn empty() -> Self {
        Self {
            data: [0; MAX_SIGNATURE],
            len: 0,
        }
    }

    /// Try to construct a new signature with validation.
    pub fn new<S>(signature: &S) -> Result<Self, SignatureError>
    where
        S: ?Sized + AsRef<[u8]>,
    {
        let signature = signature.as_ref();
        validate(signature)?;
        // SAFETY: Just validated above.
        Ok(unsafe { Self::from_slice_unchecked(signature) })
    }

    /// Construct from a slice without validation.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the slice is a valid signature, which
    /// among other things implies that it is no longer than
    /// [`MAX_SIGNATURE`].
    pub const unsafe fn from_slice_unchecked(bytes: &[u8]) -> Self {
        let mut data = [0; MAX_SIGNATURE];
        let mut n = 0;

        while n < bytes.len() {
            data[n] = bytes[n];
            n += 1;
        }

        Self {
            data,
            len: bytes.len(),
        }
    }

    /// Coerce into a borrowed [`Signature`].
    pub fn as_signature(&self) -> &Signature {
        // SAFETY: Construction ensures the contents are valid.
        unsafe { Signature::new_unchecked(self.as_bytes()) }
    }

    /// Get the signature as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl Deref for SignatureBuf {
    type Target = Signature;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_signature()
    }
}

impl Borrow<Signature> for SignatureBuf {
    #[inline]
    fn borrow(&self) -> &Signature {
        self.as_signature()
    }
}

impl AsRef<Signature> for SignatureBuf {
    #[inline]
    fn as_ref(&self) -> &Signature {
        self.as_signature()
    }
}

impl From<&Signature> for SignatureBuf {
    #[inline]
    fn from(signature: &Signature) -> Self {
        signature.to_owned()
    }
}

impl Default for SignatureBuf {
    #[inline]
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for SignatureBuf {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_signature().fmt(f)
    }
}

impl PartialEq for SignatureBuf {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for SignatureBuf {}

impl PartialEq<Signature> for SignatureBuf {
    #[inline]
    fn eq(&self, other: &Signature) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl PartialEq<&Signature> for SignatureBuf {
    #[inline]
    fn eq(&self, other: &&Signature) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}
