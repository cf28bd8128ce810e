use std::ops::Deref;

use super::{
    MAX_CONTAINER_DEPTH, MAX_DEPTH, MAX_SIGNATURE, Signature, SignatureError, SignatureErrorKind,
};

/// An incrementally built signature.
///
/// The builder enforces the maximum length and container depth so that the
/// accumulated bytes always form a valid prefix of a legal signature.
#[derive(Clone)]
pub struct SignatureBuilder {
    data: [u8; MAX_SIGNATURE],
    len: usize,
    structs: usize,
    arrays: usize,
}

impl SignatureBuilder {
    /// Construct a new empty signature builder.
    pub const fn new() -> Self {
        Self {
            data: [0; MAX_SIGNATURE],
            len: 0,
            structs: 0,
            arrays: 0,
        }
    }

    /// Coerce into a signature.
    ///
    /// Callers must only observe the signature when every opened container
    /// has been closed.
    pub fn to_signature(&self) -> &Signature {
        // SAFETY: The builder only accepts balanced container sequences and
        // valid type codes.
        unsafe { Signature::new_unchecked(self.as_slice()) }
    }

    /// The current length of the signature in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Test if the builder is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Truncate the signature to `len` bytes.
    ///
    /// Used to roll back a partial write; the caller is responsible for `len`
    /// being a previously observed length.
    pub fn truncate(&mut self, len: usize) {
        debug_assert!(len <= self.len);
        self.len = len;
    }

    /// Append a single type code.
    pub fn push(&mut self, byte: u8) -> Result<(), SignatureError> {
        if self.len == MAX_SIGNATURE {
            return Err(SignatureError::new(SignatureErrorKind::SignatureTooLong));
        }

        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Open an array in the signature.
    pub fn open_array(&mut self) -> Result<(), SignatureError> {
        if self.arrays == MAX_CONTAINER_DEPTH || self.structs + self.arrays == MAX_DEPTH {
            return Err(SignatureError::new(
                SignatureErrorKind::ExceededMaximumArrayRecursion,
            ));
        }

        self.push(b'a')?;
        self.arrays += 1;
        Ok(())
    }

    /// Close an array in the signature.
    ///
    /// The element type has already been appended by the contained writes, so
    /// this only pops the depth tracking.
    pub fn close_array(&mut self) {
        self.arrays -= 1;
    }

    /// Open a struct in the signature.
    pub fn open_struct(&mut self) -> Result<(), SignatureError> {
        if self.structs == MAX_CONTAINER_DEPTH || self.structs + self.arrays == MAX_DEPTH {
            return Err(SignatureError::new(
                SignatureErrorKind::ExceededMaximumStructRecursion,
            ));
        }

        self.push(b'(')?;
        self.structs += 1;
        Ok(())
    }

    /// Close a struct in the signature.
    pub fn close_struct(&mut self) -> Result<(), SignatureError> {
        self.push(b')')?;
        self.structs -= 1;
        Ok(())
    }

    /// Open a dict entry in the signature.
    pub fn open_dict(&mut self) -> Result<(), SignatureError> {
        if self.structs == MAX_CONTAINER_DEPTH || self.structs + self.arrays == MAX_DEPTH {
            return Err(SignatureError::new(
                SignatureErrorKind::ExceededMaximumDictRecursion,
            ));
        }

        self.push(b'{')?;
        self.structs += 1;
        Ok(())
    }

    /// Close a dict entry in the signature.
    pub fn close_dict(&mut self) -> Result<(), SignatureError> {
        self.push(b'}')?;
        self.structs -= 1;
        Ok(())
    }

    /// Extend this signature with another.
    pub fn extend_from_signature<S>(&mut self, other: S) -> Result<(), SignatureError>
    where
        S: AsRef<Signature>,
    {
        let bytes = other.as_ref().as_bytes();

        if self.len + bytes.len() > MAX_SIGNATURE {
            return Err(SignatureError::new(SignatureErrorKind::SignatureTooLong));
        }

        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    /// Clear the current signature.
    pub fn clear(&mut self) {
        self.len = 0;
        self.structs = 0;
        self.arrays = 0;
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl Default for SignatureBuilder {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for SignatureBuilder {
    type Target = Signature;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.to_signature()
    }
}

impl PartialEq<SignatureBuilder> for SignatureBuilder {
    #[inline]
    fn eq(&self, other: &SignatureBuilder) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for SignatureBuilder {}
