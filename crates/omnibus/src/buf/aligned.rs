use core::fmt;
use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr;
use core::slice::from_raw_parts;

use crate::error::{ErrorKind, Result};
use crate::proto::Endianness;
use crate::{Error, Frame};

use super::{AlignedBuf, padding_to, padding_to_align};

/// A read-only cursor over an aligned buffer.
///
/// The cursor position is the absolute offset from the start of the
/// underlying buffer, so alignment padding computed against it matches the
/// padding that was emitted when the buffer was written.
pub(crate) struct Aligned<'a> {
    data: ptr::NonNull<u8>,
    read: usize,
    written: usize,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> Aligned<'a> {
    /// Construct an empty read cursor.
    pub(crate) const fn empty() -> Self {
        Self::new(ptr::NonNull::<u64>::dangling().cast(), 0)
    }

    /// Construct a new cursor wrapping pointed to data.
    pub(crate) const fn new(data: ptr::NonNull<u8>, written: usize) -> Self {
        Self {
            data,
            read: 0,
            written,
            _marker: PhantomData,
        }
    }

    /// Get the slice that remains to be read.
    pub(crate) fn get(&self) -> &'a [u8] {
        // SAFETY: The buffer this points into outlives 'a and read..written
        // is initialized.
        unsafe {
            let at = self.data.as_ptr().add(self.read);
            from_raw_parts(at, self.len())
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.read == self.written
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.written - self.read
    }

    /// The absolute read position.
    #[inline]
    pub(crate) fn pos(&self) -> usize {
        self.read
    }

    /// Read `n` bytes from the cursor and make them accessible through a
    /// sub-cursor.
    pub(crate) fn read_until(&mut self, n: usize) -> Aligned<'a> {
        assert!(n <= self.len(), "requested: {n} > length: {}", self.len());
        // SAFETY: Just asserted to be in bounds.
        let data = unsafe { ptr::NonNull::new_unchecked(self.data.as_ptr().add(self.read)) };
        self.read += n;
        Aligned::new(data, n)
    }

    /// Load a frame of the given type, aligning the cursor first.
    pub(crate) fn load<T>(&mut self) -> Result<T>
    where
        T: Frame,
    {
        let padding = padding_to::<T>(self.read);

        if self.read + padding + size_of::<T>() > self.written {
            return Err(Error::new(ErrorKind::BufferUnderflow));
        }

        self.read += padding;

        // SAFETY: read is in bounds and aligned for T since the underlying
        // buffer base is 8-aligned.
        let frame = unsafe { ptr::read(self.data.as_ptr().add(self.read).cast::<T>()) };
        self.read += size_of::<T>();
        Ok(frame)
    }

    /// Load a frame and adjust it to the given byte order.
    pub(crate) fn load_adjusted<T>(&mut self, endianness: Endianness) -> Result<T>
    where
        T: Frame,
    {
        let mut frame = self.load::<T>()?;
        frame.adjust(endianness);
        Ok(frame)
    }

    /// Advance the cursor by `n`.
    pub(crate) fn advance(&mut self, n: usize) -> Result<()> {
        if self.read + n > self.written {
            return Err(Error::new(ErrorKind::BufferUnderflow));
        }

        self.read += n;
        Ok(())
    }

    /// Align the cursor to the alignment of `T`.
    pub(crate) fn align<T>(&mut self) -> Result<()> {
        self.align_to(core::mem::align_of::<T>())
    }

    /// Align the cursor to `align`, which must be a power of two.
    pub(crate) fn align_to(&mut self, align: usize) -> Result<()> {
        let padding = padding_to_align(align, self.read);

        if self.read + padding > self.written {
            return Err(Error::from(ErrorKind::BufferUnderflow));
        }

        self.read += padding;
        Ok(())
    }

    /// Load a slice of `len` bytes.
    pub(crate) fn load_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.read + len > self.written {
            return Err(Error::from(ErrorKind::BufferUnderflow));
        }

        // SAFETY: Just checked to be in bounds.
        let slice = unsafe {
            let ptr = self.data.as_ptr().add(self.read);
            from_raw_parts(ptr, len)
        };

        self.read += len;
        Ok(slice)
    }

    /// Load a slice of `len` bytes followed by a NUL byte, excluding the NUL.
    pub(crate) fn load_slice_nul(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.read + len + 1 > self.written {
            return Err(Error::from(ErrorKind::BufferUnderflow));
        }

        // SAFETY: Just checked to be in bounds.
        let slice = unsafe {
            let ptr = self.data.as_ptr().add(self.read);

            if ptr.add(len).read() != 0 {
                return Err(Error::new(ErrorKind::NotNullTerminated));
            }

            from_raw_parts(ptr, len)
        };

        self.read += len + 1;
        Ok(slice)
    }
}

// SAFETY: Aligned is equivalent to `&[u8]`.
unsafe impl Send for Aligned<'_> {}
// SAFETY: Aligned is equivalent to `&[u8]`.
unsafe impl Sync for Aligned<'_> {}

impl Clone for Aligned<'_> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            data: self.data,
            read: self.read,
            written: self.written,
            _marker: self._marker,
        }
    }
}

impl fmt::Debug for Aligned<'_> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aligned")
            .field("pos", &self.read)
            .field("len", &self.len())
            .finish()
    }
}

impl<'a> PartialEq<Aligned<'a>> for Aligned<'_> {
    #[inline]
    fn eq(&self, other: &Aligned<'a>) -> bool {
        self.get() == other.get()
    }
}

impl PartialEq<AlignedBuf> for Aligned<'_> {
    #[inline]
    fn eq(&self, other: &AlignedBuf) -> bool {
        self.get() == other.get()
    }
}

impl Eq for Aligned<'_> {}
