use core::marker::PhantomData;

/// A typed handle to a previously reserved location in a buffer, used to
/// patch values such as array lengths after the fact.
#[must_use = "Must be used with store_at to write the reserved value"]
pub(crate) struct Alloc<T> {
    at: usize,
    _marker: PhantomData<T>,
}

impl<T> Alloc<T> {
    #[inline]
    pub(crate) const fn new(at: usize) -> Self {
        Self {
            at,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) const fn into_usize(self) -> usize {
        self.at
    }
}

impl<T> Clone for Alloc<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Alloc<T> {}
