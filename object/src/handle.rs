use crate::Value;
use core::marker::PhantomData;

/// A typed tagged value.
///
/// Same bits as [`Value`]; `T` records which heap type a reference value is
/// expected to point at. Dereferencing stays unsafe — the type parameter is
/// a promise made by whoever produced the handle, not something checked.
#[repr(transparent)]
pub struct Tagged<T> {
    value: Value,
    _marker: PhantomData<*const T>,
}

// `Tagged<T>` is a plain tagged word (`Value`) plus a zero-sized marker, so it
// is always copyable regardless of `T`. The `#[derive]` versions would add a
// spurious `T: Copy`/`T: Clone`/`T: Eq` bound, which the phantom marker types
// do not satisfy; implement the traits manually without that bound.
impl<T> Clone for Tagged<T> {
    #[inline(always)]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Tagged<T> {}

impl<T> PartialEq for Tagged<T> {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> Eq for Tagged<T> {}

// SAFETY: a Tagged<T> is a plain tagged word; it confers no access that the
// underlying Value would not.
unsafe impl<T> Send for Tagged<T> {}
// SAFETY: see above.
unsafe impl<T> Sync for Tagged<T> {}

impl<T> Tagged<T> {
    #[inline(always)]
    pub fn from_value(value: Value) -> Self {
        Self { value, _marker: PhantomData }
    }

    #[inline(always)]
    pub fn value(self) -> Value {
        self.value
    }

    #[inline(always)]
    pub fn is_fixnum(self) -> bool {
        self.value.is_fixnum()
    }

    #[inline(always)]
    pub fn is_ref(self) -> bool {
        self.value.is_ref()
    }

    /// Dereference as a shared reference to `T`.
    ///
    /// # Safety
    ///
    /// The value must be a reference to a valid, live `T`.
    #[inline(always)]
    pub unsafe fn as_ref<'a>(&self) -> &'a T {
        unsafe { self.value.as_ref() }
    }

    /// Dereference as a mutable reference to `T`.
    ///
    /// # Safety
    ///
    /// The value must be a reference to a valid, live `T`, and no other
    /// references to it may exist for the duration of the borrow.
    #[inline(always)]
    pub unsafe fn as_mut<'a>(&mut self) -> &'a mut T {
        unsafe { self.value.as_mut() }
    }
}

impl<T> core::fmt::Debug for Tagged<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Tagged({:?})", self.value)
    }
}

impl<T> From<Value> for Tagged<T> {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}

impl<T> From<Tagged<T>> for Value {
    fn from(handle: Tagged<T>) -> Self {
        handle.value
    }
}
