use std::alloc::Layout;
use std::ptr;

use heap::HeapProxy;
use object::{
    Array, ByteArray, Str, Tagged, Tuple, Value, array_allocation_size,
    byte_array_allocation_size, init_array, init_byte_array, init_str,
    init_tuple, str_allocation_size, tuple_allocation_size,
};

/// Allocate a [`Tuple`] holding `elements`.
pub fn alloc_tuple(proxy: &mut HeapProxy, elements: &[Value]) -> Tagged<Tuple> {
    let size = tuple_allocation_size(elements.len() as u64);
    let layout = Layout::from_size_align(size, 8).expect("tuple layout");
    let ptr = proxy.allocate(layout).as_ptr() as *mut Tuple;
    // SAFETY: freshly allocated with room for the inline elements.
    unsafe {
        init_tuple(ptr, elements.len() as u64);
        if !elements.is_empty() {
            let dst = ptr.add(1) as *mut Value;
            ptr::copy_nonoverlapping(elements.as_ptr(), dst, elements.len());
        }
    }
    Tagged::from_value(Value::from_ptr(ptr))
}

/// Allocate an [`Array`] with fresh backing storage holding `elements`.
pub fn alloc_array(proxy: &mut HeapProxy, elements: &[Value]) -> Tagged<Array> {
    let storage = alloc_tuple(proxy, elements);
    alloc_array_adopting(proxy, elements.len() as u64, storage.value())
}

/// Allocate an [`Array`] that adopts an existing backing store — the
/// destination side of a destructive move.
///
/// `storage` must reference a [`Tuple`] of at least `length` elements.
pub fn alloc_array_adopting(
    proxy: &mut HeapProxy,
    length: u64,
    storage: Value,
) -> Tagged<Array> {
    let layout = Layout::from_size_align(array_allocation_size(), 8)
        .expect("array layout");
    let ptr = proxy.allocate(layout).as_ptr() as *mut Array;
    // SAFETY: freshly allocated, correctly sized.
    unsafe { init_array(ptr, length, storage) };
    Tagged::from_value(Value::from_ptr(ptr))
}

/// Allocate a [`ByteArray`] holding `bytes`.
pub fn alloc_byte_array(
    proxy: &mut HeapProxy,
    bytes: &[u8],
) -> Tagged<ByteArray> {
    let size = byte_array_allocation_size(bytes.len() as u64);
    let layout = Layout::from_size_align(size, 8).expect("byte array layout");
    let ptr = proxy.allocate(layout).as_ptr() as *mut ByteArray;
    // SAFETY: freshly allocated with room for the inline bytes.
    unsafe {
        init_byte_array(ptr, bytes.len() as u64);
        if !bytes.is_empty() {
            let dst = ptr.add(1) as *mut u8;
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
    }
    Tagged::from_value(Value::from_ptr(ptr))
}

/// Allocate a [`Str`] with fresh backing storage holding `content`.
pub fn alloc_str(proxy: &mut HeapProxy, content: &str) -> Tagged<Str> {
    let data = alloc_byte_array(proxy, content.as_bytes());
    let layout =
        Layout::from_size_align(str_allocation_size(), 8).expect("str layout");
    let ptr = proxy.allocate(layout).as_ptr() as *mut Str;
    // SAFETY: freshly allocated; data holds the content bytes.
    unsafe { init_str(ptr, content.len() as u64, data.value()) };
    Tagged::from_value(Value::from_ptr(ptr))
}

/// Duplicate a string with independent backing storage.
///
/// # Safety
///
/// `source` must be a valid, live [`Str`] whose data references a valid
/// [`ByteArray`].
pub unsafe fn alloc_str_dup(
    proxy: &mut HeapProxy,
    source: &Str,
) -> Tagged<Str> {
    let content = unsafe { source.as_str() };
    alloc_str(proxy, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;

    #[test]
    fn array_round_trip() {
        let (_rt, mut m) = Runtime::new();
        let elements = [Value::from_i64(4), Value::from_i64(5)];
        let arr = alloc_array(&mut m.proxy, &elements);
        let a: &Array = unsafe { arr.as_ref() };
        assert_eq!(a.len(), 2);
        assert_eq!(unsafe { a.element(0) }, elements[0]);
        assert_eq!(unsafe { a.element(1) }, elements[1]);
    }

    #[test]
    fn str_round_trip_and_duplication() {
        let (_rt, mut m) = Runtime::new();
        let s = alloc_str(&mut m.proxy, "kette");
        let sref: &Str = unsafe { s.as_ref() };
        assert_eq!(unsafe { sref.as_str() }, "kette");

        let dup = unsafe { alloc_str_dup(&mut m.proxy, sref) };
        let dref: &Str = unsafe { dup.as_ref() };
        assert_eq!(unsafe { dref.as_str() }, "kette");
        assert_ne!(dup.value(), s.value());
        assert_ne!(dref.data, sref.data, "backing stores must be independent");
    }

    #[test]
    fn adopting_reuses_the_storage() {
        let (_rt, mut m) = Runtime::new();
        let storage = alloc_tuple(
            &mut m.proxy,
            &[Value::from_i64(1), Value::from_i64(2)],
        );
        let arr = alloc_array_adopting(&mut m.proxy, 2, storage.value());
        let a: &Array = unsafe { arr.as_ref() };
        assert_eq!(a.storage, storage.value());
        assert_eq!(unsafe { a.element(1) }, Value::from_i64(2));
    }
}
