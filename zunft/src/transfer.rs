use thiserror::Error;

use object::{Array, Header, HeaderFlags, ObjectType, Str, Tuple, Value};

use crate::alloc::{alloc_array, alloc_array_adopting, alloc_str_dup, alloc_tuple};
use crate::runtime::Mutator;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    #[error("value cannot be copied between isolates")]
    Uncopyable,
    #[error("value cannot be moved between isolates")]
    Unmovable,
    #[error("current isolate has no parent to yield to")]
    NoParent,
}

/// Transfer classification, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Fixnum, or a structure explicitly marked frozen. Shared without
    /// transformation by every discipline.
    Immutable,
    /// Always shared by reference, never copied or moved.
    IsolateHandle,
    /// Ordered, indexable, variable-length container.
    Sequence,
    /// Immutable-length character buffer with independent backing storage on
    /// duplication.
    Text,
    /// Everything else; unsupported by copy and move.
    Opaque,
}

/// Whether `value` can never be mutated through any reference to it.
pub fn is_deeply_immutable(value: Value) -> bool {
    if value.is_fixnum() {
        return true;
    }
    if !value.is_ref() {
        return false;
    }
    // SAFETY: reference values point at live heap objects.
    let header = unsafe { &*value.as_ptr::<Header>() };
    header.has_flag(HeaderFlags::FROZEN)
}

pub fn classify(value: Value) -> Shape {
    if is_deeply_immutable(value) {
        return Shape::Immutable;
    }
    // SAFETY: non-fixnum values in transfer position are heap references.
    let header = unsafe { &*value.as_ptr::<Header>() };
    match header.object_type() {
        ObjectType::Isolate => Shape::IsolateHandle,
        ObjectType::Array => Shape::Sequence,
        ObjectType::Str => Shape::Text,
        ObjectType::Tuple
        | ObjectType::ByteArray
        | ObjectType::Channel
        | ObjectType::Thread => Shape::Opaque,
    }
}

/// Mark a heap object as frozen. Fixnums are already immutable; the call is
/// a no-op for them. Returns the value for chaining.
pub fn freeze(value: Value) -> Value {
    if value.is_ref() {
        // SAFETY: reference values point at live heap objects.
        let header = unsafe { &*value.as_ptr::<Header>() };
        header.add_flag(HeaderFlags::FROZEN);
    }
    value
}

/// Deep copy under transfer classification.
///
/// Immutable values and isolate handles pass through unchanged; sequences
/// copy element-wise into fresh storage, preserving order and leaving the
/// original untouched; text duplicates with independent backing storage.
pub fn copy_value(m: &mut Mutator, value: Value) -> Result<Value, TransferError> {
    match classify(value) {
        Shape::Immutable | Shape::IsolateHandle => Ok(value),
        Shape::Sequence => {
            // SAFETY: classified as Array; arrays stay live for the heap's
            // lifetime.
            let array: &Array = unsafe { value.as_ref() };
            let length = array.len();
            let mut copied = Vec::with_capacity(length as usize);
            for i in 0..length {
                // SAFETY: i < length and the storage tuple is live.
                let element = unsafe { array.element(i) };
                copied.push(copy_value(m, element)?);
            }
            Ok(alloc_array(&mut m.proxy, &copied).value())
        }
        Shape::Text => {
            // SAFETY: classified as Str.
            let source: &Str = unsafe { value.as_ref() };
            Ok(unsafe { alloc_str_dup(&mut m.proxy, source) }.value())
        }
        Shape::Opaque => Err(TransferError::Uncopyable),
    }
}

/// Destructive move under transfer classification.
///
/// A sequence is hollowed: non-immutable elements are themselves moved in
/// place inside the original storage, then a destination array adopts that
/// storage wholesale and the source is reset to a valid, empty array of the
/// same identity. The source never aliases the destination's storage.
///
/// The hollowing mutates the source without any lock on it; a concurrent
/// reader of the source mid-move observes a partially updated object.
pub fn move_value(m: &mut Mutator, value: Value) -> Result<Value, TransferError> {
    match classify(value) {
        Shape::Immutable | Shape::IsolateHandle => Ok(value),
        Shape::Sequence => {
            // SAFETY: classified as Array; the caller hands over the sole
            // managed reference for the duration of the move.
            let array: &mut Array = unsafe { value.as_mut() };
            let length = array.len();
            {
                // SAFETY: array storage references a live tuple.
                let storage: &mut Tuple = unsafe { array.storage.as_mut() };
                for i in 0..length {
                    // SAFETY: i < length.
                    let element = unsafe { storage.element(i) };
                    if !is_deeply_immutable(element) {
                        let moved = move_value(m, element)?;
                        // SAFETY: i < length.
                        unsafe { storage.set_element(i, moved) };
                    }
                }
            }
            let destination =
                alloc_array_adopting(&mut m.proxy, length, array.storage);
            let empty = alloc_tuple(&mut m.proxy, &[]);
            array.hollow(empty.value());
            Ok(destination.value())
        }
        Shape::Text => {
            // Immutable-length text needs no hollowing; an independent
            // duplicate is enough.
            // SAFETY: classified as Str.
            let source: &Str = unsafe { value.as_ref() };
            Ok(unsafe { alloc_str_dup(&mut m.proxy, source) }.value())
        }
        Shape::Opaque => Err(TransferError::Unmovable),
    }
}

/// Identity transfer — no classification check, no transformation.
pub fn share_value(value: Value) -> Value {
    value
}
