mod alloc;
pub mod channel;
mod gvl;
pub mod isolate;
mod runtime;
mod threading;
mod transfer;

pub use alloc::{
    alloc_array, alloc_array_adopting, alloc_byte_array, alloc_str,
    alloc_str_dup, alloc_tuple,
};
pub use channel::{Channel, ChannelObject};
pub use gvl::Gvl;
pub use isolate::{BoundThread, Isolate, IsolateObject, SpawnError};
pub use runtime::{Mutator, Runtime, trace_object};
pub use threading::{NativeThread, ThreadObject};
pub use transfer::{
    Shape, TransferError, classify, copy_value, freeze, is_deeply_immutable,
    move_value, share_value,
};
