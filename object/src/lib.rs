mod value;
mod handle;
mod header;
mod objects;

pub use value::Value;
pub use handle::Tagged;
pub use header::{Header, HeaderFlags, ObjectType};
pub use objects::{
    Tuple, init_tuple, tuple_allocation_size,
    Array, init_array, array_allocation_size,
    ByteArray, init_byte_array, byte_array_allocation_size,
    Str, init_str, str_allocation_size,
};
