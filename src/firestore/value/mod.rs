mod array_value;
mod bytes_value;
mod map_value;
mod order;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use order::{compare_values, same_type_order};
pub use value::{FirestoreValue, ServerTimestampValue, ValueKind};
