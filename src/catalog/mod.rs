pub mod schema;
pub mod types;

pub use schema::{
    Attribute, DimId, Dimension, FILL_VALUE_ATTR, MAX_NAME_LEN, Schema, UNPLACED, VarId, Variable,
};
pub use types::{NcType, padded_len};
