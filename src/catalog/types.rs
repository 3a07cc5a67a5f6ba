use serde::{Deserialize, Serialize};

/// External element types of the classic model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NcType {
    Byte,
    Char,
    Short,
    Int,
    Float,
    Double,
}

pub const FILL_BYTE: i8 = -127;
pub const FILL_CHAR: u8 = 0;
pub const FILL_SHORT: i16 = -32767;
pub const FILL_INT: i32 = -2_147_483_647;
pub const FILL_FLOAT: f32 = f32::from_bits(0x7cf0_0000);
pub const FILL_DOUBLE: f64 = f64::from_bits(0x479e_0000_0000_0000);

impl NcType {
    /// Encoded size of one element in bytes.
    pub fn size(self) -> u64 {
        match self {
            NcType::Byte | NcType::Char => 1,
            NcType::Short => 2,
            NcType::Int | NcType::Float => 4,
            NcType::Double => 8,
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            NcType::Byte => 1,
            NcType::Char => 2,
            NcType::Short => 3,
            NcType::Int => 4,
            NcType::Float => 5,
            NcType::Double => 6,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(NcType::Byte),
            2 => Some(NcType::Char),
            3 => Some(NcType::Short),
            4 => Some(NcType::Int),
            5 => Some(NcType::Float),
            6 => Some(NcType::Double),
            _ => None,
        }
    }

    /// Big-endian encoding of the type's default fill value.
    pub fn default_fill(self) -> Vec<u8> {
        match self {
            NcType::Byte => FILL_BYTE.to_be_bytes().to_vec(),
            NcType::Char => vec![FILL_CHAR],
            NcType::Short => FILL_SHORT.to_be_bytes().to_vec(),
            NcType::Int => FILL_INT.to_be_bytes().to_vec(),
            NcType::Float => FILL_FLOAT.to_be_bytes().to_vec(),
            NcType::Double => FILL_DOUBLE.to_be_bytes().to_vec(),
        }
    }
}

impl std::fmt::Display for NcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NcType::Byte => "byte",
            NcType::Char => "char",
            NcType::Short => "short",
            NcType::Int => "int",
            NcType::Float => "float",
            NcType::Double => "double",
        };
        f.write_str(name)
    }
}

/// Round a byte count up to the 4-byte boundary used by the on-disk encoding.
pub fn padded_len(n: u64) -> u64 {
    n.div_ceil(4) * 4
}
