use serde::{Serialize, Deserialize};

use crate::core::error::{Error, Result};

/// Attribute value type. `Ordinal` is a string materialized at index
/// time as its dense rank; `Mva` values live out-of-row in the shared
/// pool, the row holds a 32-bit pool offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrType {
    Int32,
    Int64,
    Bool,
    Timestamp,
    Float32,
    Ordinal,
    Mva,
}

impl AttrType {
    pub fn from_config(name: &str, bits: Option<u32>) -> Result<(AttrType, u32)> {
        match name {
            "uint" => {
                let bits = bits.unwrap_or(32);
                if bits == 0 || bits > 32 {
                    return Err(Error::config(format!("uint bit width {} out of range 1..=32", bits)));
                }
                Ok((AttrType::Int32, bits))
            }
            "bigint" => Ok((AttrType::Int64, 64)),
            "bool" => Ok((AttrType::Bool, 1)),
            "timestamp" => Ok((AttrType::Timestamp, 32)),
            "float" => Ok((AttrType::Float32, 32)),
            "ordinal" => Ok((AttrType::Ordinal, 32)),
            "mva" => Ok((AttrType::Mva, 32)),
            other => Err(Error::config(format!("unknown attribute type '{}'", other))),
        }
    }

    pub fn default_bits(self) -> u32 {
        match self {
            AttrType::Int64 => 64,
            AttrType::Bool => 1,
            _ => 32,
        }
    }

    pub fn is_float(self) -> bool {
        self == AttrType::Float32
    }

    pub fn is_mva(self) -> bool {
        self == AttrType::Mva
    }
}

/// Bit locator of one attribute inside the packed row.
/// `bit_width == 0` marks an absent attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrLocator {
    pub bit_offset: u32,
    pub bit_width: u32,
}

impl AttrLocator {
    pub fn none() -> Self {
        AttrLocator { bit_offset: 0, bit_width: 0 }
    }

    pub fn is_none(&self) -> bool {
        self.bit_width == 0
    }
}

/// View helpers interpreting a `[u32]` row through locators.
///
/// Invariants kept by `Schema::finalize`: widths over 32 bits occupy
/// whole row words; narrower fields never straddle a word boundary.
pub struct PackedRow;

impl PackedRow {
    /// Zero-extending read of a packed cell.
    pub fn get(row: &[u32], loc: AttrLocator) -> u64 {
        if loc.is_none() {
            return 0;
        }
        let word = (loc.bit_offset / 32) as usize;
        if loc.bit_width == 64 {
            (row[word] as u64) | ((row[word + 1] as u64) << 32)
        } else if loc.bit_width == 32 {
            row[word] as u64
        } else {
            let shift = loc.bit_offset % 32;
            let mask = (1u32 << loc.bit_width) - 1;
            ((row[word] >> shift) & mask) as u64
        }
    }

    /// Clears the cell, then ORs the packed value in.
    pub fn set(row: &mut [u32], loc: AttrLocator, value: u64) {
        if loc.is_none() {
            return;
        }
        let word = (loc.bit_offset / 32) as usize;
        if loc.bit_width == 64 {
            row[word] = value as u32;
            row[word + 1] = (value >> 32) as u32;
        } else if loc.bit_width == 32 {
            row[word] = value as u32;
        } else {
            let shift = loc.bit_offset % 32;
            let mask = (1u32 << loc.bit_width) - 1;
            row[word] &= !(mask << shift);
            row[word] |= ((value as u32) & mask) << shift;
        }
    }

    pub fn get_float(row: &[u32], loc: AttrLocator) -> f32 {
        f32::from_bits(Self::get(row, loc) as u32)
    }

    pub fn set_float(row: &mut [u32], loc: AttrLocator, value: f32) {
        Self::set(row, loc, value.to_bits() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_word_get_set() {
        let mut row = [0u32; 3];
        let loc = AttrLocator { bit_offset: 32, bit_width: 32 };
        PackedRow::set(&mut row, loc, 0xCAFEBABE);
        assert_eq!(PackedRow::get(&row, loc), 0xCAFEBABE);
        assert_eq!(row[0], 0);
        assert_eq!(row[2], 0);
    }

    #[test]
    fn wide_field_spans_two_words() {
        let mut row = [0u32; 2];
        let loc = AttrLocator { bit_offset: 0, bit_width: 64 };
        PackedRow::set(&mut row, loc, u64::MAX - 5);
        assert_eq!(PackedRow::get(&row, loc), u64::MAX - 5);
    }

    #[test]
    fn bitfields_pack_without_clobbering() {
        let mut row = [0u32; 1];
        let a = AttrLocator { bit_offset: 0, bit_width: 3 };
        let b = AttrLocator { bit_offset: 3, bit_width: 5 };
        PackedRow::set(&mut row, a, 0b101);
        PackedRow::set(&mut row, b, 0b10110);
        assert_eq!(PackedRow::get(&row, a), 0b101);
        assert_eq!(PackedRow::get(&row, b), 0b10110);

        // overwrite clears old bits first
        PackedRow::set(&mut row, a, 0b010);
        assert_eq!(PackedRow::get(&row, a), 0b010);
        assert_eq!(PackedRow::get(&row, b), 0b10110);
    }

    #[test]
    fn float_reinterprets_bits() {
        let mut row = [0u32; 1];
        let loc = AttrLocator { bit_offset: 0, bit_width: 32 };
        PackedRow::set_float(&mut row, loc, -1.25);
        assert_eq!(PackedRow::get_float(&row, loc), -1.25);
        assert_eq!(row[0], (-1.25f32).to_bits());
    }
}
