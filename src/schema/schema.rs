use serde::{Serialize, Deserialize};

use crate::core::error::{Error, Result};
use crate::core::types::MAX_FIELDS;
use crate::schema::attr::{AttrLocator, AttrType};

/// Full-text field definition. Field order fixes the field id used in
/// hit packing and field masks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrDef {
    pub name: String,
    pub kind: AttrType,
    pub locator: AttrLocator,
}

/// Ordered fields plus ordered attributes, both with unique lowercase
/// names. Building is append-only; `finalize` assigns locators and the
/// row width, which is identical for every match within one index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<FieldDef>,
    pub attrs: Vec<AttrDef>,
    /// Row width in 32-bit words; valid after `finalize`.
    pub row_size: usize,
}

impl Schema {
    pub fn new() -> Self {
        Schema::default()
    }

    pub fn add_field(&mut self, name: &str) -> Result<()> {
        if self.fields.len() >= MAX_FIELDS {
            return Err(Error::config(format!(
                "too many full-text fields (max {})", MAX_FIELDS)));
        }
        self.fields.push(FieldDef { name: name.to_lowercase() });
        Ok(())
    }

    /// Appends an attribute with a requested bit width (0 = type default).
    pub fn add_attr(&mut self, name: &str, kind: AttrType, bits: u32) -> Result<()> {
        let bits = if bits == 0 { kind.default_bits() } else { bits };
        if kind == AttrType::Int32 && (bits == 0 || bits > 32) {
            return Err(Error::config(format!(
                "attribute '{}': bit width {} out of range 1..=32", name, bits)));
        }
        self.attrs.push(AttrDef {
            name: name.to_lowercase(),
            kind,
            locator: AttrLocator { bit_offset: 0, bit_width: bits },
        });
        Ok(())
    }

    /// Computes locators and the row width; rejects duplicate names
    /// case-insensitively across fields and attributes.
    pub fn finalize(&mut self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.clone()) {
                return Err(Error::config(format!("duplicate field name '{}'", field.name)));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for attr in &self.attrs {
            if !seen.insert(attr.name.clone()) {
                return Err(Error::config(format!("duplicate attribute name '{}'", attr.name)));
            }
        }

        // Whole-word attributes first, then bitfields packed into
        // trailing words; a bitfield never straddles a word boundary.
        let mut bit_offset = 0u32;
        for attr in self.attrs.iter_mut() {
            if attr.locator.bit_width >= 32 {
                attr.locator.bit_offset = bit_offset;
                bit_offset += attr.locator.bit_width;
            }
        }
        let mut word_free = 0u32;
        for attr in self.attrs.iter_mut() {
            let width = attr.locator.bit_width;
            if width < 32 {
                if word_free < width {
                    attr.locator.bit_offset = bit_offset;
                    bit_offset += 32;
                    word_free = 32 - width;
                } else {
                    attr.locator.bit_offset = bit_offset - word_free;
                    word_free -= width;
                }
            }
        }
        self.row_size = (bit_offset as usize).div_ceil(32);
        Ok(())
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        let name = name.to_lowercase();
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn attr(&self, name: &str) -> Option<&AttrDef> {
        let name = name.to_lowercase();
        self.attrs.iter().find(|a| a.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locators_are_packed_and_row_size_derived() {
        let mut schema = Schema::new();
        schema.add_field("title").unwrap();
        schema.add_field("body").unwrap();
        schema.add_attr("views", AttrType::Int32, 0).unwrap();
        schema.add_attr("price", AttrType::Float32, 0).unwrap();
        schema.add_attr("uid", AttrType::Int64, 0).unwrap();
        schema.add_attr("published", AttrType::Bool, 0).unwrap();
        schema.add_attr("grade", AttrType::Int32, 7).unwrap();
        schema.finalize().unwrap();

        // 32 + 32 + 64 whole-word bits, then 1+7 packed into one word
        assert_eq!(schema.row_size, 5);

        let views = schema.attr("views").unwrap().locator;
        assert_eq!((views.bit_offset, views.bit_width), (0, 32));
        let uid = schema.attr("uid").unwrap().locator;
        assert_eq!(uid.bit_offset % 32, 0);
        assert_eq!(uid.bit_width, 64);
        let published = schema.attr("published").unwrap().locator;
        let grade = schema.attr("grade").unwrap().locator;
        assert_eq!(published.bit_offset / 32, grade.bit_offset / 32);
    }

    #[test]
    fn duplicate_names_rejected_case_insensitively() {
        let mut schema = Schema::new();
        schema.add_attr("Views", AttrType::Int32, 0).unwrap();
        schema.add_attr("views", AttrType::Int32, 0).unwrap();
        assert!(schema.finalize().is_err());
    }

    #[test]
    fn field_lookup_is_case_insensitive() {
        let mut schema = Schema::new();
        schema.add_field("Title").unwrap();
        schema.finalize().unwrap();
        assert_eq!(schema.field_index("TITLE"), Some(0));
    }
}
