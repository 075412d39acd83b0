/// Document identifier. The on-disk format always stores 64 bits.
pub type DocId = u64;

/// Hashed word identifier produced by the dictionary; 0 means "filtered out".
pub type WordId = u64;

/// Hard limit on full-text fields per index; the query parser and the
/// scorer both rely on a field mask fitting in 32 bits.
pub const MAX_FIELDS: usize = 32;

/// Field mask covering every field.
pub const ALL_FIELDS: u32 = u32::MAX;

/// Packed in-field hit position: `(field << 24) | flags | pos`.
///
/// Bit 23 flags the last hit of a field, so the scorer can detect
/// field-end without rereading the doclist entry. One document's hit
/// words are strictly increasing, which keeps hitlist deltas unsigned.
pub type Hitpos = u32;

pub const HIT_FIELD_SHIFT: u32 = 24;
pub const HIT_FIELD_END: u32 = 1 << 23;
pub const HIT_POS_MASK: u32 = HIT_FIELD_END - 1;

#[inline]
pub fn hit_pack(field: u32, pos: u32) -> Hitpos {
    debug_assert!((field as usize) < MAX_FIELDS);
    debug_assert!(pos > 0 && pos <= HIT_POS_MASK);
    (field << HIT_FIELD_SHIFT) | pos
}

#[inline]
pub fn hit_field(hit: Hitpos) -> u32 {
    hit >> HIT_FIELD_SHIFT
}

#[inline]
pub fn hit_pos(hit: Hitpos) -> u32 {
    hit & HIT_POS_MASK
}

#[inline]
pub fn hit_is_field_end(hit: Hitpos) -> bool {
    hit & HIT_FIELD_END != 0
}

#[inline]
pub fn hit_set_field_end(hit: Hitpos) -> Hitpos {
    hit | HIT_FIELD_END
}

/// Hit word stripped of the field-end flag; comparable across a phrase.
#[inline]
pub fn hit_order_key(hit: Hitpos) -> u32 {
    hit & !HIT_FIELD_END
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_packing_round_trip() {
        let h = hit_pack(3, 17);
        assert_eq!(hit_field(h), 3);
        assert_eq!(hit_pos(h), 17);
        assert!(!hit_is_field_end(h));

        let e = hit_set_field_end(h);
        assert!(hit_is_field_end(e));
        assert_eq!(hit_field(e), 3);
        assert_eq!(hit_pos(e), 17);
    }

    #[test]
    fn hits_are_monotonic_within_a_doc() {
        // field 0 pos 5 (last of field), then field 1 pos 1
        let a = hit_set_field_end(hit_pack(0, 5));
        let b = hit_pack(1, 1);
        assert!(a < b);
    }
}
