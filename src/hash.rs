
//! String hashing for the device file tables.

/// Per hashed char hash shift.
const PJW_SHIFT: u32 = 4;

/// Mask for hash top bits.
const PJW_MASK: u32 = 0xf000_0000;

/// Right shift distance for hash top bits.
const PJW_RIGHT_SHIFT: u32 = 24;


/// Compute a hash of a byte string.
/// This is an implementation of hashpjw without any branches in the loop.
pub fn string_hash(string: &[u8]) -> u32 {
    let mut hash = 0_u32;

    for &byte in string {
        hash = (hash << PJW_SHIFT).wrapping_add(u32::from(byte));
        let bits = hash & PJW_MASK;
        hash ^= bits | (bits >> PJW_RIGHT_SHIFT);
    }

    hash
}

/// Lowercase the ASCII letters of a name, leaving all other bytes alone.
pub fn lowercase(name: &[u8]) -> Vec<u8> {
    name.iter().map(u8::to_ascii_lowercase).collect()
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_is_case_sensitive(){
        assert_ne!(string_hash(b"Content_Types.xml"), string_hash(b"content_types.xml"));
        assert_eq!(string_hash(&lowercase(b"Content_Types.xml")), string_hash(b"content_types.xml"));
    }

    #[test]
    fn hash_spreads(){
        // no deep statistics, just catch a broken fold
        let hashes: std::collections::HashSet<u32> =
            (0..100).map(|index| string_hash(format!("file-{}.ppm", index).as_bytes())).collect();

        assert_eq!(hashes.len(), 100);
    }
}
