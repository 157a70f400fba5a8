//! Useful traits and other utilities that don't really belong anywhere else.

/// Convenience methods for operating on `[u8]`s that represent flash contents
pub trait PageUtil {
    /// Does this buffer contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;

    /// Does every byte of this buffer equal `pattern`?
    fn is_filled_with(&self, pattern: u8) -> bool;

    /// Count the bits that differ from the erased state
    fn zero_bits(&self) -> u32;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.is_filled_with(0xFF)
    }

    fn is_filled_with(&self, pattern: u8) -> bool {
        self.iter().all(|&x| x == pattern)
    }

    fn zero_bits(&self) -> u32 {
        self.iter().map(|x| x.count_zeros()).sum()
    }
}

/// Find last set: the 1-based index of the most significant set bit, or 0 for 0.
pub fn fls(value: u32) -> u32 {
    u32::BITS - value.leading_zeros()
}

/// Read a little-endian DWORD out of a byte slice, treating missing bytes as 0.
pub fn le_dword(bytes: &[u8], index: usize) -> u32 {
    let mut dword = [0u8; 4];
    if let Some(src) = bytes.get(index * 4..) {
        let len = std::cmp::min(4, src.len());
        dword[..len].copy_from_slice(&src[..len]);
    }
    u32::from_le_bytes(dword)
}

#[test]
fn test_fls() {
    assert_eq!(fls(0), 0);
    assert_eq!(fls(1), 1);
    assert_eq!(fls(4097), 13);
    assert_eq!(fls(8193), 14);
    assert_eq!(fls(u32::MAX), 32);
}

#[test]
fn test_page_util() {
    assert!([0xFFu8; 16][..].is_erased());
    assert!(![0xFFu8, 0xFE][..].is_erased());
    assert_eq!([0xFFu8, 0xFE, 0x00][..].zero_bits(), 9);
    assert!([0x5Au8; 3][..].is_filled_with(0x5A));
}

#[test]
fn test_le_dword() {
    let bytes = [0x53, 0x46, 0x44, 0x50, 0x06, 0x01];
    assert_eq!(le_dword(&bytes, 0), 0x5044_4653);
    assert_eq!(le_dword(&bytes, 1), 0x0106);
    assert_eq!(le_dword(&bytes, 9), 0);
}
