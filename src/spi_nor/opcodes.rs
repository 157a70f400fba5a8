//! Standard SPI-NOR opcodes, status register bits, and the 3-byte to 4-byte address opcode map.

/// Write Enable
pub const WREN: u8 = 0x06;
/// Write Disable
pub const WRDI: u8 = 0x04;

/// Read Status Register 1
pub const RDSR: u8 = 0x05;
/// Write Status Register (1, or 1 and 2 with two data bytes)
pub const WRSR: u8 = 0x01;
/// Read Status Register 2 / Configuration Register
pub const RDCR: u8 = 0x35;
/// Write Status Register 2 alone
pub const WRSR2: u8 = 0x31;
/// Read Status Register 2, for parts with QE in bit 7
pub const RDSR2_BIT7: u8 = 0x3F;
/// Write Status Register 2, for parts with QE in bit 7
pub const WRSR2_BIT7: u8 = 0x3E;

/// Read JEDEC ID
pub const RDID: u8 = 0x9F;
/// Read SFDP
pub const RDSFDP: u8 = 0x5A;

pub const READ: u8 = 0x03;
pub const READ_FAST: u8 = 0x0B;
pub const READ_1_1_2: u8 = 0x3B;
pub const READ_1_2_2: u8 = 0xBB;
pub const READ_1_1_4: u8 = 0x6B;
pub const READ_1_4_4: u8 = 0xEB;
pub const READ_1_1_8: u8 = 0x8B;
pub const READ_1_8_8: u8 = 0xCB;

pub const READ_4B: u8 = 0x13;
pub const READ_FAST_4B: u8 = 0x0C;
pub const READ_1_1_2_4B: u8 = 0x3C;
pub const READ_1_2_2_4B: u8 = 0xBC;
pub const READ_1_1_4_4B: u8 = 0x6C;
pub const READ_1_4_4_4B: u8 = 0xEC;
pub const READ_1_1_8_4B: u8 = 0x7C;
pub const READ_1_8_8_4B: u8 = 0xCC;

/// Page Program
pub const PP: u8 = 0x02;
pub const PP_1_1_4: u8 = 0x32;
pub const PP_1_4_4: u8 = 0x38;
pub const PP_1_1_8: u8 = 0x82;
pub const PP_1_8_8: u8 = 0xC2;

pub const PP_4B: u8 = 0x12;
pub const PP_1_1_4_4B: u8 = 0x34;
pub const PP_1_4_4_4B: u8 = 0x3E;
pub const PP_1_1_8_4B: u8 = 0x84;
pub const PP_1_8_8_4B: u8 = 0x8E;

/// 4 KiB erase
pub const BE_4K: u8 = 0x20;
/// 32 KiB erase
pub const BE_32K: u8 = 0x52;
/// Sector (usually 64 KiB) erase
pub const SE: u8 = 0xD8;
/// Chip erase
pub const CHIP_ERASE: u8 = 0xC7;

pub const BE_4K_4B: u8 = 0x21;
pub const BE_32K_4B: u8 = 0x5C;
pub const SE_4B: u8 = 0xDC;

/// Enter 4-byte address mode
pub const EN4B: u8 = 0xB7;
/// Exit 4-byte address mode
pub const EX4B: u8 = 0xE9;
/// Bank register write (Spansion)
pub const BRWR: u8 = 0x17;
/// Bank register read (Spansion)
pub const BRRD: u8 = 0x16;
/// Write extended address register
pub const WREAR: u8 = 0xC5;
/// Read extended address register
pub const RDEAR: u8 = 0xC8;

/// Status register 1: write in progress
pub const SR_WIP: u8 = 1 << 0;
/// Status register 1: write enable latch
pub const SR_WEL: u8 = 1 << 1;
/// Status register 1: quad enable, for Macronix-style parts
pub const SR1_QUAD_EN_BIT6: u8 = 1 << 6;
/// Status register 2: quad enable
pub const SR2_QUAD_EN_BIT1: u8 = 1 << 1;
/// Status register 2: quad enable, for parts read with [RDSR2_BIT7]
pub const SR2_QUAD_EN_BIT7: u8 = 1 << 7;
/// Bank register: extended (4-byte) addressing
pub const BANK_EXTADD: u8 = 1 << 7;

const READ_3TO4: &[(u8, u8)] = &[
    (READ, READ_4B),
    (READ_FAST, READ_FAST_4B),
    (READ_1_1_2, READ_1_1_2_4B),
    (READ_1_2_2, READ_1_2_2_4B),
    (READ_1_1_4, READ_1_1_4_4B),
    (READ_1_4_4, READ_1_4_4_4B),
    (READ_1_1_8, READ_1_1_8_4B),
    (READ_1_8_8, READ_1_8_8_4B),
];

const PROGRAM_3TO4: &[(u8, u8)] = &[
    (PP, PP_4B),
    (PP_1_1_4, PP_1_1_4_4B),
    (PP_1_4_4, PP_1_4_4_4B),
    (PP_1_1_8, PP_1_1_8_4B),
    (PP_1_8_8, PP_1_8_8_4B),
];

const ERASE_3TO4: &[(u8, u8)] = &[(BE_4K, BE_4K_4B), (BE_32K, BE_32K_4B), (SE, SE_4B)];

fn convert(table: &[(u8, u8)], opcode: u8) -> u8 {
    table
        .iter()
        .find(|(from, _)| *from == opcode)
        .map_or(opcode, |&(_, to)| to)
}

/// The 4-byte address twin of a read opcode; unknown opcodes are returned unchanged
pub fn read_3to4(opcode: u8) -> u8 {
    convert(READ_3TO4, opcode)
}

/// The 4-byte address twin of a page program opcode
pub fn program_3to4(opcode: u8) -> u8 {
    convert(PROGRAM_3TO4, opcode)
}

/// The 4-byte address twin of an erase opcode
pub fn erase_3to4(opcode: u8) -> u8 {
    convert(ERASE_3TO4, opcode)
}

/// Does this opcode always take a 4-byte address?
pub fn is_4b_opcode(opcode: u8) -> bool {
    [READ_3TO4, PROGRAM_3TO4, ERASE_3TO4]
        .iter()
        .any(|table| table.iter().any(|&(_, to)| to == opcode))
}

#[test]
fn test_3to4() {
    assert_eq!(read_3to4(READ_1_4_4), READ_1_4_4_4B);
    assert_eq!(program_3to4(PP_1_1_4), PP_1_1_4_4B);
    assert_eq!(erase_3to4(BE_4K), BE_4K_4B);
    assert_eq!(erase_3to4(0x81), 0x81);
    assert!(is_4b_opcode(SE_4B));
    assert!(!is_4b_opcode(SE));
}
