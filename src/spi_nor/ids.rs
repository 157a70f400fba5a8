//! Known SPI-NOR parts, by JEDEC ID.
//!
//! Parts are grouped by manufacturer, keyed on the first ID byte. Vendors without a table of
//! their own share [COMMON]. Each manufacturer also carries the fixups its parts need on top of
//! whatever SFDP says.

use bitflags::bitflags;

use super::sr::{FourByteMode, QuadEnable};
use super::DeviceDescription;

bitflags! {
    /// What a table entry knows about a part beyond its geometry
    pub struct InfoFlags: u32 {
        /// Has a 4 KiB erase (0x20)
        const SECT_4K = 1 << 0;
        /// Supports 1-1-2 fast read
        const DUAL_READ = 1 << 1;
        /// Supports 1-1-4 fast read
        const QUAD_READ = 1 << 2;
        /// Supports 1-1-4 page program
        const QUAD_PP = 1 << 3;
        /// Has dedicated 4-byte address opcodes
        const FOUR_BYTE_OPCODES = 1 << 4;
        /// Don't trust, or don't bother reading, SFDP
        const NO_SFDP = 1 << 5;
        /// Only supports the plain 0x03 read
        const NO_FAST_READ = 1 << 6;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlashInfo {
    pub name: &'static str,
    pub id: [u8; 3],
    pub sector_size: u32,
    pub n_sectors: u32,
    pub page_size: u32,
    pub flags: InfoFlags,
}

impl FlashInfo {
    pub fn size(&self) -> u64 {
        u64::from(self.sector_size) * u64::from(self.n_sectors)
    }

    /// Whether this is the placeholder for a part only SFDP can describe
    pub fn is_generic(&self) -> bool {
        self.name == GENERIC_NAME
    }
}

const fn part(
    name: &'static str,
    id: [u8; 3],
    sector_size: u32,
    n_sectors: u32,
    flags: InfoFlags,
) -> FlashInfo {
    FlashInfo {
        name,
        id,
        sector_size,
        n_sectors,
        page_size: 256,
        flags,
    }
}

const K64: u32 = 64 * 1024;

const SECT_4K: InfoFlags = InfoFlags::SECT_4K;
const QUAD: InfoFlags = InfoFlags::from_bits_truncate(
    InfoFlags::SECT_4K.bits() | InfoFlags::DUAL_READ.bits() | InfoFlags::QUAD_READ.bits(),
);
const QUAD_4B: InfoFlags =
    InfoFlags::from_bits_truncate(QUAD.bits() | InfoFlags::FOUR_BYTE_OPCODES.bits());

static MACRONIX: &[FlashInfo] = &[
    part("mx25l1606e", [0xC2, 0x20, 0x15], K64, 32, SECT_4K),
    part("mx25l6405d", [0xC2, 0x20, 0x17], K64, 128, SECT_4K),
    part("mx25l12805d", [0xC2, 0x20, 0x18], K64, 256, SECT_4K),
    part("mx25l25635e", [0xC2, 0x20, 0x19], K64, 512, QUAD),
    part("mx66l51235f", [0xC2, 0x20, 0x1A], K64, 1024, QUAD_4B),
    part("mx66l1g45g", [0xC2, 0x20, 0x1B], K64, 2048, QUAD),
];

static MICRON: &[FlashInfo] = &[
    part("m25p80", [0x20, 0x20, 0x14], K64, 16, InfoFlags::NO_SFDP),
    part("n25q128a13", [0x20, 0xBA, 0x18], K64, 256, QUAD),
    part("mt25ql256a", [0x20, 0xBA, 0x19], K64, 512, QUAD_4B),
    part("mt25ql512a", [0x20, 0xBA, 0x20], K64, 1024, QUAD_4B),
    part("n25q00", [0x20, 0xBA, 0x21], K64, 2048, QUAD),
];

static SPANSION: &[FlashInfo] = &[
    part("s25fl164k", [0x01, 0x40, 0x17], K64, 128, QUAD),
    part("s25fl128s", [0x01, 0x20, 0x18], K64, 256, QUAD),
    part(
        "s25fl256s",
        [0x01, 0x02, 0x19],
        K64,
        512,
        InfoFlags::from_bits_truncate(
            InfoFlags::DUAL_READ.bits()
                | InfoFlags::QUAD_READ.bits()
                | InfoFlags::FOUR_BYTE_OPCODES.bits(),
        ),
    ),
    part(
        "s25fl512s",
        [0x01, 0x02, 0x20],
        256 * 1024,
        256,
        InfoFlags::from_bits_truncate(
            InfoFlags::DUAL_READ.bits()
                | InfoFlags::QUAD_READ.bits()
                | InfoFlags::FOUR_BYTE_OPCODES.bits(),
        ),
    ),
];

static WINBOND: &[FlashInfo] = &[
    part("w25q80bl", [0xEF, 0x40, 0x14], K64, 16, QUAD),
    part("w25q64", [0xEF, 0x40, 0x17], K64, 128, QUAD),
    part("w25q128", [0xEF, 0x40, 0x18], K64, 256, QUAD),
    part("w25q256", [0xEF, 0x40, 0x19], K64, 512, QUAD),
    part("w25q512jv", [0xEF, 0x40, 0x20], K64, 1024, QUAD),
];

static ISSI: &[FlashInfo] = &[
    part("is25lp080d", [0x9D, 0x60, 0x14], K64, 16, QUAD),
    part("is25lp128", [0x9D, 0x60, 0x18], K64, 256, QUAD),
    part("is25lp256", [0x9D, 0x60, 0x19], K64, 512, QUAD_4B),
];

static GIGADEVICE: &[FlashInfo] = &[
    part("gd25q16", [0xC8, 0x40, 0x15], K64, 32, QUAD),
    part("gd25q64", [0xC8, 0x40, 0x17], K64, 128, QUAD),
    part("gd25q128", [0xC8, 0x40, 0x18], K64, 256, QUAD),
    part("gd25q256", [0xC8, 0x40, 0x19], K64, 512, QUAD_4B),
];

/// Parts from vendors without a table of their own
pub static COMMON: &[FlashInfo] = &[
    part("at25df321a", [0x1F, 0x47, 0x01], K64, 64, SECT_4K),
    part("at25df641", [0x1F, 0x48, 0x00], K64, 128, SECT_4K),
    part(
        "sst25vf016b",
        [0xBF, 0x25, 0x41],
        K64,
        32,
        InfoFlags::from_bits_truncate(InfoFlags::SECT_4K.bits() | InfoFlags::NO_SFDP.bits()),
    ),
    part("sst26vf064b", [0xBF, 0x26, 0x43], K64, 128, QUAD),
];

const GENERIC_NAME: &str = "spi-nor-generic";

/// A placeholder for a part that is only known through SFDP
pub fn generic(id: [u8; 3]) -> FlashInfo {
    part(GENERIC_NAME, id, 0, 0, InfoFlags::empty())
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Manufacturer {
    Atmel,
    Gigadevice,
    Issi,
    Macronix,
    Micron,
    Spansion,
    Sst,
    Winbond,
    Other(u8),
}

impl Manufacturer {
    pub fn from_id(id: u8) -> Self {
        match id {
            0x1F => Self::Atmel,
            0xC8 => Self::Gigadevice,
            0x9D => Self::Issi,
            0xC2 => Self::Macronix,
            0x20 => Self::Micron,
            0x01 => Self::Spansion,
            0xBF => Self::Sst,
            0xEF => Self::Winbond,
            other => Self::Other(other),
        }
    }

    fn parts(self) -> &'static [FlashInfo] {
        match self {
            Self::Gigadevice => GIGADEVICE,
            Self::Issi => ISSI,
            Self::Macronix => MACRONIX,
            Self::Micron => MICRON,
            Self::Spansion => SPANSION,
            Self::Winbond => WINBOND,
            Self::Atmel | Self::Sst | Self::Other(_) => &[],
        }
    }

    /// Adjust what SFDP or the table said to what the part actually needs
    ///
    /// `qe_from_sfdp` says whether the quad enable method came from the BFPT, which always wins.
    pub(super) fn fixup(self, desc: &mut DeviceDescription, qe_from_sfdp: bool) {
        match self {
            Self::Micron => desc.four_byte_mode = FourByteMode::WrenEn4bEx4b,
            Self::Spansion => desc.four_byte_mode = FourByteMode::BankRegister,
            Self::Winbond => desc.four_byte_mode = FourByteMode::En4bEx4bClearEar,
            _ => {}
        }

        if qe_from_sfdp || desc.quad_enable == QuadEnable::None {
            return;
        }
        desc.quad_enable = match self {
            Self::Macronix | Self::Issi => QuadEnable::Sr1Bit6,
            Self::Winbond | Self::Gigadevice => QuadEnable::Legacy,
            _ => desc.quad_enable,
        };
    }
}

/// Look a part up by JEDEC ID: first in its manufacturer's table, then in [COMMON]
pub fn find_by_id(id: &[u8; 3]) -> Option<&'static FlashInfo> {
    Manufacturer::from_id(id[0])
        .parts()
        .iter()
        .chain(COMMON)
        .find(|info| info.id == *id)
}

/// Look a part up by name
pub fn find_by_name(name: &str) -> Option<&'static FlashInfo> {
    [MACRONIX, MICRON, SPANSION, WINBOND, ISSI, GIGADEVICE, COMMON]
        .into_iter()
        .flatten()
        .find(|info| info.name == name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lookup() {
        let info = find_by_id(&[0xEF, 0x40, 0x18]).map(|i| i.name);
        assert_eq!(info, Some("w25q128"));
        assert_eq!(find_by_id(&[0x1F, 0x47, 0x01]).map(|i| i.name), Some("at25df321a"));
        assert_eq!(find_by_id(&[0xEF, 0x99, 0x99]), None);
        assert_eq!(find_by_name("s25fl512s").map(|i| i.size()), Some(64 << 20));
        assert!(generic([1, 2, 3]).is_generic());
    }

    #[test]
    fn test_tables_consistent() {
        let all = [MACRONIX, MICRON, SPANSION, WINBOND, ISSI, GIGADEVICE];
        for table in all {
            let vendor = Manufacturer::from_id(table[0].id[0]);
            for info in table {
                assert_eq!(Manufacturer::from_id(info.id[0]), vendor, "{}", info.name);
                assert!(info.size().is_power_of_two(), "{}", info.name);
                assert_eq!(find_by_id(&info.id), Some(info));
            }
        }
    }
}
