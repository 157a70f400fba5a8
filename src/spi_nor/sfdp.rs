//! Serial Flash Discoverable Parameters (JESD216).
//!
//! The SFDP area starts with an 8-byte header and a list of parameter headers, each pointing at
//! a table of little-endian dwords. Three tables are understood here: the Basic Flash Parameter
//! Table, the 4-byte Address Instruction Table and the Sector Map Parameter Table. Parsing is
//! pure; the tables are fetched through [SfdpRead], which a live chip or a dump implements.

use log::{debug, warn};

use super::caps::{Hwcaps, ReadCmd};
use super::erase::EraseType;
use super::op::Protocol;
use super::opcodes::*;
use super::sr::{FourByteMode, QuadEnable};
use crate::error::{Error, Result};

/// "SFDP", little-endian
pub const SFDP_SIGNATURE: u32 = 0x5044_4653;
pub const SFDP_MAJOR: u8 = 1;

pub const PARAM_ID_BFPT: u16 = 0xFF00;
pub const PARAM_ID_SMPT: u16 = 0xFF81;
pub const PARAM_ID_4BAIT: u16 = 0xFF84;

/// JESD216 without revisions
pub const BFPT_DWORDS_V1: usize = 9;
/// JESD216 rev A and B
pub const BFPT_DWORDS_REV_A: usize = 16;
/// Everything past this is not used
pub const BFPT_DWORDS_MAX: usize = 20;

/// Where the BFPT describes one fast read mode
pub(crate) struct BfptRead {
    pub hwcaps: Hwcaps,
    pub proto: Protocol,
    /// Dword (1-based) and bit of the "supported" flag
    pub supported: (usize, u32),
    /// Dword (1-based) and shift of the 16-bit settings
    pub settings: (usize, u32),
}

pub(crate) const BFPT_READS: [BfptRead; 6] = [
    BfptRead {
        hwcaps: Hwcaps::READ_1_1_2,
        proto: Protocol::SPI_1_1_2,
        supported: (1, 16),
        settings: (4, 0),
    },
    BfptRead {
        hwcaps: Hwcaps::READ_1_2_2,
        proto: Protocol::SPI_1_2_2,
        supported: (1, 20),
        settings: (4, 16),
    },
    BfptRead {
        hwcaps: Hwcaps::READ_2_2_2,
        proto: Protocol::SPI_2_2_2,
        supported: (5, 0),
        settings: (6, 16),
    },
    BfptRead {
        hwcaps: Hwcaps::READ_1_1_4,
        proto: Protocol::SPI_1_1_4,
        supported: (1, 22),
        settings: (3, 16),
    },
    BfptRead {
        hwcaps: Hwcaps::READ_1_4_4,
        proto: Protocol::SPI_1_4_4,
        supported: (1, 21),
        settings: (3, 0),
    },
    BfptRead {
        hwcaps: Hwcaps::READ_4_4_4,
        proto: Protocol::SPI_4_4_4,
        supported: (5, 4),
        settings: (7, 16),
    },
];

/// Every read mode the BFPT has an opinion on
pub fn bfpt_read_caps() -> Hwcaps {
    BFPT_READS
        .iter()
        .fold(Hwcaps::empty(), |caps, rd| caps | rd.hwcaps)
}

/// Erase type `i` (in BFPT order) lives in this dword (1-based), at this shift
pub(crate) const BFPT_ERASES: [(usize, u32); 4] = [(8, 0), (8, 16), (9, 0), (9, 16)];

/// Something the SFDP area can be read from
pub trait SfdpRead {
    fn read_sfdp(&mut self, addr: u32, buf: &mut [u8]) -> anyhow::Result<()>;
}

/// An SFDP area that was dumped to memory. Bytes past its end read as 0xFF.
pub struct SfdpDump<'a>(pub &'a [u8]);

impl SfdpRead for SfdpDump<'_> {
    fn read_sfdp(&mut self, addr: u32, buf: &mut [u8]) -> anyhow::Result<()> {
        buf.fill(0xFF);
        let start = (addr as usize).min(self.0.len());
        let end = start.saturating_add(buf.len()).min(self.0.len());
        buf[..end - start].copy_from_slice(&self.0[start..end]);
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ParamHeader {
    pub id: u16,
    pub minor: u8,
    pub major: u8,

    /// Table length in dwords
    pub length: u8,

    /// Byte address of the table in the SFDP area
    pub pointer: u32,
}

impl ParamHeader {
    fn parse(b: &[u8]) -> Self {
        Self {
            id: u16::from_le_bytes([b[0], b[7]]),
            minor: b[1],
            major: b[2],
            length: b[3],
            pointer: u32::from_le_bytes([b[4], b[5], b[6], 0]),
        }
    }
}

/// What the Basic Flash Parameter Table says
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bfpt {
    pub minor: u8,

    /// Dwords the table claims to have
    pub length: usize,

    /// 3 or 4 when the part only takes that address width
    pub addr_nbytes: Option<u8>,

    /// Device size in bytes
    pub size: u64,

    /// Supported fast read modes, among [bfpt_read_caps]
    pub reads: Vec<(Hwcaps, ReadCmd)>,

    /// Supported erase types, in BFPT order
    pub erase_types: Vec<EraseType>,

    pub page_size: Option<u32>,
    pub quad_enable: Option<QuadEnable>,
    pub four_byte_mode: Option<FourByteMode>,

    /// The part has dedicated 4-byte address opcodes
    pub four_byte_opcodes: bool,
}

fn read_settings(half: u32, proto: Protocol) -> ReadCmd {
    ReadCmd {
        opcode: (half >> 8) as u8,
        mode_clocks: ((half >> 5) & 0x7) as u8,
        wait_states: (half & 0x1F) as u8,
        proto,
    }
}

impl Bfpt {
    /// Decode a BFPT of revision `minor` that claims `length` dwords, of which `dwords` were read
    pub fn parse(dwords: &[u32], minor: u8, length: usize) -> Result<Self> {
        if length < BFPT_DWORDS_V1 || dwords.len() < BFPT_DWORDS_V1 {
            return Err(Error::Corrupt {
                what: format!("BFPT of {length} dwords"),
            });
        }
        // 1-based, with missing dwords as zero
        let dw = |n: usize| dwords.get(n - 1).copied().unwrap_or(0);

        let addr_nbytes = match (dw(1) >> 17) & 0x3 {
            0b00 => Some(3),
            0b10 => Some(4),
            _ => None,
        };

        let density = dw(2);
        let bits = if density & 1 << 31 != 0 {
            let exp = density & !(1 << 31);
            if exp > 63 {
                return Err(Error::Corrupt {
                    what: format!("BFPT density 2^{exp} bits"),
                });
            }
            1u64 << exp
        } else {
            u64::from(density) + 1
        };
        let size = bits >> 3;
        if size == 0 {
            return Err(Error::Corrupt {
                what: format!("BFPT density {density:#010x}"),
            });
        }

        let reads = BFPT_READS
            .iter()
            .filter(|rd| dw(rd.supported.0) & 1 << rd.supported.1 != 0)
            .map(|rd| {
                let half = (dw(rd.settings.0) >> rd.settings.1) & 0xFFFF;
                (rd.hwcaps, read_settings(half, rd.proto))
            })
            .collect();

        let mut erase_types = Vec::new();
        for (i, &(n, shift)) in BFPT_ERASES.iter().enumerate() {
            let half = (dw(n) >> shift) & 0xFFFF;
            let exp = half & 0xFF;
            // Exponent 0 means the type is not supported
            if exp == 0 {
                continue;
            }
            if exp >= 32 {
                return Err(Error::Corrupt {
                    what: format!("BFPT erase type {} of 2^{exp} bytes", i + 1),
                });
            }
            erase_types.push(EraseType::new((half >> 8) as u8, 1 << exp, i as u8)?);
        }
        // Smallest first; each type keeps its BFPT index for SMPT masks
        erase_types.sort_by_key(|t| t.size);

        let mut bfpt = Self {
            minor,
            length,
            addr_nbytes,
            size,
            reads,
            erase_types,
            page_size: None,
            quad_enable: None,
            four_byte_mode: None,
            four_byte_opcodes: false,
        };

        // JESD216 rev A added the rest
        if length < BFPT_DWORDS_REV_A || dwords.len() < BFPT_DWORDS_REV_A {
            return Ok(bfpt);
        }

        bfpt.page_size = Some(1 << ((dw(11) >> 4) & 0xF));
        bfpt.quad_enable = Some(QuadEnable::from_bfpt((dw(15) >> 20) & 0x7)?);
        let enter_4b = dw(16) >> 24;
        bfpt.four_byte_mode = FourByteMode::from_bfpt(enter_4b);
        bfpt.four_byte_opcodes = enter_4b & 1 << 5 != 0;
        Ok(bfpt)
    }

    /// Whether this table has the rev A fields
    pub fn is_rev_a(&self) -> bool {
        self.quad_enable.is_some()
    }
}

/// What the 4-byte Address Instruction Table says
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FourBait {
    pub supported: u32,

    /// 4-byte erase opcodes, in BFPT erase type order
    pub erase_opcodes: [u8; 4],
}

/// Support bit and 4-byte opcode of each read mode in the 4BAIT
pub(crate) const FOUR_BAIT_READS: [(Hwcaps, u32, u8); 8] = [
    (Hwcaps::READ, 0, READ_4B),
    (Hwcaps::READ_FAST, 1, READ_FAST_4B),
    (Hwcaps::READ_1_1_2, 2, READ_1_1_2_4B),
    (Hwcaps::READ_1_2_2, 3, READ_1_2_2_4B),
    (Hwcaps::READ_1_1_4, 4, READ_1_1_4_4B),
    (Hwcaps::READ_1_4_4, 5, READ_1_4_4_4B),
    (Hwcaps::READ_1_1_8, 20, READ_1_1_8_4B),
    (Hwcaps::READ_1_8_8, 21, READ_1_8_8_4B),
];

/// Support bit, 4-byte opcode and protocol of each page program mode in the 4BAIT
pub(crate) const FOUR_BAIT_PROGRAMS: [(Hwcaps, u32, u8, Protocol); 3] = [
    (Hwcaps::PP, 6, PP_4B, Protocol::SPI_1_1_1),
    (Hwcaps::PP_1_1_4, 7, PP_1_1_4_4B, Protocol::SPI_1_1_4),
    (Hwcaps::PP_1_4_4, 8, PP_1_4_4_4B, Protocol::SPI_1_4_4),
];

impl FourBait {
    pub fn parse(dwords: &[u32]) -> Result<Self> {
        match dwords {
            [supported, erases, ..] => Ok(Self {
                supported: *supported,
                erase_opcodes: erases.to_le_bytes(),
            }),
            _ => Err(Error::Corrupt {
                what: format!("4BAIT of {} dwords", dwords.len()),
            }),
        }
    }

    /// Read modes with a 4-byte opcode, and that opcode
    pub fn reads(&self) -> impl Iterator<Item = (Hwcaps, u8)> + '_ {
        FOUR_BAIT_READS
            .iter()
            .filter(|(_, bit, _)| self.supported & 1 << bit != 0)
            .map(|&(caps, _, opcode)| (caps, opcode))
    }

    /// Page program modes with a 4-byte opcode
    pub fn programs(&self) -> impl Iterator<Item = (Hwcaps, u8, Protocol)> + '_ {
        FOUR_BAIT_PROGRAMS
            .iter()
            .filter(|(_, bit, _, _)| self.supported & 1 << bit != 0)
            .map(|&(caps, _, opcode, proto)| (caps, opcode, proto))
    }

    /// The 4-byte opcode of BFPT erase type `bfpt_index`, if it has one
    pub fn erase_opcode(&self, bfpt_index: u8) -> Option<u8> {
        let i = usize::from(bfpt_index);
        (i < 4 && self.supported & 1 << (9 + i) != 0).then(|| self.erase_opcodes[i])
    }
}

/// One configuration detection command of the Sector Map Parameter Table
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SmptDetect {
    pub opcode: u8,
    pub addr: u32,

    /// Address width; `Some(0)` for no address, `None` for the current width
    pub addr_nbytes: Option<u8>,

    /// Dummy cycles; `None` for the current read's
    pub dummy: Option<u8>,

    /// The bit of the returned byte that goes into the map ID
    pub mask: u8,
}

/// The raw Sector Map Parameter Table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Smpt {
    dwords: Vec<u32>,
}

const SMPT_DESC_END: u32 = 1 << 0;
const SMPT_DESC_MAP: u32 = 1 << 1;

impl Smpt {
    pub fn new(dwords: Vec<u32>) -> Self {
        Self { dwords }
    }

    /// Index of the first map descriptor
    fn first_map(&self) -> usize {
        let mut i = 0;
        while i < self.dwords.len() && self.dwords[i] & SMPT_DESC_MAP == 0 {
            i += 2;
        }
        i
    }

    /// The commands whose results, most significant first, make up the map ID
    pub fn detection_cmds(&self) -> Result<Vec<SmptDetect>> {
        let end = self.first_map();
        let mut cmds = vec![];
        for pair in self.dwords[..end.min(self.dwords.len())].chunks(2) {
            let [desc, addr] = pair else {
                return Err(Error::Corrupt {
                    what: "truncated SMPT command descriptor".into(),
                });
            };
            let addr_nbytes = match (desc >> 22) & 0x3 {
                0 => Some(0),
                1 => Some(3),
                2 => Some(4),
                _ => None,
            };
            let dummy = match (desc >> 16) & 0xF {
                0xF => None,
                n => Some(n as u8),
            };
            cmds.push(SmptDetect {
                opcode: (desc >> 8) as u8,
                addr: *addr,
                addr_nbytes,
                dummy,
                mask: (desc >> 24) as u8,
            });
        }
        Ok(cmds)
    }

    /// The regions of map `map_id`, as (size, mask in BFPT order) pairs
    pub fn regions(&self, map_id: u8) -> Result<Vec<(u64, u8)>> {
        let truncated = || Error::Corrupt {
            what: "truncated SMPT map descriptor".into(),
        };
        let mut i = self.first_map();
        while i < self.dwords.len() {
            let desc = self.dwords[i];
            let count = ((desc >> 16) & 0xFF) as usize + 1;
            if (desc >> 8) as u8 == map_id {
                let regions = self.dwords.get(i + 1..i + 1 + count).ok_or_else(truncated)?;
                return Ok(regions
                    .iter()
                    .map(|&r| ((u64::from(r >> 8) + 1) * 256, (r & 0xF) as u8))
                    .collect());
            }
            if desc & SMPT_DESC_END != 0 {
                break;
            }
            i += count + 1;
        }
        Err(Error::Corrupt {
            what: format!("SMPT has no map {map_id}"),
        })
    }
}

/// Everything read from the SFDP area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sfdp {
    pub minor: u8,
    pub headers: Vec<ParamHeader>,
    pub bfpt: Bfpt,
    pub four_bait: Option<FourBait>,
    pub smpt: Option<Smpt>,
}

fn read_dwords<R: SfdpRead + ?Sized>(reader: &mut R, addr: u32, count: usize) -> Result<Vec<u32>> {
    let mut buf = vec![0u8; count * 4];
    reader.read_sfdp(addr, &mut buf)?;
    Ok(buf
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Read and decode the SFDP area
///
/// Returns `None` when there is no SFDP of a major revision this code knows. A broken BFPT is an
/// error; broken optional tables are skipped with a warning.
pub fn parse<R: SfdpRead + ?Sized>(reader: &mut R) -> Result<Option<Sfdp>> {
    let mut header = [0u8; 8];
    reader.read_sfdp(0, &mut header)?;
    let signature = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let (minor, major) = (header[4], header[5]);
    if signature != SFDP_SIGNATURE || major != SFDP_MAJOR {
        debug!("No usable SFDP (signature {signature:#010x}, major {major})");
        return Ok(None);
    }

    let nph = usize::from(header[6]) + 1;
    let mut raw = vec![0u8; nph * 8];
    reader.read_sfdp(8, &mut raw)?;
    let headers: Vec<_> = raw.chunks_exact(8).map(ParamHeader::parse).collect();

    let first = &headers[0];
    if first.id != PARAM_ID_BFPT || first.major != SFDP_MAJOR {
        return Err(Error::Corrupt {
            what: format!("SFDP first parameter header id {:#06x}", first.id),
        });
    }

    // The latest minor revision of the BFPT wins
    let bfpt_header = headers
        .iter()
        .filter(|h| h.id == PARAM_ID_BFPT && h.major == SFDP_MAJOR)
        .fold(first, |best, h| if h.minor >= best.minor { h } else { best });
    let length = usize::from(bfpt_header.length);
    if length < BFPT_DWORDS_V1 {
        return Err(Error::Corrupt {
            what: format!("BFPT of {length} dwords"),
        });
    }
    let dwords = read_dwords(reader, bfpt_header.pointer, length.min(BFPT_DWORDS_MAX))?;
    let bfpt = Bfpt::parse(&dwords, bfpt_header.minor, length)?;
    debug!(
        "SFDP {}.{}: BFPT rev {} with {} dwords, {} bytes",
        major, minor, bfpt.minor, length, bfpt.size
    );

    let mut sfdp = Sfdp {
        minor,
        headers: headers.clone(),
        bfpt,
        four_bait: None,
        smpt: None,
    };

    for h in headers.iter().filter(|h| h.major == SFDP_MAJOR) {
        let table = match h.id {
            PARAM_ID_4BAIT | PARAM_ID_SMPT => {
                read_dwords(reader, h.pointer, usize::from(h.length))
            }
            _ => continue,
        };
        let result = table.and_then(|dwords| match h.id {
            PARAM_ID_4BAIT => FourBait::parse(&dwords).map(|t| sfdp.four_bait = Some(t)),
            _ => {
                sfdp.smpt = Some(Smpt::new(dwords));
                Ok(())
            }
        });
        if let Err(e) = result {
            warn!("Ignoring SFDP table {:#06x}: {e}", h.id);
        }
    }

    Ok(Some(sfdp))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spi_nor::sim::SfdpBuilder;

    fn bfpt_dwords(density: u32) -> Vec<u32> {
        let mut dwords = vec![0u32; 16];
        dwords[1] = density;
        // 4K erase with 0x20, 64K with 0xD8
        dwords[7] = 0xD810_200C;
        dwords
    }

    #[test]
    fn test_density() -> anyhow::Result<()> {
        let bfpt = Bfpt::parse(&bfpt_dwords(0x8000_0020), 6, 16)?;
        assert_eq!(bfpt.size, 512 << 20);

        let bfpt = Bfpt::parse(&bfpt_dwords(0x07FF_FFFF), 6, 16)?;
        assert_eq!(bfpt.size, 16 << 20);

        assert!(matches!(
            Bfpt::parse(&bfpt_dwords(0x8000_0040), 6, 16),
            Err(Error::Corrupt { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_erase_types() -> anyhow::Result<()> {
        let bfpt = Bfpt::parse(&bfpt_dwords(0x07FF_FFFF), 6, 16)?;
        let types: Vec<_> = bfpt
            .erase_types
            .iter()
            .map(|t| (t.opcode, t.size, t.bfpt_index))
            .collect();
        assert_eq!(types, [(0x20, 4096, 0), (0xD8, 65536, 1)]);

        // Listed out of order in the table, sorted by size after parsing
        let mut dwords = bfpt_dwords(0x07FF_FFFF);
        dwords[7] = 0x200C_D810;
        dwords[8] = 0x0000_DC12;
        let bfpt = Bfpt::parse(&dwords, 6, 16)?;
        let types: Vec<_> = bfpt
            .erase_types
            .iter()
            .map(|t| (t.opcode, t.size, t.bfpt_index))
            .collect();
        assert_eq!(
            types,
            [(0x20, 4096, 1), (0xD8, 65536, 0), (0xDC, 256 << 10, 2)]
        );
        assert!(bfpt.erase_types.windows(2).all(|w| w[0].size <= w[1].size));

        // A pre-rev A table stops at dword 9
        let short = Bfpt::parse(&bfpt_dwords(0x07FF_FFFF)[..9], 0, 9)?;
        assert_eq!(short.page_size, None);
        assert!(!short.is_rev_a());

        assert!(Bfpt::parse(&bfpt_dwords(0x07FF_FFFF)[..8], 0, 8).is_err());
        Ok(())
    }

    #[test]
    fn test_parse_built() -> anyhow::Result<()> {
        let blob = SfdpBuilder::new(32 << 20)
            .fast_read(Hwcaps::READ_1_1_4, READ_1_1_4, 0, 8)
            .fast_read(Hwcaps::READ_1_4_4, READ_1_4_4, 2, 4)
            .quad_enable(QuadEnable::Sr1Bit6)
            .build();
        let sfdp = parse(&mut SfdpDump(&blob))?.ok_or_else(|| anyhow::anyhow!("no SFDP"))?;
        let bfpt = &sfdp.bfpt;

        assert_eq!(bfpt.size, 32 << 20);
        assert_eq!(bfpt.page_size, Some(256));
        assert_eq!(bfpt.quad_enable, Some(QuadEnable::Sr1Bit6));
        assert_eq!(
            bfpt.reads,
            [
                (Hwcaps::READ_1_1_4, ReadCmd::new(READ_1_1_4, 0, 8, Protocol::SPI_1_1_4)),
                (Hwcaps::READ_1_4_4, ReadCmd::new(READ_1_4_4, 2, 4, Protocol::SPI_1_4_4)),
            ]
        );
        assert_eq!(sfdp.four_bait, None);
        Ok(())
    }

    #[test]
    fn test_latest_bfpt_wins() -> anyhow::Result<()> {
        let mut blob = SfdpBuilder::new(1 << 20).build();
        // Bump the number of parameter headers and add a second BFPT header at rev 9 that
        // points at the same table, with the length field cut down
        blob[6] += 1;
        let second = [0x00, 9, 1, 9, blob[12], blob[13], blob[14], 0xFF];
        let at = 8 + 8 * usize::from(blob[6]);
        blob[at..at + 8].copy_from_slice(&second);

        let sfdp = parse(&mut SfdpDump(&blob))?.ok_or_else(|| anyhow::anyhow!("no SFDP"))?;
        assert_eq!(sfdp.bfpt.minor, 9);
        assert!(!sfdp.bfpt.is_rev_a());
        Ok(())
    }

    #[test]
    fn test_no_sfdp() -> anyhow::Result<()> {
        assert!(parse(&mut SfdpDump(&[0xFF; 64]))?.is_none());

        let mut blob = SfdpBuilder::new(1 << 20).build();
        blob[5] = 2;
        assert!(parse(&mut SfdpDump(&blob))?.is_none());
        Ok(())
    }

    #[test]
    fn test_smpt() -> anyhow::Result<()> {
        let smpt = Smpt::new(vec![
            // Read register 0x65 at address 4 (3 bytes), 8 dummies, bit 2
            0x0448_6500,
            0x0000_0004,
            // Map 0: two regions
            0x0001_0002,
            0x0000_FF01,
            0x0000_FF02,
            // Map 1, last: one region
            0x0000_0103,
            0x0001_FF03,
        ]);

        assert_eq!(
            smpt.detection_cmds()?,
            [SmptDetect {
                opcode: 0x65,
                addr: 4,
                addr_nbytes: Some(3),
                dummy: Some(8),
                mask: 0x04,
            }]
        );
        assert_eq!(smpt.regions(0)?, [(65536, 1), (65536, 2)]);
        assert_eq!(smpt.regions(1)?, [(128 * 1024, 3)]);
        assert!(smpt.regions(2).is_err());
        Ok(())
    }
}
