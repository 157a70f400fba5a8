//! SPI-NOR flash discovery and access.
//!
//! [SpiNor::scan] identifies a part by its JEDEC ID, refines what the ID tables know with the
//! part's SFDP tables when it has them, applies manufacturer fixups, and then settles on the read,
//! program and erase commands both the part and the controller can do. It also takes care of the
//! quad enable bit and 4-byte addressing, so that [SpiNor::read], [SpiNor::write] and
//! [SpiNor::erase] can just issue commands.

use std::collections::BTreeMap;

use log::{debug, info, warn};

mod caps;
pub mod erase;
pub mod ids;
pub mod op;
pub mod opcodes;
pub mod sfdp;
pub mod sim;
pub mod sr;

pub use caps::{Hwcaps, PpCmd, ReadCmd};
pub use erase::{EraseCmd, EraseMap, EraseRegion, EraseType};
pub use ids::{FlashInfo, InfoFlags, Manufacturer};
pub use op::{Protocol, SpiMemController, SpiMemOp};
pub use sr::{FourByteMode, QuadEnable};

use crate::error::{Error, Result};
use opcodes::*;
use sfdp::{FourBait, Sfdp, SfdpRead, Smpt};

/// The largest part 3-byte addresses reach all of
const MAX_3B_SIZE: u64 = 16 << 20;

/// Dummy cycles for sector map detection commands that leave it to the current read
const SMPT_DEFAULT_DUMMY: u8 = 8;

/// What the controller brings to a scan
#[derive(Debug, Clone, Default)]
pub struct NorScanConfig {
    /// Modes the controller can drive
    pub hwcaps: Hwcaps,

    /// Smallest erase size worth using for uniform erases; the biggest type when unset
    pub preferred_erase_size: Option<u32>,
}

/// How addresses past 16 MiB are reached
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Addressing {
    ThreeByte,

    /// Dedicated opcodes that always take 4 bytes
    FourByteOpcodes,

    /// 3-byte opcodes, with the part switched into 4-byte mode
    FourByteMode(FourByteMode),
}

/// Everything known about a part, and the commands picked for it
#[derive(Debug, Clone)]
pub struct DeviceDescription {
    pub name: String,
    pub id: [u8; 3],
    pub manufacturer: Manufacturer,

    /// Size in bytes
    pub size: u64,
    pub page_size: u32,
    pub addr_nbytes: u8,

    /// Read commands the part supports
    pub reads: BTreeMap<Hwcaps, ReadCmd>,

    /// Page program commands the part supports
    pub programs: BTreeMap<Hwcaps, PpCmd>,

    pub erase_map: EraseMap,
    pub quad_enable: QuadEnable,
    pub four_byte_mode: FourByteMode,

    /// The part has dedicated 4-byte address opcodes
    pub four_byte_opcodes: bool,

    /// Whether SFDP contributed to this description
    pub from_sfdp: bool,

    pub addressing: Addressing,
    pub read: ReadCmd,
    pub program: PpCmd,

    /// The opcodes in [DeviceDescription::reads], [DeviceDescription::programs] and the erase map
    /// are already the 4-byte ones
    has_4bait: bool,
}

impl DeviceDescription {
    /// What the ID table alone says about a part
    pub fn from_info(info: &FlashInfo, id: [u8; 3]) -> Result<Self> {
        let flags = info.flags;
        let size = info.size();

        let mut reads = BTreeMap::new();
        reads.insert(Hwcaps::READ, ReadCmd::new(READ, 0, 0, Protocol::SPI_1_1_1));
        if !flags.contains(InfoFlags::NO_FAST_READ) {
            reads.insert(
                Hwcaps::READ_FAST,
                ReadCmd::new(READ_FAST, 0, 8, Protocol::SPI_1_1_1),
            );
        }
        if flags.contains(InfoFlags::DUAL_READ) {
            reads.insert(
                Hwcaps::READ_1_1_2,
                ReadCmd::new(READ_1_1_2, 0, 8, Protocol::SPI_1_1_2),
            );
        }
        if flags.contains(InfoFlags::QUAD_READ) {
            reads.insert(
                Hwcaps::READ_1_1_4,
                ReadCmd::new(READ_1_1_4, 0, 8, Protocol::SPI_1_1_4),
            );
        }

        let mut programs = BTreeMap::new();
        programs.insert(
            Hwcaps::PP,
            PpCmd {
                opcode: PP,
                proto: Protocol::SPI_1_1_1,
            },
        );
        if flags.contains(InfoFlags::QUAD_PP) {
            programs.insert(
                Hwcaps::PP_1_1_4,
                PpCmd {
                    opcode: PP_1_1_4,
                    proto: Protocol::SPI_1_1_4,
                },
            );
        }

        let mut erase_types = vec![];
        if flags.contains(InfoFlags::SECT_4K) {
            erase_types.push(EraseType::new(BE_4K, 4096, 0)?);
        }
        if info.sector_size > 4096 {
            erase_types.push(EraseType::new(SE, info.sector_size, 1)?);
        }

        let quad_enable = if flags.contains(InfoFlags::QUAD_READ) {
            QuadEnable::Sr2Bit1Read
        } else {
            QuadEnable::None
        };

        Ok(Self {
            name: info.name.to_string(),
            id,
            manufacturer: Manufacturer::from_id(id[0]),
            size,
            page_size: info.page_size,
            addr_nbytes: 3,
            reads,
            programs,
            erase_map: EraseMap::uniform(erase_types, size),
            quad_enable,
            four_byte_mode: FourByteMode::default(),
            four_byte_opcodes: flags.contains(InfoFlags::FOUR_BYTE_OPCODES),
            from_sfdp: false,
            addressing: Addressing::ThreeByte,
            read: ReadCmd::default(),
            program: PpCmd::default(),
            has_4bait: false,
        })
    }

    /// Every mode the part supports
    pub fn hwcaps(&self) -> Hwcaps {
        self.reads
            .keys()
            .chain(self.programs.keys())
            .fold(Hwcaps::empty(), |caps, &c| caps | c)
    }

    /// Let the tables of `sfdp` override what the ID table said
    fn apply_sfdp<C: SpiMemController + ?Sized>(&mut self, ctrl: &mut C, sfdp: &Sfdp) {
        let bfpt = &sfdp.bfpt;
        if let Some(nbytes) = bfpt.addr_nbytes {
            self.addr_nbytes = nbytes;
        }
        self.size = bfpt.size;

        let bfpt_caps = sfdp::bfpt_read_caps();
        self.reads.retain(|caps, _| !bfpt_caps.contains(*caps));
        self.reads.extend(bfpt.reads.iter().copied());

        let types = if bfpt.erase_types.is_empty() {
            self.erase_map.types().to_vec()
        } else {
            bfpt.erase_types.clone()
        };
        self.erase_map = EraseMap::uniform(types, self.size);

        if let Some(page_size) = bfpt.page_size {
            self.page_size = page_size;
        }
        if let Some(qe) = bfpt.quad_enable {
            self.quad_enable = qe;
        }
        if let Some(mode) = bfpt.four_byte_mode {
            self.four_byte_mode = mode;
        }
        self.four_byte_opcodes |= bfpt.four_byte_opcodes;
        self.from_sfdp = true;

        if let Some(four_bait) = &sfdp.four_bait {
            self.apply_4bait(four_bait);
        }
        if let Some(smpt) = &sfdp.smpt {
            if let Err(e) = self.apply_smpt(ctrl, smpt) {
                warn!("{}: ignoring sector map ({e}), assuming uniform erases", self.name);
            }
        }
    }

    /// Switch to the 4-byte opcodes the 4BAIT lists, if it lists enough of them
    fn apply_4bait(&mut self, table: &FourBait) {
        let reads: Vec<(Hwcaps, u8)> = table
            .reads()
            .filter(|(caps, _)| self.reads.contains_key(caps))
            .collect();
        let programs: BTreeMap<Hwcaps, PpCmd> = table
            .programs()
            .map(|(caps, opcode, proto)| (caps, PpCmd { opcode, proto }))
            .collect();
        let has_erase = self
            .erase_map
            .types()
            .iter()
            .any(|t| table.erase_opcode(t.bfpt_index).is_some());

        // Reads, programs and erases share one address width
        if reads.is_empty() || programs.is_empty() || !has_erase {
            debug!("{}: 4BAIT does not cover every operation, ignoring it", self.name);
            return;
        }

        self.reads.retain(|caps, _| reads.iter().any(|(c, _)| c == caps));
        for (caps, opcode) in reads {
            if let Some(read) = self.reads.get_mut(&caps) {
                read.opcode = opcode;
            }
        }
        self.programs = programs;
        self.erase_map
            .retain_types(|t| table.erase_opcode(t.bfpt_index).is_some());
        self.erase_map
            .map_opcodes(|t| table.erase_opcode(t.bfpt_index).unwrap_or(t.opcode));

        self.addr_nbytes = 4;
        self.four_byte_opcodes = true;
        self.has_4bait = true;
    }

    /// Run the sector map detection commands and install the map they select
    fn apply_smpt<C: SpiMemController + ?Sized>(&mut self, ctrl: &mut C, smpt: &Smpt) -> Result<()> {
        let mut map_id = 0u8;
        for cmd in smpt.detection_cmds()? {
            let nbytes = cmd.addr_nbytes.unwrap_or(self.addr_nbytes);
            let mut byte = [0u8];
            let mut detect = SpiMemOp::cmd(cmd.opcode)
                .with_dummy(cmd.dummy.unwrap_or(SMPT_DEFAULT_DUMMY))
                .data_in(&mut byte);
            if nbytes > 0 {
                detect = detect.with_addr(cmd.addr, nbytes);
            }
            ctrl.exec_op(&mut detect)?;
            map_id = map_id << 1 | u8::from(byte[0] & cmd.mask != 0);
        }

        let regions = smpt.regions(map_id)?;
        self.erase_map.set_regions(&regions)?;
        debug!("{}: sector map {map_id} with {} regions", self.name, regions.len());
        Ok(())
    }

    /// Pick the fastest read and program the controller shares with the part, and the uniform
    /// erase type
    fn select(&mut self, config: &NorScanConfig) -> Result<()> {
        let device = self.hwcaps();
        let shared = device & config.hwcaps;

        let read_caps = (shared & Hwcaps::READ_MASK).best().ok_or_else(|| {
            Error::InvalidConfig(format!("no read mode shared with the controller ({device:?})"))
        })?;
        let program_caps = (shared & Hwcaps::PP_MASK).best().ok_or_else(|| {
            Error::InvalidConfig(format!("no program mode shared with the controller ({device:?})"))
        })?;
        self.read = self.reads[&read_caps];
        self.program = self.programs[&program_caps];

        let erase = self.erase_map.select_uniform(config.preferred_erase_size);
        if erase.is_none() && self.erase_map.is_uniform() {
            return Err(Error::InvalidConfig(format!("{}: no erase type", self.name)));
        }
        Ok(())
    }

    /// Decide how to address the whole part, converting opcodes when that takes 4-byte ones
    fn select_addressing(&mut self) {
        if self.size > MAX_3B_SIZE {
            self.addr_nbytes = 4;
        }
        if self.addr_nbytes == 3 {
            self.addressing = Addressing::ThreeByte;
            return;
        }
        if self.has_4bait {
            self.addressing = Addressing::FourByteOpcodes;
            return;
        }

        let read = read_3to4(self.read.opcode);
        let program = program_3to4(self.program.opcode);
        let erases_convert = self
            .erase_map
            .types()
            .iter()
            .all(|t| is_4b_opcode(erase_3to4(t.opcode)));
        if self.four_byte_opcodes && is_4b_opcode(read) && is_4b_opcode(program) && erases_convert
        {
            self.read.opcode = read;
            self.program.opcode = program;
            self.erase_map.map_opcodes(|t| erase_3to4(t.opcode));
            self.addressing = Addressing::FourByteOpcodes;
        } else {
            self.addressing = Addressing::FourByteMode(self.four_byte_mode);
        }
    }

    fn needs_quad_enable(&self) -> bool {
        self.read.proto.data == 4 || self.program.proto.data == 4
    }
}

/// Reads the SFDP area of a live part
struct BusSfdp<'a, C: ?Sized>(&'a mut C);

impl<C: SpiMemController + ?Sized> SfdpRead for BusSfdp<'_, C> {
    fn read_sfdp(&mut self, addr: u32, buf: &mut [u8]) -> anyhow::Result<()> {
        op::read_sfdp(self.0, addr, buf)
    }
}

/// Find the table entry for a part, weighing the probed ID against the name the caller expects
fn identify(id: &[u8; 3], name_hint: Option<&str>) -> Option<FlashInfo> {
    let hinted = name_hint.and_then(|name| {
        let info = ids::find_by_name(name);
        if info.is_none() {
            warn!("Unknown SPI-NOR part name {name:?}");
        }
        info
    });
    let probed = ids::find_by_id(id);

    match (hinted, probed) {
        (Some(hinted), Some(probed)) if hinted.id != probed.id => {
            warn!(
                "Expected {} but found {} ({id:02x?}), using the probed part",
                hinted.name, probed.name
            );
            Some(*probed)
        }
        (Some(hinted), None) => {
            warn!("Unknown JEDEC id {id:02x?}, trusting that this is a {}", hinted.name);
            Some(*hinted)
        }
        (_, probed) => probed.copied(),
    }
}

/// A scanned SPI-NOR part on a controller
pub struct SpiNor<C: SpiMemController> {
    ctrl: C,
    desc: DeviceDescription,
}

impl<C: SpiMemController> SpiNor<C> {
    /// Identify the part on `ctrl` and get it ready for reads, writes and erases
    pub fn scan(mut ctrl: C, name_hint: Option<&str>, config: &NorScanConfig) -> Result<Self> {
        let id = op::read_id(&mut ctrl)?;
        if id.iter().all(|&b| b == 0x00) || id.iter().all(|&b| b == 0xFF) {
            return Err(Error::NoDevice);
        }

        let info = identify(&id, name_hint).unwrap_or_else(|| ids::generic(id));
        let mut desc = DeviceDescription::from_info(&info, id)?;

        let mut qe_from_sfdp = false;
        if !info.flags.contains(InfoFlags::NO_SFDP) {
            match sfdp::parse(&mut BusSfdp(&mut ctrl)) {
                Ok(Some(sfdp)) => {
                    qe_from_sfdp = sfdp.bfpt.is_rev_a();
                    desc.apply_sfdp(&mut ctrl, &sfdp);
                }
                Ok(None) if info.is_generic() => return Err(Error::Unknown(id)),
                Ok(None) => debug!("{}: no SFDP, going by the ID table", info.name),
                Err(e) if info.is_generic() => return Err(e),
                Err(e) => warn!("{}: ignoring bad SFDP ({e}), going by the ID table", info.name),
            }
        }

        let manufacturer = desc.manufacturer;
        manufacturer.fixup(&mut desc, qe_from_sfdp);

        desc.select(config)?;
        desc.select_addressing();

        if desc.needs_quad_enable() {
            desc.quad_enable.enable(&mut ctrl)?;
        }
        if let Addressing::FourByteMode(mode) = desc.addressing {
            mode.set(&mut ctrl, true)?;
        }

        info!(
            "{} ({} KiB, {:02x?}): read {:#04x} {} with {} dummy cycles, program {:#04x} {}, {:?}",
            desc.name,
            desc.size >> 10,
            desc.id,
            desc.read.opcode,
            desc.read.proto,
            desc.read.dummy(),
            desc.program.opcode,
            desc.program.proto,
            desc.addressing,
        );
        if let Some(erase) = desc.erase_map.uniform_type() {
            debug!("{}: uniform erase {:#04x} of {} bytes", desc.name, erase.opcode, erase.size);
        }

        Ok(Self { ctrl, desc })
    }

    pub fn description(&self) -> &DeviceDescription {
        &self.desc
    }

    pub fn controller(&mut self) -> &mut C {
        &mut self.ctrl
    }

    fn check_range(&self, addr: u64, len: u64) -> Result<u32> {
        match addr.checked_add(len) {
            Some(end) if end <= self.desc.size => u32::try_from(addr)
                .map_err(|_| Error::InvalidConfig(format!("address {addr:#x} too big"))),
            _ => Err(Error::InvalidConfig(format!(
                "access of {len:#x} bytes at {addr:#x} beyond device size {:#x}",
                self.desc.size
            ))),
        }
    }

    pub fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let start = self.check_range(addr, buf.len() as u64)?;
        let read = self.desc.read;
        self.ctrl.exec_op(
            &mut SpiMemOp::cmd(read.opcode)
                .with_proto(read.proto)
                .with_addr(start, self.desc.addr_nbytes)
                .with_dummy(read.dummy())
                .data_in(buf),
        )?;
        Ok(())
    }

    /// Program `data` at `addr`, one page at a time. The range must have been erased.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.check_range(addr, data.len() as u64)?;
        let page = u64::from(self.desc.page_size);
        let program = self.desc.program;

        let mut pos = 0;
        while pos < data.len() {
            let at = addr + pos as u64;
            let room = (page - at % page) as usize;
            let chunk = &data[pos..data.len().min(pos + room)];
            let start = self.check_range(at, chunk.len() as u64)?;

            op::write_enable(&mut self.ctrl)?;
            self.ctrl.exec_op(
                &mut SpiMemOp::cmd(program.opcode)
                    .with_proto(program.proto)
                    .with_addr(start, self.desc.addr_nbytes)
                    .data_out(chunk),
            )?;
            op::wait_ready(&mut self.ctrl)?;
            pos += chunk.len();
        }
        Ok(())
    }

    /// Erase exactly `len` bytes at `addr`, with whatever erase types cover the range
    pub fn erase(&mut self, addr: u64, len: u64) -> Result<()> {
        let plan = self.desc.erase_map.plan(addr, len)?;
        let rpt = howudoin::new()
            .label("Erasing flash")
            .set_len(plan.len() as u64);

        for cmd in plan {
            debug!(
                "Erasing {:#x} bytes at {:#x} with {:#04x}",
                cmd.size, cmd.addr, cmd.opcode
            );
            let mut erase = SpiMemOp::cmd(cmd.opcode);
            if cmd.opcode != CHIP_ERASE {
                erase = erase.with_addr(self.check_range(cmd.addr, 0)?, self.desc.addr_nbytes);
            }

            op::write_enable(&mut self.ctrl)?;
            self.ctrl.exec_op(&mut erase)?;
            op::wait_ready(&mut self.ctrl)?;
            rpt.inc();
        }

        rpt.close();
        Ok(())
    }

    /// Put the part back in the address mode a boot ROM expects
    pub fn restore(&mut self) -> Result<()> {
        if let Addressing::FourByteMode(mode) = self.desc.addressing {
            mode.set(&mut self.ctrl, false)?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> C {
        self.ctrl
    }
}

#[cfg(test)]
mod test {
    use super::opcodes::*;
    use super::sim::{SfdpBuilder, SimNor, SimQe};
    use super::*;

    const MIB: u64 = 1 << 20;

    fn quad() -> NorScanConfig {
        NorScanConfig {
            hwcaps: Hwcaps::READ
                | Hwcaps::READ_FAST
                | Hwcaps::READ_1_1_2
                | Hwcaps::READ_1_1_4
                | Hwcaps::READ_1_4_4
                | Hwcaps::PP
                | Hwcaps::PP_1_1_4,
            preferred_erase_size: None,
        }
    }

    #[test]
    fn test_no_device() {
        let nor = SimNor::new([0xFF; 3], MIB, vec![]);
        assert!(matches!(
            SpiNor::scan(nor, None, &NorScanConfig::default()),
            Err(Error::NoDevice)
        ));
        let nor = SimNor::new([0x00; 3], MIB, vec![]);
        assert!(matches!(
            SpiNor::scan(nor, None, &NorScanConfig::default()),
            Err(Error::NoDevice)
        ));
    }

    #[test]
    fn test_unknown_without_sfdp() {
        let nor = SimNor::new([0x12, 0x34, 0x56], MIB, vec![]);
        assert!(matches!(
            SpiNor::scan(nor, None, &NorScanConfig::default()),
            Err(Error::Unknown([0x12, 0x34, 0x56]))
        ));
    }

    #[test]
    fn test_table_part_without_sfdp() -> anyhow::Result<()> {
        // A w25q128 with a blank SFDP area: 16 MiB, quad capable, QE in SR2 bit 1
        let nor = SimNor::new([0xEF, 0x40, 0x18], 16 * MIB, vec![]).with_qe(SimQe::Sr2Bit1);
        let mut nor = SpiNor::scan(nor, None, &quad())?;
        let desc = nor.description();
        assert_eq!(desc.name, "w25q128");
        assert!(!desc.from_sfdp);
        assert_eq!(desc.addressing, Addressing::ThreeByte);
        assert_eq!(desc.read.opcode, READ_1_1_4);
        assert_eq!(desc.quad_enable, QuadEnable::Legacy);
        assert_eq!(desc.erase_map.uniform_type().map(|t| t.size), Some(65536));
        assert!(nor.controller().qe_set());
        Ok(())
    }

    #[test]
    fn test_generic_sfdp_part() -> anyhow::Result<()> {
        let blob = SfdpBuilder::new(8 * MIB)
            .fast_read(Hwcaps::READ_1_1_4, READ_1_1_4, 0, 8)
            .fast_read(Hwcaps::READ_1_4_4, READ_1_4_4, 2, 4)
            .quad_enable(QuadEnable::Sr2Bit1Read)
            .build();
        let nor = SimNor::new([0xAB, 0x60, 0x17], 8 * MIB, blob).with_qe(SimQe::Sr2Bit1);
        let nor = SpiNor::scan(nor, None, &quad())?;
        let desc = nor.description();

        assert_eq!(desc.name, "spi-nor-generic");
        assert_eq!(desc.size, 8 * MIB);
        assert_eq!(desc.read, ReadCmd::new(READ_1_4_4, 2, 4, Protocol::SPI_1_4_4));
        assert_eq!(desc.read.dummy(), 6);
        assert_eq!(desc.program.opcode, PP);
        Ok(())
    }

    #[test]
    fn test_controller_limits_modes() -> anyhow::Result<()> {
        let blob = SfdpBuilder::new(8 * MIB)
            .fast_read(Hwcaps::READ_1_1_4, READ_1_1_4, 0, 8)
            .build();
        let nor = SimNor::new([0xAB, 0x60, 0x17], 8 * MIB, blob);
        let nor = SpiNor::scan(nor, None, &NorScanConfig::default())?;
        assert_eq!(nor.description().read.opcode, READ_FAST);
        assert!(!nor.description().needs_quad_enable());

        let blob = SfdpBuilder::new(8 * MIB).build();
        let nor = SimNor::new([0xAB, 0x60, 0x17], 8 * MIB, blob);
        let config = NorScanConfig {
            hwcaps: Hwcaps::READ_1_1_4 | Hwcaps::PP,
            preferred_erase_size: None,
        };
        assert!(matches!(
            SpiNor::scan(nor, None, &config),
            Err(Error::InvalidConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn test_qe_not_set() {
        let blob = SfdpBuilder::new(8 * MIB)
            .fast_read(Hwcaps::READ_1_1_4, READ_1_1_4, 0, 8)
            .quad_enable(QuadEnable::Sr1Bit6)
            .build();
        let mut nor = SimNor::new([0xAB, 0x60, 0x17], 8 * MIB, blob).with_qe(SimQe::Sr1Bit6);
        nor.qe_stuck = true;
        assert!(matches!(
            SpiNor::scan(nor, None, &quad()),
            Err(Error::QeNotSet {
                procedure: "sr1-bit6"
            })
        ));
    }

    #[test]
    fn test_name_hint() -> anyhow::Result<()> {
        // Probe and hint disagree: the probe wins
        let nor = SimNor::new([0xEF, 0x40, 0x17], 8 * MIB, vec![]);
        let nor = SpiNor::scan(nor, Some("w25q128"), &NorScanConfig::default())?;
        assert_eq!(nor.description().name, "w25q64");

        // Nothing matches the probe: the hint wins
        let nor = SimNor::new([0xEF, 0x77, 0x77], 8 * MIB, vec![]);
        let nor = SpiNor::scan(nor, Some("w25q64"), &NorScanConfig::default())?;
        assert_eq!(nor.description().name, "w25q64");
        assert_eq!(nor.description().size, 8 * MIB);
        Ok(())
    }

    #[test]
    fn test_four_byte_opcodes() -> anyhow::Result<()> {
        // mt25ql256a: 32 MiB with dedicated 4-byte opcodes, no SFDP
        let nor = SimNor::new([0x20, 0xBA, 0x19], 32 * MIB, vec![]);
        let mut nor = SpiNor::scan(nor, None, &NorScanConfig::default())?;
        let desc = nor.description();
        assert_eq!(desc.addressing, Addressing::FourByteOpcodes);
        assert_eq!(desc.addr_nbytes, 4);
        assert_eq!(desc.read.opcode, READ_FAST_4B);
        assert_eq!(desc.program.opcode, PP_4B);
        assert_eq!(desc.erase_map.uniform_type().map(|t| t.opcode), Some(SE_4B));

        nor.erase(24 * MIB, 65536)?;
        nor.write(24 * MIB + 10, b"high")?;
        let mut buf = [0u8; 4];
        nor.read(24 * MIB + 10, &mut buf)?;
        assert_eq!(&buf, b"high");
        assert!(!nor.controller().is_four_byte_mode());
        Ok(())
    }

    #[test]
    fn test_four_byte_mode_winbond() -> anyhow::Result<()> {
        // w25q256 has no 4-byte opcodes in the table: EN4B, then EAR cleared on the way out
        let nor = SimNor::new([0xEF, 0x40, 0x19], 32 * MIB, vec![]);
        let mut nor = SpiNor::scan(nor, None, &NorScanConfig::default())?;
        assert_eq!(
            nor.description().addressing,
            Addressing::FourByteMode(FourByteMode::En4bEx4bClearEar)
        );
        assert!(nor.controller().is_four_byte_mode());

        nor.erase(20 * MIB, 65536)?;
        nor.write(20 * MIB, &[0xA5; 300])?;
        let mut buf = [0u8; 300];
        nor.read(20 * MIB, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0xA5));

        nor.restore()?;
        let sim = nor.into_inner();
        assert!(!sim.is_four_byte_mode());
        assert_eq!(sim.ear(), 0);
        assert_eq!(&sim.ops[sim.ops.len() - 4..], [EX4B, WREN, WREAR, WRDI]);
        Ok(())
    }

    #[test]
    fn test_four_byte_mode_micron_wren() -> anyhow::Result<()> {
        // n25q00 needs WREN before EN4B
        let mut nor = SimNor::new([0x20, 0xBA, 0x21], 128 * MIB, vec![]);
        nor.en4b_needs_wren = true;
        let nor = SpiNor::scan(nor, None, &NorScanConfig::default())?;
        assert_eq!(
            nor.description().addressing,
            Addressing::FourByteMode(FourByteMode::WrenEn4bEx4b)
        );
        assert!(nor.into_inner().is_four_byte_mode());
        Ok(())
    }

    #[test]
    fn test_four_bait() -> anyhow::Result<()> {
        // Reads 0x13/0x0C, PP 0x12, erase types 1 and 2 with 0x21/0xDC
        let blob = SfdpBuilder::new(64 * MIB)
            .four_bait(0b110_0100_0011, [BE_4K_4B, SE_4B, 0, 0])
            .build();
        let nor = SimNor::new([0xAB, 0x60, 0x1A], 64 * MIB, blob);
        let mut nor = SpiNor::scan(nor, None, &NorScanConfig::default())?;
        let desc = nor.description();
        assert_eq!(desc.addressing, Addressing::FourByteOpcodes);
        assert_eq!(desc.read.opcode, READ_FAST_4B);
        assert_eq!(desc.program.opcode, PP_4B);
        let opcodes: Vec<_> = desc.erase_map.types().iter().map(|t| t.opcode).collect();
        assert_eq!(opcodes, [BE_4K_4B, SE_4B]);

        nor.erase(40 * MIB, 65536)?;
        nor.write(40 * MIB, b"4bait")?;
        let mut buf = [0u8; 5];
        nor.read(40 * MIB, &mut buf)?;
        assert_eq!(&buf, b"4bait");
        Ok(())
    }

    #[test]
    fn test_sector_map() -> anyhow::Result<()> {
        // Register 0x65 bit 3 picks the map: 0 is top 4K sectors, 1 is uniform 64K
        let smpt = vec![
            0x0808_6500,
            0x0000_0000,
            // Map 0: 7.75 MiB of 64K blocks (BFPT type 2), then 256K of 4K sectors (type 1)
            0x0001_0002,
            0x007B_FF02,
            0x0003_FF01,
            // Map 1: the whole part as 64K blocks
            0x0000_0103,
            0x007F_FF02,
        ];
        let blob = SfdpBuilder::new(8 * MIB).smpt(smpt).build();
        let mut nor = SimNor::new([0xAB, 0x60, 0x17], 8 * MIB, blob);
        nor.registers.insert(0x65, 0x00);
        let mut nor = SpiNor::scan(nor, None, &NorScanConfig::default())?;

        let map = &nor.description().erase_map;
        assert!(!map.is_uniform());
        assert_eq!(map.regions().len(), 2);
        assert_eq!(map.regions()[1].offset, 8 * MIB - 256 * 1024);

        // Top sectors erase in 4K steps, the rest in 64K ones
        nor.erase(8 * MIB - 256 * 1024, 8192)?;
        assert!(nor.erase(0, 4096).is_err());
        nor.erase(0, 65536)?;
        Ok(())
    }

    #[test]
    fn test_bad_sector_map_keeps_uniform() -> anyhow::Result<()> {
        // The only map covers 256 KiB of 8 MiB
        let smpt = vec![0x0000_0003, 0x0003_FF02];
        let blob = SfdpBuilder::new(8 * MIB).smpt(smpt).build();
        let nor = SimNor::new([0xAB, 0x60, 0x17], 8 * MIB, blob);
        let nor = SpiNor::scan(nor, None, &NorScanConfig::default())?;
        assert!(nor.description().erase_map.is_uniform());
        Ok(())
    }

    #[test]
    fn test_write_splits_pages() -> anyhow::Result<()> {
        let nor = SimNor::new([0xEF, 0x40, 0x17], 8 * MIB, vec![]);
        let mut nor = SpiNor::scan(nor, None, &NorScanConfig::default())?;
        let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        nor.erase(0, 65536)?;
        nor.write(200, &data)?;

        let sim = nor.into_inner();
        assert_eq!(sim.peek(200, 600), data);
        // 56 + 256 + 256 + 32 bytes
        assert_eq!(sim.ops.iter().filter(|&&op| op == PP).count(), 4);
        Ok(())
    }

    #[test]
    fn test_chip_erase() -> anyhow::Result<()> {
        let nor = SimNor::new([0xEF, 0x40, 0x14], MIB, vec![]);
        let mut nor = SpiNor::scan(nor, None, &NorScanConfig::default())?;
        nor.write(0x1000, &[0; 16])?;
        nor.erase(0, MIB)?;
        let sim = nor.into_inner();
        assert!(sim.ops.contains(&CHIP_ERASE));
        assert_eq!(sim.peek(0x1000, 16), [0xFF; 16]);
        Ok(())
    }
}
