//! A simulated SPI-NOR chip, and a builder for the SFDP areas it serves.
//!
//! [SimNor] implements [SpiMemController] the way a real part answers: it tracks the write
//! enable latch, the status registers, 4-byte address mode and the extended address register,
//! and ignores writes that were not write-enabled. Memory is kept sparsely in 4 KiB chunks.

use std::collections::BTreeMap;

use anyhow::{bail, ensure};

use super::caps::Hwcaps;
use super::op::{OpData, SpiMemController, SpiMemOp};
use super::opcodes::*;
use super::sfdp::{SfdpDump, SfdpRead, BFPT_READS, PARAM_ID_4BAIT, PARAM_ID_BFPT, PARAM_ID_SMPT};
use super::sr::QuadEnable;

const CHUNK: u64 = 4096;

/// Where the simulated part keeps its quad enable bit
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimQe {
    None,
    Sr1Bit6,
    Sr2Bit1,
    Sr2Bit7,
}

const READS: [u8; 6] = [READ, READ_FAST, READ_1_1_2, READ_1_2_2, READ_1_1_4, READ_1_4_4];
const PROGRAMS: [u8; 3] = [PP, PP_1_1_4, PP_1_4_4];

#[derive(Debug)]
pub struct SimNor {
    id: [u8; 3],
    size: u64,
    page_size: u32,
    sfdp: Vec<u8>,
    erases: Vec<(u8, u32)>,
    chunks: BTreeMap<u64, Box<[u8]>>,

    sr1: u8,
    sr2: u8,
    bank: u8,
    ear: u8,
    four_byte_mode: bool,
    wel: bool,
    qe: SimQe,

    /// EN4B and EX4B are ignored unless write-enabled
    pub en4b_needs_wren: bool,

    /// The quad enable bit never sets
    pub qe_stuck: bool,

    /// Extra read-only registers, by opcode
    pub registers: BTreeMap<u8, u8>,

    /// Every opcode executed, in order
    pub ops: Vec<u8>,
}

impl SimNor {
    /// An erased part with 256-byte pages and 4 KiB (0x20) and 64 KiB (0xD8) erases
    pub fn new(id: [u8; 3], size: u64, sfdp: Vec<u8>) -> Self {
        Self {
            id,
            size,
            page_size: 256,
            sfdp,
            erases: vec![(BE_4K, 4096), (SE, 65536)],
            chunks: BTreeMap::new(),
            sr1: 0,
            sr2: 0,
            bank: 0,
            ear: 0,
            four_byte_mode: false,
            wel: false,
            qe: SimQe::None,
            en4b_needs_wren: false,
            qe_stuck: false,
            registers: BTreeMap::new(),
            ops: vec![],
        }
    }

    /// Replace the erase opcodes the part accepts. Their 4-byte twins are accepted too.
    pub fn with_erases(mut self, erases: Vec<(u8, u32)>) -> Self {
        self.erases = erases;
        self
    }

    pub fn with_qe(mut self, qe: SimQe) -> Self {
        self.qe = qe;
        self
    }

    pub fn is_four_byte_mode(&self) -> bool {
        self.four_byte_mode
    }

    pub fn ear(&self) -> u8 {
        self.ear
    }

    pub fn qe_set(&self) -> bool {
        match self.qe {
            SimQe::None => true,
            SimQe::Sr1Bit6 => self.sr1 & SR1_QUAD_EN_BIT6 != 0,
            SimQe::Sr2Bit1 => self.sr2 & SR2_QUAD_EN_BIT1 != 0,
            SimQe::Sr2Bit7 => self.sr2 & SR2_QUAD_EN_BIT7 != 0,
        }
    }

    /// Read memory without going through the bus
    pub fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        (addr..addr + len as u64).map(|a| self.byte(a)).collect()
    }

    fn byte(&self, addr: u64) -> u8 {
        self.chunks
            .get(&(addr / CHUNK))
            .map_or(0xFF, |c| c[(addr % CHUNK) as usize])
    }

    fn byte_mut(&mut self, addr: u64) -> &mut u8 {
        let chunk = self
            .chunks
            .entry(addr / CHUNK)
            .or_insert_with(|| vec![0xFF; CHUNK as usize].into_boxed_slice());
        &mut chunk[(addr % CHUNK) as usize]
    }

    fn erase_range(&mut self, addr: u64, len: u64) {
        let mut pos = addr;
        while pos < addr + len {
            if pos % CHUNK == 0 && pos + CHUNK <= addr + len {
                self.chunks.remove(&(pos / CHUNK));
                pos += CHUNK;
            } else {
                if self.chunks.contains_key(&(pos / CHUNK)) {
                    *self.byte_mut(pos) = 0xFF;
                }
                pos += 1;
            }
        }
    }

    fn write_status(&mut self, sr1: Option<u8>, sr2: Option<u8>) {
        if !self.wel {
            return;
        }
        if let Some(sr1) = sr1 {
            self.sr1 = sr1 & !(SR_WIP | SR_WEL);
        }
        if let Some(sr2) = sr2 {
            self.sr2 = sr2;
        }
        if self.qe_stuck {
            match self.qe {
                SimQe::None => {}
                SimQe::Sr1Bit6 => self.sr1 &= !SR1_QUAD_EN_BIT6,
                SimQe::Sr2Bit1 => self.sr2 &= !SR2_QUAD_EN_BIT1,
                SimQe::Sr2Bit7 => self.sr2 &= !SR2_QUAD_EN_BIT7,
            }
        }
        self.wel = false;
    }

    /// The memory address of a read, program or erase, checked against the address mode
    fn address(&self, op: &SpiMemOp<'_>) -> anyhow::Result<u64> {
        let Some(addr) = op.addr else {
            bail!("opcode {:#04x} without an address", op.opcode);
        };
        let (expected, value) = if is_4b_opcode(op.opcode) || self.four_byte_mode {
            (4, u64::from(addr.value))
        } else {
            (3, u64::from(addr.value & 0xFF_FFFF) | u64::from(self.ear) << 24)
        };
        ensure!(
            addr.nbytes == expected,
            "opcode {:#04x} with a {}-byte address, expected {expected}",
            op.opcode,
            addr.nbytes
        );
        ensure!(value < self.size, "address {value:#x} beyond the end of the part");

        let quad = op.proto.addr == 4 || op.proto.data == 4;
        ensure!(!quad || self.qe_set(), "quad opcode {:#04x} with QE clear", op.opcode);
        Ok(value)
    }

    fn erase_size(&self, opcode: u8) -> Option<u32> {
        self.erases
            .iter()
            .find(|&&(op, _)| op == opcode || erase_3to4(op) == opcode)
            .map(|&(_, size)| size)
    }
}

fn data_in<'b>(op: &'b mut SpiMemOp<'_>) -> anyhow::Result<&'b mut [u8]> {
    match &mut op.data {
        OpData::In(buf) => Ok(buf),
        _ => bail!("opcode {:#04x} needs a data-in phase", op.opcode),
    }
}

fn data_out<'b>(op: &'b SpiMemOp<'_>) -> anyhow::Result<&'b [u8]> {
    match &op.data {
        OpData::Out(buf) if !buf.is_empty() => Ok(buf),
        _ => bail!("opcode {:#04x} needs a data-out phase", op.opcode),
    }
}

impl SpiMemController for SimNor {
    fn exec_op(&mut self, op: &mut SpiMemOp<'_>) -> anyhow::Result<()> {
        self.ops.push(op.opcode);
        match op.opcode {
            RDID => {
                let buf = data_in(op)?;
                buf.fill(0);
                let n = buf.len().min(3);
                buf[..n].copy_from_slice(&self.id[..n]);
            }
            RDSFDP => {
                ensure!(
                    op.addr.map(|a| a.nbytes) == Some(3) && op.dummy_cycles == 8,
                    "malformed SFDP read"
                );
                let addr = op.addr.map_or(0, |a| a.value);
                SfdpDump(&self.sfdp).read_sfdp(addr, data_in(op)?)?;
            }
            RDSR => {
                let sr1 = self.sr1 | if self.wel { SR_WEL } else { 0 };
                data_in(op)?.fill(sr1);
            }
            RDCR | RDSR2_BIT7 => data_in(op)?.fill(self.sr2),
            BRRD => data_in(op)?.fill(self.bank),
            RDEAR => data_in(op)?.fill(self.ear),
            WREN => self.wel = true,
            WRDI => self.wel = false,
            WRSR => {
                let data = data_out(op)?;
                let (sr1, sr2) = (data[0], data.get(1).copied());
                self.write_status(Some(sr1), sr2);
            }
            // 0x3E is also the 4-byte 1-4-4 program, which carries an address
            WRSR2 | WRSR2_BIT7 if op.addr.is_none() => {
                let sr2 = data_out(op)?[0];
                self.write_status(None, Some(sr2));
            }
            EN4B | EX4B => {
                if !self.en4b_needs_wren || self.wel {
                    self.four_byte_mode = op.opcode == EN4B;
                }
            }
            BRWR => {
                self.bank = data_out(op)?[0];
                self.four_byte_mode = self.bank & BANK_EXTADD != 0;
            }
            WREAR => {
                let ear = data_out(op)?[0];
                if self.wel {
                    self.ear = ear;
                    self.wel = false;
                }
            }
            CHIP_ERASE | 0x60 => {
                if self.wel {
                    self.chunks.clear();
                    self.wel = false;
                }
            }
            opcode if READS.iter().any(|&r| r == opcode || read_3to4(r) == opcode) => {
                let addr = self.address(op)?;
                let len = match &op.data {
                    OpData::In(buf) => buf.len() as u64,
                    _ => bail!("read without a data-in phase"),
                };
                ensure!(addr + len <= self.size, "read past the end of the part");
                let data: Vec<u8> = (addr..addr + len).map(|a| self.byte(a)).collect();
                data_in(op)?.copy_from_slice(&data);
            }
            opcode if PROGRAMS.iter().any(|&p| p == opcode || program_3to4(p) == opcode) => {
                let addr = self.address(op)?;
                let data = data_out(op)?.to_vec();
                if self.wel {
                    // Programs wrap around within their page
                    let page = u64::from(self.page_size);
                    let page_start = addr & !(page - 1);
                    for (i, b) in data.iter().enumerate() {
                        let at = page_start + (addr - page_start + i as u64) % page;
                        *self.byte_mut(at) &= b;
                    }
                    self.wel = false;
                }
            }
            opcode => {
                if let Some(size) = self.erase_size(opcode) {
                    let addr = self.address(op)?;
                    ensure!(
                        addr % u64::from(size) == 0,
                        "erase {opcode:#04x} at unaligned {addr:#x}"
                    );
                    if self.wel {
                        self.erase_range(addr, u64::from(size));
                        self.wel = false;
                    }
                } else if let Some(&value) = self.registers.get(&opcode) {
                    data_in(op)?.fill(value);
                } else {
                    bail!("unsupported opcode {opcode:#04x}");
                }
            }
        }
        Ok(())
    }
}

/// Where the tables go in a built SFDP area, past room for a few more headers
const TABLES_START: usize = 0x100;

/// Builds SFDP areas for [SimNor]
#[derive(Debug, Clone)]
pub struct SfdpBuilder {
    bfpt: [u32; 16],
    four_bait: Option<[u32; 2]>,
    smpt: Option<Vec<u32>>,
}

impl SfdpBuilder {
    /// A rev A BFPT for a part of `size` bytes with 256-byte pages, and 4 KiB (0x20) and 64 KiB
    /// (0xD8) erases
    pub fn new(size: u64) -> Self {
        let mut bfpt = [0u32; 16];
        let addr_mode: u32 = if size > 16 << 20 { 0b01 } else { 0b00 };
        bfpt[0] = 0x01 | u32::from(BE_4K) << 8 | addr_mode << 17;

        let bits = size * 8;
        bfpt[1] = if bits <= 1 << 31 {
            (bits - 1) as u32
        } else {
            0x8000_0000 | bits.trailing_zeros()
        };

        bfpt[7] = 12 | u32::from(BE_4K) << 8 | 16 << 16 | u32::from(SE) << 24;
        bfpt[10] = 8 << 4;
        Self {
            bfpt,
            four_bait: None,
            smpt: None,
        }
    }

    /// Advertise one of the fast read modes the BFPT describes
    pub fn fast_read(mut self, caps: Hwcaps, opcode: u8, mode_clocks: u8, wait_states: u8) -> Self {
        if let Some(rd) = BFPT_READS.iter().find(|rd| rd.hwcaps == caps) {
            self.bfpt[rd.supported.0 - 1] |= 1 << rd.supported.1;
            let half = u32::from(opcode) << 8
                | u32::from(mode_clocks & 0x7) << 5
                | u32::from(wait_states & 0x1F);
            let dw = &mut self.bfpt[rd.settings.0 - 1];
            *dw = (*dw & !(0xFFFF << rd.settings.1)) | half << rd.settings.1;
        }
        self
    }

    /// Replace the erase types with up to four `(opcode, size)` pairs, in BFPT order
    pub fn erase_types(mut self, types: &[(u8, u32)]) -> Self {
        self.bfpt[7] = 0;
        self.bfpt[8] = 0;
        for (i, &(opcode, size)) in types.iter().take(4).enumerate() {
            let half = size.trailing_zeros() | u32::from(opcode) << 8;
            self.bfpt[7 + i / 2] |= half << (16 * (i % 2));
        }
        self
    }

    /// Set the quad enable requirement. [QuadEnable::Legacy] has no BFPT encoding and reads as none.
    pub fn quad_enable(mut self, qe: QuadEnable) -> Self {
        let qer = match qe {
            QuadEnable::None | QuadEnable::Legacy => 0,
            QuadEnable::BuggySr2Bit1 => 1,
            QuadEnable::Sr1Bit6 => 2,
            QuadEnable::Sr2Bit7 => 3,
            QuadEnable::Sr2Bit1NoRead => 4,
            QuadEnable::Sr2Bit1Read => 5,
        };
        self.bfpt[14] = (self.bfpt[14] & !(0x7 << 20)) | qer << 20;
        self
    }

    /// Set the "enter 4-byte addressing" bits of DWORD16
    pub fn enter_4b(mut self, bits: u8) -> Self {
        self.bfpt[15] = (self.bfpt[15] & 0x00FF_FFFF) | u32::from(bits) << 24;
        self
    }

    /// Declare the part to only take 4-byte addresses
    pub fn four_byte_only(mut self) -> Self {
        self.bfpt[0] = (self.bfpt[0] & !(0x3 << 17)) | 0b10 << 17;
        self
    }

    pub fn four_bait(mut self, supported: u32, erase_opcodes: [u8; 4]) -> Self {
        self.four_bait = Some([supported, u32::from_le_bytes(erase_opcodes)]);
        self
    }

    pub fn smpt(mut self, dwords: Vec<u32>) -> Self {
        self.smpt = Some(dwords);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut tables: Vec<(u16, &[u32])> = vec![(PARAM_ID_BFPT, &self.bfpt[..])];
        if let Some(four_bait) = &self.four_bait {
            tables.push((PARAM_ID_4BAIT, &four_bait[..]));
        }
        if let Some(smpt) = &self.smpt {
            tables.push((PARAM_ID_SMPT, smpt.as_slice()));
        }

        let mut blob = vec![0xFF; TABLES_START];
        blob[..4].copy_from_slice(b"SFDP");
        blob[4] = 6;
        blob[5] = 1;
        blob[6] = (tables.len() - 1) as u8;

        let mut pointer = TABLES_START as u32;
        for (i, (id, dwords)) in tables.iter().enumerate() {
            let p = pointer.to_le_bytes();
            let minor = if *id == PARAM_ID_BFPT { 6 } else { 0 };
            let header = [
                *id as u8,
                minor,
                1,
                dwords.len() as u8,
                p[0],
                p[1],
                p[2],
                (*id >> 8) as u8,
            ];
            blob[8 + 8 * i..16 + 8 * i].copy_from_slice(&header);
            pointer += dwords.len() as u32 * 4;
        }
        for (_, dwords) in &tables {
            blob.extend(dwords.iter().flat_map(|d| d.to_le_bytes()));
        }
        blob
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spi_nor::op;

    #[test]
    fn test_write_enable_latch() -> anyhow::Result<()> {
        let mut nor = SimNor::new([0xEF, 0x40, 0x18], 16 << 20, vec![]);
        let pp = |nor: &mut SimNor, data: &[u8]| {
            nor.exec_op(&mut SpiMemOp::cmd(PP).with_addr(0x100, 3).data_out(data))
        };

        // Ignored without WREN
        pp(&mut nor, &[0x00])?;
        assert_eq!(nor.peek(0x100, 1), [0xFF]);

        op::write_enable(&mut nor)?;
        assert_eq!(op::read_sr(&mut nor)? & SR_WEL, SR_WEL);
        pp(&mut nor, &[0x12, 0x34])?;
        assert_eq!(nor.peek(0x100, 2), [0x12, 0x34]);
        assert_eq!(op::read_sr(&mut nor)? & SR_WEL, 0);
        Ok(())
    }

    #[test]
    fn test_page_wrap_and_erase() -> anyhow::Result<()> {
        let mut nor = SimNor::new([0xEF, 0x40, 0x18], 16 << 20, vec![]);
        op::write_enable(&mut nor)?;
        nor.exec_op(&mut SpiMemOp::cmd(PP).with_addr(0x1FE, 3).data_out(&[1, 2, 3, 4]))?;
        assert_eq!(nor.peek(0x1FE, 2), [1, 2]);
        assert_eq!(nor.peek(0x100, 2), [3, 4]);
        assert_eq!(nor.peek(0x200, 1), [0xFF]);

        // Misaligned erases are rejected
        op::write_enable(&mut nor)?;
        assert!(nor.exec_op(&mut SpiMemOp::cmd(BE_4K).with_addr(0x100, 3)).is_err());

        nor.exec_op(&mut SpiMemOp::cmd(BE_4K).with_addr(0, 3))?;
        assert_eq!(nor.peek(0x100, 2), [0xFF, 0xFF]);
        Ok(())
    }

    #[test]
    fn test_address_modes() -> anyhow::Result<()> {
        let mut nor = SimNor::new([0xEF, 0x40, 0x19], 32 << 20, vec![]);
        let mut buf = [0u8; 4];

        // 4-byte opcodes take 4-byte addresses
        nor.exec_op(&mut SpiMemOp::cmd(READ_4B).with_addr(0x0100_0000, 4).data_in(&mut buf))?;
        assert!(nor
            .exec_op(&mut SpiMemOp::cmd(READ).with_addr(0x0100_0000, 4).data_in(&mut buf))
            .is_err());

        nor.exec_op(&mut SpiMemOp::cmd(EN4B))?;
        assert!(nor.is_four_byte_mode());
        nor.exec_op(&mut SpiMemOp::cmd(READ).with_addr(0x0100_0000, 4).data_in(&mut buf))?;

        // Quad reads need QE
        let mut nor = nor.with_qe(SimQe::Sr1Bit6);
        let mut quad = SpiMemOp::cmd(READ_1_1_4)
            .with_addr(0, 4)
            .with_proto(op::Protocol::SPI_1_1_4)
            .with_dummy(8)
            .data_in(&mut buf);
        assert!(nor.exec_op(&mut quad).is_err());
        Ok(())
    }

    #[test]
    fn test_builder_header() {
        let blob = SfdpBuilder::new(1 << 20).four_bait(0x7F, [0x21, 0xDC, 0, 0]).build();
        assert_eq!(&blob[..4], b"SFDP");
        assert_eq!(blob[6], 1);
        // BFPT header: id FF00, rev 1.6, 16 dwords at 0x100
        assert_eq!(&blob[8..16], [0x00, 6, 1, 16, 0x00, 0x01, 0x00, 0xFF]);
        // 4BAIT right after
        assert_eq!(&blob[16..24], [0x84, 0, 1, 2, 0x40, 0x01, 0x00, 0xFF]);
        assert_eq!(blob.len(), TABLES_START + 18 * 4);
    }
}
