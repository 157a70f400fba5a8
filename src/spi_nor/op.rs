//! SPI memory operations and the controller that executes them.
//!
//! Every access to a NOR chip is one [SpiMemOp]: an opcode, an optional address, some dummy
//! cycles and an optional data phase, each phase with its own bus width. Register helpers
//! (status reads, write enable, busy polling) are built here on [SpiMemController::exec_op].

use std::fmt;

use anyhow::bail;

use super::opcodes::*;

/// Bus widths of the instruction, address and data phases, as in "1-1-4"
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Protocol {
    pub inst: u8,
    pub addr: u8,
    pub data: u8,
}

impl Protocol {
    pub const SPI_1_1_1: Self = Self::new(1, 1, 1);
    pub const SPI_1_1_2: Self = Self::new(1, 1, 2);
    pub const SPI_1_2_2: Self = Self::new(1, 2, 2);
    pub const SPI_2_2_2: Self = Self::new(2, 2, 2);
    pub const SPI_1_1_4: Self = Self::new(1, 1, 4);
    pub const SPI_1_4_4: Self = Self::new(1, 4, 4);
    pub const SPI_4_4_4: Self = Self::new(4, 4, 4);
    pub const SPI_1_1_8: Self = Self::new(1, 1, 8);
    pub const SPI_1_8_8: Self = Self::new(1, 8, 8);
    pub const SPI_8_8_8: Self = Self::new(8, 8, 8);

    pub const fn new(inst: u8, addr: u8, data: u8) -> Self {
        Self { inst, addr, data }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::SPI_1_1_1
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.inst, self.addr, self.data)
    }
}

/// The address phase of an operation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OpAddr {
    pub value: u32,
    pub nbytes: u8,
}

/// The data phase of an operation
#[derive(Debug)]
pub enum OpData<'a> {
    None,

    /// Clock data out of the chip
    In(&'a mut [u8]),

    /// Clock data into the chip
    Out(&'a [u8]),
}

/// One complete transaction on the SPI bus, with chip select held throughout
#[derive(Debug)]
pub struct SpiMemOp<'a> {
    pub opcode: u8,
    pub proto: Protocol,
    pub addr: Option<OpAddr>,

    /// Dummy clock cycles between the address and the data
    pub dummy_cycles: u8,
    pub data: OpData<'a>,
}

impl<'a> SpiMemOp<'a> {
    /// An opcode-only operation, on a single line
    pub fn cmd(opcode: u8) -> Self {
        Self {
            opcode,
            proto: Protocol::SPI_1_1_1,
            addr: None,
            dummy_cycles: 0,
            data: OpData::None,
        }
    }

    pub fn with_addr(mut self, value: u32, nbytes: u8) -> Self {
        self.addr = Some(OpAddr { value, nbytes });
        self
    }

    pub fn with_dummy(mut self, dummy_cycles: u8) -> Self {
        self.dummy_cycles = dummy_cycles;
        self
    }

    pub fn with_proto(mut self, proto: Protocol) -> Self {
        self.proto = proto;
        self
    }

    pub fn data_in(mut self, buf: &'a mut [u8]) -> Self {
        self.data = OpData::In(buf);
        self
    }

    pub fn data_out(mut self, buf: &'a [u8]) -> Self {
        self.data = OpData::Out(buf);
        self
    }
}

/// A SPI controller that can execute memory operations
pub trait SpiMemController {
    fn exec_op(&mut self, op: &mut SpiMemOp<'_>) -> anyhow::Result<()>;
}

impl<C: SpiMemController + ?Sized> SpiMemController for &mut C {
    fn exec_op(&mut self, op: &mut SpiMemOp<'_>) -> anyhow::Result<()> {
        (**self).exec_op(op)
    }
}

/// How many times to poll the status register before giving up on an operation
const READY_POLLS: u32 = 1_000_000;

/// Read a register through a plain opcode + data-in operation
pub fn read_reg<C: SpiMemController + ?Sized>(
    ctrl: &mut C,
    opcode: u8,
    buf: &mut [u8],
) -> anyhow::Result<()> {
    ctrl.exec_op(&mut SpiMemOp::cmd(opcode).data_in(buf))
}

/// Write a register through a plain opcode + data-out operation
pub fn write_reg<C: SpiMemController + ?Sized>(
    ctrl: &mut C,
    opcode: u8,
    data: &[u8],
) -> anyhow::Result<()> {
    ctrl.exec_op(&mut SpiMemOp::cmd(opcode).data_out(data))
}

pub fn read_sr<C: SpiMemController + ?Sized>(ctrl: &mut C) -> anyhow::Result<u8> {
    let mut sr = [0u8];
    read_reg(ctrl, RDSR, &mut sr)?;
    Ok(sr[0])
}

/// Read status register 2, or the configuration register, depending on the vendor
pub fn read_cr<C: SpiMemController + ?Sized>(ctrl: &mut C) -> anyhow::Result<u8> {
    let mut cr = [0u8];
    read_reg(ctrl, RDCR, &mut cr)?;
    Ok(cr[0])
}

pub fn write_enable<C: SpiMemController + ?Sized>(ctrl: &mut C) -> anyhow::Result<()> {
    ctrl.exec_op(&mut SpiMemOp::cmd(WREN))
}

pub fn write_disable<C: SpiMemController + ?Sized>(ctrl: &mut C) -> anyhow::Result<()> {
    ctrl.exec_op(&mut SpiMemOp::cmd(WRDI))
}

/// Poll the status register until the write-in-progress bit clears
pub fn wait_ready<C: SpiMemController + ?Sized>(ctrl: &mut C) -> anyhow::Result<()> {
    for _ in 0..READY_POLLS {
        if read_sr(ctrl)? & SR_WIP == 0 {
            return Ok(());
        }
    }
    bail!("SPI-NOR still busy after {READY_POLLS} polls");
}

/// Read the first three bytes of the JEDEC ID
pub fn read_id<C: SpiMemController + ?Sized>(ctrl: &mut C) -> anyhow::Result<[u8; 3]> {
    let mut id = [0u8; 3];
    read_reg(ctrl, RDID, &mut id)?;
    Ok(id)
}

/// Read from the SFDP area: always a 3-byte address and 8 dummy cycles
pub fn read_sfdp<C: SpiMemController + ?Sized>(
    ctrl: &mut C,
    addr: u32,
    buf: &mut [u8],
) -> anyhow::Result<()> {
    ctrl.exec_op(
        &mut SpiMemOp::cmd(RDSFDP)
            .with_addr(addr, 3)
            .with_dummy(8)
            .data_in(buf),
    )
}
