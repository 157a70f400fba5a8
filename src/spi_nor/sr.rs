//! Status register procedures: setting the quad enable bit, and switching 4-byte address mode.

use log::debug;

use super::op::{self, SpiMemController};
use super::opcodes::*;
use crate::error::{Error, Result};

/// How a part's quad enable bit is set
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum QuadEnable {
    /// No quad enable bit; quad modes always work
    #[default]
    None,

    /// SR2 bit 1, written with a 2-byte WRSR. Reading SR2 back is unreliable.
    BuggySr2Bit1,

    /// SR1 bit 6, written with a 1-byte WRSR
    Sr1Bit6,

    /// SR2 bit 7, read with 0x3F and written with 0x3E
    Sr2Bit7,

    /// SR2 bit 1, written with a 2-byte WRSR. SR2 cannot be read.
    Sr2Bit1NoRead,

    /// SR2 bit 1, written with a 2-byte WRSR and read back with RDCR
    Sr2Bit1Read,

    /// SR2 bit 1, written alone with WRSR2 and read back with RDCR
    Legacy,
}

impl QuadEnable {
    /// Decode the QER field of BFPT DWORD15
    pub fn from_bfpt(qer: u32) -> Result<Self> {
        Ok(match qer {
            0 => Self::None,
            1 => Self::BuggySr2Bit1,
            2 => Self::Sr1Bit6,
            3 => Self::Sr2Bit7,
            4 => Self::Sr2Bit1NoRead,
            5 => Self::Sr2Bit1Read,
            _ => {
                return Err(Error::Corrupt {
                    what: format!("BFPT quad enable requirement {qer}"),
                })
            }
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::BuggySr2Bit1 => "sr2-bit1-buggy",
            Self::Sr1Bit6 => "sr1-bit6",
            Self::Sr2Bit7 => "sr2-bit7",
            Self::Sr2Bit1NoRead => "sr2-bit1-no-read",
            Self::Sr2Bit1Read => "sr2-bit1-read",
            Self::Legacy => "legacy",
        }
    }

    /// Set the quad enable bit and check that it stuck
    pub fn enable<C: SpiMemController + ?Sized>(self, ctrl: &mut C) -> Result<()> {
        debug!("Setting quad enable: {}", self.name());
        let set = match self {
            Self::None => return Ok(()),
            Self::Sr1Bit6 => {
                let sr1 = op::read_sr(ctrl)?;
                if sr1 & SR1_QUAD_EN_BIT6 != 0 {
                    return Ok(());
                }
                write_sr(ctrl, WRSR, &[sr1 | SR1_QUAD_EN_BIT6])?;
                op::read_sr(ctrl)? & SR1_QUAD_EN_BIT6 != 0
            }
            Self::Sr2Bit1Read => {
                let cr = op::read_cr(ctrl)?;
                if cr & SR2_QUAD_EN_BIT1 != 0 {
                    return Ok(());
                }
                let sr1 = op::read_sr(ctrl)?;
                write_sr(ctrl, WRSR, &[sr1, cr | SR2_QUAD_EN_BIT1])?;
                op::read_cr(ctrl)? & SR2_QUAD_EN_BIT1 != 0
            }
            Self::Sr2Bit1NoRead | Self::BuggySr2Bit1 => {
                // SR2 is blind, so the rest of it is written as zero
                let sr1 = op::read_sr(ctrl)?;
                write_sr(ctrl, WRSR, &[sr1, SR2_QUAD_EN_BIT1])?;
                op::read_sr(ctrl)? == sr1 & !(SR_WIP | SR_WEL)
            }
            Self::Sr2Bit7 => {
                let mut sr2 = [0u8];
                op::read_reg(ctrl, RDSR2_BIT7, &mut sr2)?;
                if sr2[0] & SR2_QUAD_EN_BIT7 != 0 {
                    return Ok(());
                }
                write_sr(ctrl, WRSR2_BIT7, &[sr2[0] | SR2_QUAD_EN_BIT7])?;
                op::read_reg(ctrl, RDSR2_BIT7, &mut sr2)?;
                sr2[0] & SR2_QUAD_EN_BIT7 != 0
            }
            Self::Legacy => {
                let cr = op::read_cr(ctrl)?;
                if cr & SR2_QUAD_EN_BIT1 != 0 {
                    return Ok(());
                }
                write_sr(ctrl, WRSR2, &[cr | SR2_QUAD_EN_BIT1])?;
                op::read_cr(ctrl)? & SR2_QUAD_EN_BIT1 != 0
            }
        };

        if set {
            Ok(())
        } else {
            Err(Error::QeNotSet {
                procedure: self.name(),
            })
        }
    }
}

/// Write a status register and wait for the write to finish
fn write_sr<C: SpiMemController + ?Sized>(ctrl: &mut C, opcode: u8, data: &[u8]) -> Result<()> {
    op::write_enable(ctrl)?;
    op::write_reg(ctrl, opcode, data)?;
    op::wait_ready(ctrl)?;
    Ok(())
}

/// How a part is switched in and out of 4-byte address mode
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum FourByteMode {
    /// EN4B / EX4B
    #[default]
    En4bEx4b,

    /// EN4B / EX4B, each after a write enable
    WrenEn4bEx4b,

    /// Bit 7 of the bank register
    BankRegister,

    /// EN4B / EX4B, and the extended address register cleared on the way out
    En4bEx4bClearEar,

    /// Always in 4-byte mode
    Always,
}

impl FourByteMode {
    /// Decode the "enter 4-byte addressing" field of BFPT DWORD16, preferring the plainest method
    pub fn from_bfpt(enter: u32) -> Option<Self> {
        if enter & 1 << 0 != 0 {
            Some(Self::En4bEx4b)
        } else if enter & 1 << 1 != 0 {
            Some(Self::WrenEn4bEx4b)
        } else if enter & 1 << 3 != 0 {
            Some(Self::BankRegister)
        } else if enter & 1 << 6 != 0 {
            Some(Self::Always)
        } else {
            None
        }
    }

    pub fn set<C: SpiMemController + ?Sized>(self, ctrl: &mut C, enable: bool) -> Result<()> {
        debug!("{} 4-byte address mode ({self:?})", if enable { "Entering" } else { "Leaving" });
        let en4b = if enable { EN4B } else { EX4B };
        match self {
            Self::Always => {}
            Self::En4bEx4b => ctrl.exec_op(&mut op::SpiMemOp::cmd(en4b))?,
            Self::WrenEn4bEx4b => {
                op::write_enable(ctrl)?;
                ctrl.exec_op(&mut op::SpiMemOp::cmd(en4b))?;
                op::write_disable(ctrl)?;
            }
            Self::BankRegister => {
                let bank = if enable { BANK_EXTADD } else { 0 };
                op::write_reg(ctrl, BRWR, &[bank])?;
            }
            Self::En4bEx4bClearEar => {
                ctrl.exec_op(&mut op::SpiMemOp::cmd(en4b))?;
                if !enable {
                    // Reads with 3-byte addresses keep using the top byte from EAR
                    op::write_enable(ctrl)?;
                    op::write_reg(ctrl, WREAR, &[0])?;
                    op::write_disable(ctrl)?;
                }
            }
        }
        Ok(())
    }
}

#[test]
fn test_from_bfpt() -> anyhow::Result<()> {
    assert_eq!(QuadEnable::from_bfpt(2)?, QuadEnable::Sr1Bit6);
    assert_eq!(QuadEnable::from_bfpt(5)?, QuadEnable::Sr2Bit1Read);
    assert!(matches!(QuadEnable::from_bfpt(6), Err(Error::Corrupt { .. })));

    assert_eq!(FourByteMode::from_bfpt(0b0000_0011), Some(FourByteMode::En4bEx4b));
    assert_eq!(FourByteMode::from_bfpt(0b0000_1000), Some(FourByteMode::BankRegister));
    assert_eq!(FourByteMode::from_bfpt(0b0010_0000), None);
    Ok(())
}
