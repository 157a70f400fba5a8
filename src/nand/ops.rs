//! Low-level NAND operations, expressed as a sequence of bus instructions.
//!
//! A controller only has to know how to put each [NandOpInstr] on its bus; everything that needs
//! a specific command sequence (feature access, status reads) is built here on top of
//! [NandController::exec_op].

/// SET FEATURES
pub const CMD_SET_FEATURES: u8 = 0xEF;
/// GET FEATURES
pub const CMD_GET_FEATURES: u8 = 0xEE;
/// READ STATUS
pub const CMD_READ_STATUS: u8 = 0x70;

/// Feature address holding the on-die ECC enable bit on most parts
pub const FEATURE_ON_DIE_ECC: u8 = 0x90;
/// The enable bit within [FEATURE_ON_DIE_ECC]
pub const FEATURE_ON_DIE_ECC_EN: u8 = 0x08;

/// Status: the last operation failed (for reads with on-die ECC: uncorrectable)
pub const STATUS_FAIL: u8 = 0x01;
/// Status: the last read needed corrections and should be rewritten
pub const STATUS_REWRITE: u8 = 0x08;
/// Status: the device is ready
pub const STATUS_READY: u8 = 0x40;

/// Default timeout for tFEAT/tR style waits
const WAIT_TIMEOUT_MS: u32 = 10;

/// One step of a NAND operation
#[derive(Debug, PartialEq, Eq)]
pub enum NandOpInstr<'a> {
    /// Latch a command byte
    Cmd(u8),

    /// Latch address cycles
    Addr(&'a [u8]),

    /// Clock data out of the device
    DataIn(&'a mut [u8]),

    /// Clock data into the device
    DataOut(&'a [u8]),

    /// Wait for the device to report ready
    WaitReady { timeout_ms: u32 },
}

/// A NAND controller that can execute instruction sequences
pub trait NandController {
    /// Execute all instructions of one operation, in order, with chip select held.
    fn exec_op(&mut self, instrs: &mut [NandOpInstr<'_>]) -> anyhow::Result<()>;
}

/// Write the four parameter bytes of a feature address
pub fn set_feature<C: NandController + ?Sized>(
    ctrl: &mut C,
    addr: u8,
    params: [u8; 4],
) -> anyhow::Result<()> {
    ctrl.exec_op(&mut [
        NandOpInstr::Cmd(CMD_SET_FEATURES),
        NandOpInstr::Addr(&[addr]),
        NandOpInstr::DataOut(&params),
        NandOpInstr::WaitReady {
            timeout_ms: WAIT_TIMEOUT_MS,
        },
    ])
}

/// Read the four parameter bytes of a feature address
pub fn get_feature<C: NandController + ?Sized>(ctrl: &mut C, addr: u8) -> anyhow::Result<[u8; 4]> {
    let mut params = [0u8; 4];
    ctrl.exec_op(&mut [
        NandOpInstr::Cmd(CMD_GET_FEATURES),
        NandOpInstr::Addr(&[addr]),
        NandOpInstr::WaitReady {
            timeout_ms: WAIT_TIMEOUT_MS,
        },
        NandOpInstr::DataIn(&mut params),
    ])?;
    Ok(params)
}

/// Read the status register
pub fn read_status<C: NandController + ?Sized>(ctrl: &mut C) -> anyhow::Result<u8> {
    let mut status = [0u8; 1];
    ctrl.exec_op(&mut [
        NandOpInstr::Cmd(CMD_READ_STATUS),
        NandOpInstr::DataIn(&mut status),
    ])?;
    Ok(status[0])
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// A controller that logs every operation and serves feature and status reads from memory
    #[derive(Debug, Default)]
    pub struct LoggingController {
        pub log: Vec<Vec<String>>,
        pub features: std::collections::HashMap<u8, [u8; 4]>,
        pub status: u8,
    }

    impl NandController for LoggingController {
        fn exec_op(&mut self, instrs: &mut [NandOpInstr<'_>]) -> anyhow::Result<()> {
            let mut cmd = None;
            let mut addr = None;
            let mut entry = Vec::new();

            for instr in instrs.iter_mut() {
                entry.push(format!("{instr:?}"));
                match instr {
                    NandOpInstr::Cmd(c) => cmd = Some(*c),
                    NandOpInstr::Addr(a) => addr = a.first().copied(),
                    NandOpInstr::DataOut(data) => {
                        if let (Some(CMD_SET_FEATURES), Some(addr)) = (cmd, addr) {
                            let params: [u8; 4] = (*data).try_into()?;
                            self.features.insert(addr, params);
                        }
                    }
                    NandOpInstr::DataIn(data) => match (cmd, addr) {
                        (Some(CMD_GET_FEATURES), Some(addr)) => {
                            let params = self.features.get(&addr).copied().unwrap_or_default();
                            data.copy_from_slice(&params);
                        }
                        (Some(CMD_READ_STATUS), _) => data.fill(self.status),
                        _ => anyhow::bail!("unexpected data-in"),
                    },
                    NandOpInstr::WaitReady { .. } => (),
                }
            }

            self.log.push(entry);
            Ok(())
        }
    }

    #[test]
    fn test_feature_roundtrip() -> anyhow::Result<()> {
        let mut ctrl = LoggingController::default();
        set_feature(&mut ctrl, FEATURE_ON_DIE_ECC, [FEATURE_ON_DIE_ECC_EN, 0, 0, 0])?;
        assert_eq!(
            get_feature(&mut ctrl, FEATURE_ON_DIE_ECC)?,
            [FEATURE_ON_DIE_ECC_EN, 0, 0, 0]
        );
        assert_eq!(ctrl.log.len(), 2);
        assert_eq!(ctrl.log[0][0], "Cmd(239)");
        Ok(())
    }

    #[test]
    fn test_read_status() -> anyhow::Result<()> {
        let mut ctrl = LoggingController {
            status: STATUS_READY | STATUS_REWRITE,
            ..Default::default()
        };
        assert_eq!(read_status(&mut ctrl)?, 0x48);
        Ok(())
    }
}
