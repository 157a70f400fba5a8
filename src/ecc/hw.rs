//! Engines where the ECC math happens outside the CPU

use super::{
    tune_hw_strength, Direction, EccConfig, EccEngine, EccMode, EccStats, EccStatus, EngineType,
    HwEccCaps, PageRequest,
};
use crate::error::Result;
use crate::nand::ops::{
    get_feature, read_status, set_feature, NandController, FEATURE_ON_DIE_ECC,
    FEATURE_ON_DIE_ECC_EN, STATUS_FAIL, STATUS_REWRITE,
};

/// The register interface of a controller's pipelined ECC block
pub trait EccHardware {
    /// Configure the block for `steps` steps of `step_size` bytes at `strength`
    fn configure(&mut self, step_size: usize, strength: u32, steps: usize) -> anyhow::Result<()>;

    /// Turn the block on for the next transfer
    fn enable(&mut self, direction: Direction) -> anyhow::Result<()>;

    fn disable(&mut self) -> anyhow::Result<()>;

    /// Per-step result of the last read: `Some(corrected bits)` or `None` if the step failed
    fn step_status(&mut self) -> anyhow::Result<Vec<Option<u32>>>;
}

/// A controller ECC block that corrects data as it streams between NAND and memory
#[derive(Debug)]
pub struct PipelinedEngine<H: EccHardware> {
    hw: H,
    step_size: usize,
    strength: u32,
    threshold: u32,
    stats: EccStats,
}

impl<H: EccHardware> PipelinedEngine<H> {
    /// Tune the hardware strength to the page geometry and program the block
    pub fn new(
        mut hw: H,
        caps: &HwEccCaps,
        page_size: usize,
        oob_size: usize,
        config: &EccConfig,
    ) -> Result<Self> {
        let choice = tune_hw_strength(caps, page_size, oob_size, config.step_size, config.strength)?;
        hw.configure(config.step_size, choice.strength, choice.steps)?;

        Ok(Self {
            hw,
            step_size: config.step_size,
            strength: choice.strength,
            threshold: config.threshold_for(choice.strength),
            stats: EccStats::default(),
        })
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }
}

impl<H: EccHardware> EccEngine for PipelinedEngine<H> {
    fn engine_type(&self) -> EngineType {
        EngineType::Pipelined
    }

    fn step_size(&self) -> usize {
        self.step_size
    }

    fn strength(&self) -> u32 {
        self.strength
    }

    fn bitflip_threshold(&self) -> u32 {
        self.threshold
    }

    fn stats(&self) -> EccStats {
        self.stats
    }

    fn prepare_io(&mut self, req: &mut PageRequest<'_>) -> Result<()> {
        if req.mode == EccMode::Raw {
            return Ok(());
        }
        Ok(self.hw.enable(req.direction)?)
    }

    fn finish_io(&mut self, req: &mut PageRequest<'_>) -> Result<EccStatus> {
        if req.mode == EccMode::Raw {
            return Ok(EccStatus::Clean);
        }

        self.hw.disable()?;
        if req.direction == Direction::Write {
            return Ok(EccStatus::Clean);
        }

        let mut max_bitflips = 0;
        let mut failed = false;
        for step in self.hw.step_status()? {
            match step {
                Some(bits) => {
                    self.stats.corrected += u64::from(bits);
                    max_bitflips = max_bitflips.max(bits);
                }
                None => {
                    self.stats.failed += 1;
                    failed = true;
                }
            }
        }

        Ok(if failed {
            EccStatus::Uncorrectable
        } else if max_bitflips > 0 {
            EccStatus::Corrected { max_bitflips }
        } else {
            EccStatus::Clean
        })
    }
}

/// ECC computed by the NAND chip itself, switched through its feature register
#[derive(Debug)]
pub struct OnDieEngine<C: NandController> {
    ctrl: C,
    step_size: usize,
    strength: u32,
    threshold: u32,
    stats: EccStats,
}

impl<C: NandController> OnDieEngine<C> {
    /// `step_size` and `strength` are what the chip's datasheet promises
    pub fn new(ctrl: C, config: &EccConfig) -> Self {
        Self {
            ctrl,
            step_size: config.step_size,
            strength: config.strength,
            threshold: config.threshold_for(config.strength),
            stats: EccStats::default(),
        }
    }

    pub fn controller(&self) -> &C {
        &self.ctrl
    }

    /// Read-modify-write the on-die ECC enable bit
    fn set_enabled(&mut self, enable: bool) -> Result<()> {
        let mut params = get_feature(&mut self.ctrl, FEATURE_ON_DIE_ECC)?;
        let wanted = if enable {
            params[0] | FEATURE_ON_DIE_ECC_EN
        } else {
            params[0] & !FEATURE_ON_DIE_ECC_EN
        };
        if wanted != params[0] {
            params[0] = wanted;
            set_feature(&mut self.ctrl, FEATURE_ON_DIE_ECC, params)?;
        }
        Ok(())
    }
}

impl<C: NandController> EccEngine for OnDieEngine<C> {
    fn engine_type(&self) -> EngineType {
        EngineType::OnDie
    }

    fn step_size(&self) -> usize {
        self.step_size
    }

    fn strength(&self) -> u32 {
        self.strength
    }

    fn bitflip_threshold(&self) -> u32 {
        self.threshold
    }

    fn stats(&self) -> EccStats {
        self.stats
    }

    fn prepare_io(&mut self, req: &mut PageRequest<'_>) -> Result<()> {
        self.set_enabled(req.mode == EccMode::Ecc)
    }

    fn finish_io(&mut self, req: &mut PageRequest<'_>) -> Result<EccStatus> {
        if req.mode == EccMode::Raw || req.direction == Direction::Write {
            return Ok(EccStatus::Clean);
        }

        let status = read_status(&mut self.ctrl)?;
        if status & STATUS_FAIL != 0 {
            self.stats.failed += 1;
            return Ok(EccStatus::Uncorrectable);
        }

        // The chip does not say how many bits it fixed, only that the page should be rewritten.
        if status & STATUS_REWRITE != 0 {
            self.stats.corrected += u64::from(self.strength);
            return Ok(EccStatus::Corrected {
                max_bitflips: self.strength,
            });
        }

        Ok(EccStatus::Clean)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::ops::test::LoggingController;
    use crate::nand::ops::STATUS_READY;

    #[derive(Debug, Default)]
    struct FakeHardware {
        configured: Option<(usize, u32, usize)>,
        enabled: Option<Direction>,
        calls: Vec<&'static str>,
        status: Vec<Option<u32>>,
    }

    impl EccHardware for FakeHardware {
        fn configure(&mut self, step_size: usize, strength: u32, steps: usize) -> anyhow::Result<()> {
            self.configured = Some((step_size, strength, steps));
            Ok(())
        }

        fn enable(&mut self, direction: Direction) -> anyhow::Result<()> {
            self.enabled = Some(direction);
            self.calls.push("enable");
            Ok(())
        }

        fn disable(&mut self) -> anyhow::Result<()> {
            self.enabled = None;
            self.calls.push("disable");
            Ok(())
        }

        fn step_status(&mut self) -> anyhow::Result<Vec<Option<u32>>> {
            self.calls.push("status");
            Ok(self.status.clone())
        }
    }

    fn request<'a>(
        mode: EccMode,
        direction: Direction,
        data: &'a mut [u8],
        oob: &'a mut [u8],
    ) -> PageRequest<'a> {
        PageRequest {
            mode,
            direction,
            data,
            oob,
        }
    }

    #[test]
    fn test_pipelined() -> anyhow::Result<()> {
        let config = EccConfig {
            step_size: 1024,
            strength: 40,
            bitflip_threshold: None,
        };
        let mut engine =
            PipelinedEngine::new(FakeHardware::default(), &HwEccCaps::default(), 2048, 64, &config)?;
        assert_eq!(engine.strength(), 8);
        assert_eq!(engine.hardware().configured, Some((1024, 8, 2)));

        let (mut data, mut oob) = (vec![0u8; 2048], vec![0u8; 64]);

        let mut req = request(EccMode::Ecc, Direction::Write, &mut data, &mut oob);
        engine.prepare_io(&mut req)?;
        assert_eq!(engine.finish_io(&mut req)?, EccStatus::Clean);
        assert_eq!(engine.hardware().calls, ["enable", "disable"]);

        engine.hw.status = vec![Some(1), Some(5)];
        let mut req = request(EccMode::Ecc, Direction::Read, &mut data, &mut oob);
        engine.prepare_io(&mut req)?;
        assert_eq!(
            engine.finish_io(&mut req)?,
            EccStatus::Corrected { max_bitflips: 5 }
        );

        engine.hw.status = vec![None, Some(0)];
        let mut req = request(EccMode::Ecc, Direction::Read, &mut data, &mut oob);
        engine.prepare_io(&mut req)?;
        assert_eq!(engine.finish_io(&mut req)?, EccStatus::Uncorrectable);
        assert_eq!(
            engine.stats(),
            EccStats {
                corrected: 6,
                failed: 1
            }
        );

        let calls = engine.hardware().calls.len();
        let mut req = request(EccMode::Raw, Direction::Read, &mut data, &mut oob);
        engine.prepare_io(&mut req)?;
        engine.finish_io(&mut req)?;
        assert_eq!(engine.hardware().calls.len(), calls);
        Ok(())
    }

    #[test]
    fn test_on_die() -> anyhow::Result<()> {
        let mut engine = OnDieEngine::new(LoggingController::default(), &EccConfig::default());
        let (mut data, mut oob) = (vec![0u8; 2048], vec![0u8; 64]);

        let mut req = request(EccMode::Ecc, Direction::Read, &mut data, &mut oob);
        engine.prepare_io(&mut req)?;
        assert_eq!(
            engine.controller().features.get(&FEATURE_ON_DIE_ECC),
            Some(&[FEATURE_ON_DIE_ECC_EN, 0, 0, 0])
        );
        engine.ctrl.status = STATUS_READY;
        assert_eq!(engine.finish_io(&mut req)?, EccStatus::Clean);

        // Already enabled: only the get-features round trip
        let ops = engine.controller().log.len();
        engine.ctrl.status = STATUS_READY | STATUS_REWRITE;
        let mut req = request(EccMode::Ecc, Direction::Read, &mut data, &mut oob);
        engine.prepare_io(&mut req)?;
        assert_eq!(engine.controller().log.len(), ops + 1);
        assert_eq!(
            engine.finish_io(&mut req)?,
            EccStatus::Corrected { max_bitflips: 4 }
        );

        engine.ctrl.status = STATUS_READY | STATUS_FAIL;
        let mut req = request(EccMode::Ecc, Direction::Read, &mut data, &mut oob);
        engine.prepare_io(&mut req)?;
        assert_eq!(engine.finish_io(&mut req)?, EccStatus::Uncorrectable);
        assert_eq!(engine.stats().failed, 1);

        let mut req = request(EccMode::Raw, Direction::Read, &mut data, &mut oob);
        engine.prepare_io(&mut req)?;
        assert_eq!(
            engine.controller().features.get(&FEATURE_ON_DIE_ECC),
            Some(&[0, 0, 0, 0])
        );
        Ok(())
    }
}
