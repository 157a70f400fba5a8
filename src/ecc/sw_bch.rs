use super::bch::Bch;
use super::{
    get_ecc_bytes, set_ecc_bytes, Direction, EccConfig, EccEngine, EccMode, EccStats, EccStatus,
    EngineType, OobLayout, PageRequest, StandardLayout,
};
use crate::error::{Error, Result};
use crate::util::fls;

/// BCH computed on the CPU, with ECC bytes stored in the OOB area
#[derive(Debug, Clone)]
pub struct SwBchEngine {
    bch: Bch,
    step_size: usize,
    ecc_bytes: usize,
    steps: usize,
    threshold: u32,

    /// Inverted encoding of an erased step; XORed into every code so erased pages decode clean
    eccmask: Vec<u8>,

    layout: StandardLayout,
    errloc: Vec<u32>,
    stats: EccStats,
}

impl SwBchEngine {
    /// Set up BCH for pages of `page_size` bytes with `oob_size` OOB bytes
    pub fn new(page_size: usize, oob_size: usize, config: &EccConfig) -> Result<Self> {
        let step_size = config.step_size;
        if step_size == 0 || page_size % step_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "step size {step_size} does not divide page size {page_size}"
            )));
        }

        let m = fls(1 + 8 * step_size as u32);
        let ecc_bytes = (config.strength * m).div_ceil(8) as usize;
        let t = (ecc_bytes as u32 * 8) / m;

        let bch = Bch::new(m, t)?;
        if bch.ecc_bytes() != ecc_bytes {
            return Err(Error::InvalidConfig(format!(
                "invalid eccbytes {ecc_bytes}, should be {}",
                bch.ecc_bytes()
            )));
        }
        if 8 * (step_size + ecc_bytes) >= 1 << m {
            return Err(Error::InvalidConfig(format!(
                "step size {step_size} is too large"
            )));
        }

        let steps = page_size / step_size;
        let layout = StandardLayout::new(oob_size, steps * ecc_bytes)?;

        let mut eccmask = vec![0u8; ecc_bytes];
        bch.encode(&vec![0xFFu8; step_size], &mut eccmask)?;
        eccmask.iter_mut().for_each(|x| *x ^= 0xFF);

        log::debug!(
            "BCH: m={m} t={t}, {steps} steps of {step_size}+{ecc_bytes} bytes"
        );

        Ok(Self {
            bch,
            step_size,
            ecc_bytes,
            steps,
            threshold: config.threshold_for(t),
            eccmask,
            layout,
            errloc: Vec::with_capacity(t as usize),
            stats: EccStats::default(),
        })
    }

    /// ECC bytes per step
    pub fn ecc_bytes(&self) -> usize {
        self.ecc_bytes
    }

    /// Steps per page
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Compute the stored code for one step of data
    pub fn calculate(&self, step: &[u8], code: &mut [u8]) -> Result<()> {
        self.bch.encode(step, code)?;
        code.iter_mut()
            .zip(&self.eccmask)
            .for_each(|(c, m)| *c ^= m);
        Ok(())
    }

    /// Correct one step in place, given the code read from the OOB and the code calculated over
    /// the data as read. Returns the number of bit errors found, including any within the code
    /// itself.
    pub fn correct(&mut self, step: &mut [u8], read_ecc: &[u8], calc_ecc: &[u8]) -> Result<u32> {
        match self
            .bch
            .decode(step.len(), read_ecc, calc_ecc, &mut self.errloc)
        {
            Ok(count) => {
                for &loc in &self.errloc {
                    let loc = loc as usize;
                    if loc < step.len() * 8 {
                        step[loc / 8] ^= 0x80 >> (loc % 8);
                    }
                }
                self.stats.corrected += count as u64;
                Ok(count as u32)
            }
            Err(Error::Uncorrectable) => {
                self.stats.failed += 1;
                Err(Error::Uncorrectable)
            }
            Err(e) => Err(e),
        }
    }
}

impl EccEngine for SwBchEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::External
    }

    fn step_size(&self) -> usize {
        self.step_size
    }

    fn strength(&self) -> u32 {
        self.bch.t()
    }

    fn bitflip_threshold(&self) -> u32 {
        self.threshold
    }

    fn stats(&self) -> EccStats {
        self.stats
    }

    fn ooblayout(&self) -> Option<&dyn OobLayout> {
        Some(&self.layout)
    }

    fn prepare_io(&mut self, req: &mut PageRequest<'_>) -> Result<()> {
        if req.mode == EccMode::Raw || req.direction == Direction::Read {
            return Ok(());
        }

        let mut codes = vec![0u8; self.steps * self.ecc_bytes];
        for (step, code) in req
            .data
            .chunks(self.step_size)
            .zip(codes.chunks_mut(self.ecc_bytes))
        {
            self.calculate(step, code)?;
        }
        set_ecc_bytes(&self.layout, &codes, req.oob)
    }

    fn finish_io(&mut self, req: &mut PageRequest<'_>) -> Result<EccStatus> {
        if req.mode == EccMode::Raw || req.direction == Direction::Write {
            return Ok(EccStatus::Clean);
        }

        let mut read_codes = vec![0u8; self.steps * self.ecc_bytes];
        get_ecc_bytes(&self.layout, &mut read_codes, req.oob)?;

        let mut calc = vec![0u8; self.ecc_bytes];
        let mut max_bitflips = 0;
        let mut failed = false;
        for (step, read_ecc) in req
            .data
            .chunks_mut(self.step_size)
            .zip(read_codes.chunks(self.ecc_bytes))
        {
            self.calculate(step, &mut calc)?;
            match self.correct(step, read_ecc, &calc) {
                Ok(count) => max_bitflips = max_bitflips.max(count),
                Err(Error::Uncorrectable) => failed = true,
                Err(e) => return Err(e),
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

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn engine(strength: u32) -> SwBchEngine {
        let config = EccConfig {
            step_size: 512,
            strength,
            bitflip_threshold: None,
        };
        SwBchEngine::new(2048, 64, &config).unwrap()
    }

    fn pattern(seed: u8) -> Vec<u8> {
        (0..512usize)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn test_init() -> anyhow::Result<()> {
        let bch = engine(4);
        assert_eq!(bch.ecc_bytes(), 7);
        assert_eq!(bch.steps(), 4);
        assert_eq!(bch.strength(), 4);
        assert_eq!(bch.bitflip_threshold(), 3);

        let bch = engine(8);
        assert_eq!(bch.ecc_bytes(), 13);
        assert_eq!(bch.ooblayout().map(|l| l.ecc_capacity()), Some(52));

        // 4 steps of 17 ECC bytes do not fit beside the marker in 64 OOB bytes
        let config = EccConfig {
            step_size: 512,
            strength: 10,
            bitflip_threshold: None,
        };
        assert!(matches!(
            SwBchEngine::new(2048, 64, &config),
            Err(Error::InvalidConfig(_))
        ));

        let config = EccConfig {
            step_size: 500,
            ..Default::default()
        };
        assert!(SwBchEngine::new(2048, 64, &config).is_err());
        Ok(())
    }

    #[test]
    fn test_clean_roundtrip() -> anyhow::Result<()> {
        let mut bch = engine(4);
        let mut data = pattern(1);
        let original = data.clone();
        let mut code = vec![0u8; bch.ecc_bytes()];
        bch.calculate(&data, &mut code)?;

        assert_eq!(bch.correct(&mut data, &code.clone(), &code)?, 0);
        assert_eq!(data, original);
        Ok(())
    }

    #[test]
    fn test_erased_step() -> anyhow::Result<()> {
        let mut bch = engine(4);
        let mut data = vec![0xFFu8; 512];
        let mut code = vec![0u8; bch.ecc_bytes()];
        bch.calculate(&data, &mut code)?;
        assert!(code.iter().all(|&x| x == 0xFF));

        let erased_code = vec![0xFFu8; bch.ecc_bytes()];
        assert_eq!(bch.correct(&mut data, &erased_code, &code)?, 0);

        // A bit-flip in an erased step is corrected back to 0xFF
        data[100] = 0xEF;
        bch.calculate(&data, &mut code)?;
        assert_eq!(bch.correct(&mut data, &erased_code, &code)?, 1);
        assert!(data.iter().all(|&x| x == 0xFF));
        Ok(())
    }

    #[test]
    fn test_code_bit_errors_not_applied() -> anyhow::Result<()> {
        let mut bch = engine(4);
        let mut data = pattern(9);
        let original = data.clone();
        let mut code = vec![0u8; bch.ecc_bytes()];
        bch.calculate(&data, &mut code)?;

        let mut stored = code.clone();
        stored[2] ^= 0x10;
        assert_eq!(bch.correct(&mut data, &stored, &code)?, 1);
        assert_eq!(data, original);
        Ok(())
    }

    #[test]
    fn test_uncorrectable() -> anyhow::Result<()> {
        let mut bch = engine(4);
        let data = pattern(3);
        let mut code = vec![0u8; bch.ecc_bytes()];
        bch.calculate(&data, &mut code)?;

        let mut damaged = data.clone();
        for bit in [5usize, 600, 1200, 2400, 3000, 4001] {
            damaged[bit / 8] ^= 0x80 >> (bit % 8);
        }
        let mut calc = vec![0u8; bch.ecc_bytes()];
        bch.calculate(&damaged, &mut calc)?;

        assert!(matches!(
            bch.correct(&mut damaged, &code, &calc),
            Err(Error::Uncorrectable)
        ));
        assert_eq!(bch.stats().failed, 1);
        Ok(())
    }

    #[test]
    fn test_short_code_buffers() -> anyhow::Result<()> {
        let mut bch = engine(4);
        let mut data = pattern(5);
        let mut short = vec![0u8; bch.ecc_bytes() - 1];
        assert!(matches!(
            bch.calculate(&data, &mut short),
            Err(Error::InvalidConfig(_))
        ));

        let mut code = vec![0u8; bch.ecc_bytes()];
        bch.calculate(&data, &mut code)?;
        assert!(matches!(
            bch.correct(&mut data, &code[..3], &code),
            Err(Error::InvalidConfig(_))
        ));
        // A caller error is not a decode failure
        assert_eq!(bch.stats().failed, 0);
        Ok(())
    }

    #[test]
    fn test_page_hooks() -> anyhow::Result<()> {
        let mut bch = engine(4);
        let mut data: Vec<u8> = (0..2048usize).map(|i| (i * 13) as u8).collect();
        let original = data.clone();
        let mut oob = vec![0xFFu8; 64];

        let mut req = PageRequest {
            mode: EccMode::Ecc,
            direction: Direction::Write,
            data: &mut data,
            oob: &mut oob,
        };
        bch.prepare_io(&mut req)?;
        assert_eq!(bch.finish_io(&mut req)?, EccStatus::Clean);
        assert!(oob[..36].iter().all(|&x| x == 0xFF));
        assert!(!oob[36..].iter().all(|&x| x == 0xFF));

        data[0] ^= 0x01;
        data[600] ^= 0x22;
        let mut req = PageRequest {
            mode: EccMode::Ecc,
            direction: Direction::Read,
            data: &mut data,
            oob: &mut oob,
        };
        bch.prepare_io(&mut req)?;
        assert_eq!(
            bch.finish_io(&mut req)?,
            EccStatus::Corrected { max_bitflips: 2 }
        );
        assert_eq!(data, original);
        assert_eq!(bch.stats().corrected, 3);

        // Raw reads are left alone
        data[0] ^= 0x01;
        let mut req = PageRequest {
            mode: EccMode::Raw,
            direction: Direction::Read,
            data: &mut data,
            oob: &mut oob,
        };
        assert_eq!(bch.finish_io(&mut req)?, EccStatus::Clean);
        assert_ne!(data, original);
        Ok(())
    }

    proptest! {
        #[test]
        fn test_corrects_up_to_strength(
            seed in any::<u8>(),
            positions in proptest::collection::btree_set(0usize..512 * 8, 1..=8),
        ) {
            let mut bch = engine(8);
            let original = pattern(seed);
            let mut code = vec![0u8; bch.ecc_bytes()];
            bch.calculate(&original, &mut code).unwrap();

            let mut data = original.clone();
            for &bit in &positions {
                data[bit / 8] ^= 0x80 >> (bit % 8);
            }
            let mut calc = vec![0u8; bch.ecc_bytes()];
            bch.calculate(&data, &mut calc).unwrap();

            let count = bch.correct(&mut data, &code, &calc).unwrap();
            prop_assert_eq!(count as usize, positions.len());
            prop_assert_eq!(data, original);
        }
    }
}
