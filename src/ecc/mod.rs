//! Error correction for NAND pages.
//!
//! Pages are split into fixed-size steps; an [EccEngine] computes ECC bytes per step on write and
//! detects and corrects bit errors on read. The engine is wrapped around every page I/O through
//! [EccEngine::prepare_io] and [EccEngine::finish_io]:
//!
//! | engine    | mode | direction | prepare                   | finish                        |
//! |-----------|------|-----------|---------------------------|-------------------------------|
//! | any       | raw  | either    | nothing (on-die: disable) | nothing                       |
//! | external  | ecc  | read      | nothing                   | recompute, extract, correct   |
//! | external  | ecc  | write     | compute, place in OOB     | nothing                       |
//! | pipelined | ecc  | read      | enable engine             | disable engine, read status   |
//! | pipelined | ecc  | write     | enable engine             | disable engine                |
//! | on-die    | ecc  | read      | enable on-die ECC         | read status                   |
//! | on-die    | ecc  | write     | enable on-die ECC         | nothing                       |

use crate::error::{Error, Result};

pub mod bch;
mod hw;
mod ooblayout;
mod sw_bch;

pub use hw::{EccHardware, OnDieEngine, PipelinedEngine};
pub use ooblayout::{
    get_ecc_bytes, set_ecc_bytes, LargePageLayout, OobLayout, OobRegion, SmallPageLayout,
    StandardLayout,
};
pub use sw_bch::SwBchEngine;

/// Where the ECC computation happens
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineType {
    /// In software, or in a controller block that is not in the data path
    External,

    /// In the controller, on the data as it streams past
    Pipelined,

    /// Inside the NAND chip itself
    OnDie,
}

/// Whether a page operation goes through ECC at all
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EccMode {
    Raw,
    Ecc,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// One page I/O, as seen by the ECC engine
#[derive(Debug)]
pub struct PageRequest<'a> {
    pub mode: EccMode,
    pub direction: Direction,

    /// The page's main data area
    pub data: &'a mut [u8],

    /// The page's out-of-band area
    pub oob: &'a mut [u8],
}

/// Outcome of decoding one page
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EccStatus {
    Clean,

    /// Every step decoded; the worst step needed this many corrections
    Corrected { max_bitflips: u32 },

    /// At least one step could not be decoded
    Uncorrectable,
}

/// Running counters, per engine
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct EccStats {
    /// Bits corrected
    pub corrected: u64,

    /// Steps that failed to decode
    pub failed: u64,
}

/// Requested ECC parameters
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EccConfig {
    /// Bytes of data per ECC step
    pub step_size: usize,

    /// Bit errors to correct per step
    pub strength: u32,

    /// Corrections per step at which a read reports bit-flips; defaults to 3/4 of the strength
    pub bitflip_threshold: Option<u32>,
}

impl Default for EccConfig {
    fn default() -> Self {
        Self {
            step_size: 512,
            strength: 4,
            bitflip_threshold: None,
        }
    }
}

impl EccConfig {
    /// The bit-flip threshold for an engine that ended up with `strength`
    pub fn threshold_for(&self, strength: u32) -> u32 {
        self.bitflip_threshold
            .unwrap_or_else(|| (3 * strength).div_ceil(4))
    }
}

/// A page-level ECC engine
pub trait EccEngine {
    fn engine_type(&self) -> EngineType;

    fn step_size(&self) -> usize;

    /// Correctable bits per step
    fn strength(&self) -> u32;

    /// Max corrections per step before a read should be reported as having bit-flips
    fn bitflip_threshold(&self) -> u32 {
        (3 * self.strength()).div_ceil(4)
    }

    fn stats(&self) -> EccStats;

    /// Where ECC bytes live in the OOB, for engines that place them there
    fn ooblayout(&self) -> Option<&dyn OobLayout> {
        None
    }

    /// Called before the page is transferred
    fn prepare_io(&mut self, req: &mut PageRequest<'_>) -> Result<()>;

    /// Called after the page is transferred; reads report what decoding found
    fn finish_io(&mut self, req: &mut PageRequest<'_>) -> Result<EccStatus>;
}

/// What a controller's ECC block can do: parallel lists of strengths and the OOB bytes one step
/// of that strength consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwEccCaps {
    pub strengths: Vec<u32>,
    pub spare_sizes: Vec<usize>,
}

impl Default for HwEccCaps {
    fn default() -> Self {
        Self {
            strengths: vec![4, 8, 40, 48],
            spare_sizes: vec![32, 32, 96, 96],
        }
    }
}

/// A strength picked by [tune_hw_strength]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HwEccChoice {
    pub strength: u32,
    pub spare_size: usize,
    pub steps: usize,
}

/// Pick the controller strength closest to `requested` whose spare bytes fit in the OOB,
/// stepping down from the first supported strength that meets the request.
pub fn tune_hw_strength(
    caps: &HwEccCaps,
    page_size: usize,
    oob_size: usize,
    step_size: usize,
    requested: u32,
) -> Result<HwEccChoice> {
    if caps.strengths.is_empty() || caps.strengths.len() != caps.spare_sizes.len() {
        return Err(Error::InvalidConfig(
            "hardware ECC capabilities are malformed".into(),
        ));
    }
    if step_size == 0 || page_size % step_size != 0 {
        return Err(Error::InvalidConfig(format!(
            "step size {step_size} does not divide page size {page_size}"
        )));
    }
    let steps = page_size / step_size;

    let start = caps
        .strengths
        .iter()
        .position(|&s| s >= requested)
        .unwrap_or(caps.strengths.len() - 1);

    let idx = (0..=start)
        .rev()
        .find(|&i| caps.spare_sizes[i] * steps <= oob_size)
        .ok_or_else(|| {
            Error::InvalidConfig(format!(
                "no ECC strength fits {steps} steps in {oob_size} OOB bytes"
            ))
        })?;

    if caps.strengths[idx] != requested {
        log::info!(
            "ECC strength {requested} adjusted to {} ({steps} steps of {step_size} bytes)",
            caps.strengths[idx]
        );
    }

    Ok(HwEccChoice {
        strength: caps.strengths[idx],
        spare_size: caps.spare_sizes[idx],
        steps,
    })
}

#[test]
fn test_tune_falls_back() -> anyhow::Result<()> {
    let choice = tune_hw_strength(&HwEccCaps::default(), 2048, 64, 1024, 40)?;
    assert_eq!(
        choice,
        HwEccChoice {
            strength: 8,
            spare_size: 32,
            steps: 2
        }
    );
    Ok(())
}

#[test]
fn test_tune_exact_and_limits() -> anyhow::Result<()> {
    let caps = HwEccCaps::default();
    assert_eq!(tune_hw_strength(&caps, 2048, 224, 1024, 40)?.strength, 40);
    assert_eq!(tune_hw_strength(&caps, 2048, 256, 1024, 1)?.strength, 4);
    assert_eq!(tune_hw_strength(&caps, 2048, 512, 1024, 100)?.strength, 48);
    assert!(tune_hw_strength(&caps, 2048, 32, 512, 4).is_err());
    assert!(tune_hw_strength(&caps, 2048, 64, 1000, 4).is_err());
    Ok(())
}

#[test]
fn test_threshold() {
    let config = EccConfig::default();
    assert_eq!(config.threshold_for(4), 3);
    assert_eq!(config.threshold_for(8), 6);
    assert_eq!(config.threshold_for(5), 4);

    let config = EccConfig {
        bitflip_threshold: Some(1),
        ..Default::default()
    };
    assert_eq!(config.threshold_for(8), 1);
}
