//! The erase map of a SPI-NOR device: up to four erase types, and the regions they apply to.
//!
//! Erase types are kept sorted by size, smallest first; region masks index into that order. Masks
//! that come from SFDP tables refer to the BFPT order instead and are translated on the way in.

use super::opcodes::CHIP_ERASE;
use crate::error::{Error, Result};

/// The most erase types a device can describe
pub const MAX_ERASE_TYPES: usize = 4;

/// One erase command and the size it erases
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EraseType {
    pub opcode: u8,
    pub size: u32,
    pub size_shift: u32,
    pub size_mask: u32,

    /// Position of this type in the BFPT, which sector map masks refer to
    pub bfpt_index: u8,
}

impl EraseType {
    /// An erase type of `size` bytes, which must be a power of two
    pub fn new(opcode: u8, size: u32, bfpt_index: u8) -> Result<Self> {
        if !size.is_power_of_two() {
            return Err(Error::Corrupt {
                what: format!("erase type {opcode:#04x} with size {size}"),
            });
        }
        Ok(Self {
            opcode,
            size,
            size_shift: size.trailing_zeros(),
            size_mask: size - 1,
            bfpt_index,
        })
    }

    fn is_aligned(&self, addr: u64) -> bool {
        addr & u64::from(self.size_mask) == 0
    }
}

/// A span of the device with a set of erase types that may be used in it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EraseRegion {
    pub offset: u64,
    pub size: u64,

    /// Bit `i` set: [EraseMap::types]`[i]` is usable here
    pub mask: u8,

    /// The region is smaller than one of its erase types, which then erases the region as a whole
    pub overlaid: bool,
}

impl EraseRegion {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// One erase operation of a plan
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EraseCmd {
    pub opcode: u8,
    pub addr: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraseMap {
    types: Vec<EraseType>,
    regions: Vec<EraseRegion>,
    uniform_mask: u8,
    device_size: u64,
    uniform: Option<usize>,
}

fn all_types(count: usize) -> u8 {
    ((1u16 << count) - 1) as u8
}

impl EraseMap {
    /// A map with one region covering `device_size` bytes, where every type is usable
    pub fn uniform(types: impl IntoIterator<Item = EraseType>, device_size: u64) -> Self {
        let mut types: Vec<_> = types.into_iter().take(MAX_ERASE_TYPES).collect();
        types.sort_by_key(|t| t.size);
        let mask = all_types(types.len());

        Self {
            types,
            regions: vec![EraseRegion {
                offset: 0,
                size: device_size,
                mask,
                overlaid: false,
            }],
            uniform_mask: mask,
            device_size,
            uniform: None,
        }
    }

    pub fn types(&self) -> &[EraseType] {
        &self.types
    }

    pub fn regions(&self) -> &[EraseRegion] {
        &self.regions
    }

    pub fn device_size(&self) -> u64 {
        self.device_size
    }

    pub fn is_uniform(&self) -> bool {
        self.regions.len() == 1
    }

    /// The erase types usable everywhere on the device
    pub fn uniform_mask(&self) -> u8 {
        self.uniform_mask
    }

    /// The erase type picked by [EraseMap::select_uniform]
    pub fn uniform_type(&self) -> Option<&EraseType> {
        self.uniform.and_then(|i| self.types.get(i))
    }

    /// Translate a mask in BFPT order into one in map order
    pub fn mask_from_bfpt(&self, bfpt_mask: u8) -> u8 {
        self.types
            .iter()
            .enumerate()
            .filter(|(_, t)| bfpt_mask & (1 << t.bfpt_index) != 0)
            .fold(0, |mask, (i, _)| mask | 1 << i)
    }

    /// Rewrite every opcode through `f`
    pub fn map_opcodes(&mut self, f: impl Fn(&EraseType) -> u8) {
        for t in self.types.iter_mut() {
            t.opcode = f(t);
        }
    }

    /// Drop the erase types `keep` rejects, fixing up every mask
    pub fn retain_types(&mut self, keep: impl Fn(&EraseType) -> bool) {
        let mut remap = [None; MAX_ERASE_TYPES];
        let mut kept = Vec::with_capacity(self.types.len());
        for (i, t) in self.types.iter().enumerate() {
            if keep(t) {
                remap[i] = Some(kept.len());
                kept.push(*t);
            }
        }

        let translate = |mask: u8| {
            remap
                .iter()
                .enumerate()
                .filter_map(|(i, new)| new.filter(|_| mask & (1 << i) != 0))
                .fold(0u8, |acc, n| acc | 1 << n)
        };
        for region in self.regions.iter_mut() {
            region.mask = translate(region.mask);
        }
        self.uniform_mask = translate(self.uniform_mask);
        self.uniform = self.uniform.and_then(|i| remap[i]);
        self.types = kept;
    }

    /// Replace the single region with the regions of a sector map
    ///
    /// `regions` are `(size, mask)` pairs in address order, with masks in BFPT order. They must
    /// exactly cover the device.
    pub fn set_regions(&mut self, regions: &[(u64, u8)]) -> Result<()> {
        let total: u64 = regions.iter().map(|&(size, _)| size).sum();
        if regions.is_empty() || total != self.device_size {
            return Err(Error::Corrupt {
                what: format!(
                    "sector map covering {total:#x} bytes of a {:#x}-byte device",
                    self.device_size
                ),
            });
        }

        let mut offset = 0;
        let mut uniform_mask = 0xFF;
        let mut union = 0;
        let mut new_regions = Vec::with_capacity(regions.len());
        for &(size, bfpt_mask) in regions {
            let mask = self.mask_from_bfpt(bfpt_mask);
            let overlaid = self
                .types
                .iter()
                .enumerate()
                .any(|(i, t)| mask & (1 << i) != 0 && size & u64::from(t.size_mask) != 0);
            new_regions.push(EraseRegion {
                offset,
                size,
                mask,
                overlaid,
            });
            uniform_mask &= mask;
            union |= mask;
            offset += size;
        }

        self.regions = new_regions;
        self.uniform_mask = uniform_mask;
        self.uniform = None;

        // Types no region may use are of no use at all
        let unused: Vec<u8> = (0..self.types.len())
            .filter(|i| union & (1 << i) == 0)
            .map(|i| self.types[i].opcode)
            .collect();
        self.retain_types(|t| !unused.contains(&t.opcode));
        Ok(())
    }

    /// Pick the erase type for uniform erases: the smallest one no smaller than `preferred`, or the
    /// biggest one if none is
    pub fn select_uniform(&mut self, preferred: Option<u32>) -> Option<&EraseType> {
        let candidates = || {
            self.types
                .iter()
                .enumerate()
                .filter(|(i, _)| self.uniform_mask & (1 << i) != 0)
        };

        self.uniform = preferred
            .and_then(|size| candidates().find(|(_, t)| t.size >= size))
            .or_else(|| candidates().last())
            .map(|(i, _)| i);
        self.uniform_type()
    }

    /// Work out the erase commands that erase exactly `len` bytes at `addr`
    pub fn plan(&self, addr: u64, len: u64) -> Result<Vec<EraseCmd>> {
        let misaligned = || Error::Misaligned { addr, len };
        let end = addr.checked_add(len).ok_or_else(misaligned)?;
        if end > self.device_size {
            return Err(Error::InvalidConfig(format!(
                "erase of {len:#x} bytes at {addr:#x} beyond device size {:#x}",
                self.device_size
            )));
        }
        if len == 0 {
            return Ok(vec![]);
        }

        if self.is_uniform() {
            if addr == 0 && len == self.device_size {
                return Ok(vec![EraseCmd {
                    opcode: CHIP_ERASE,
                    addr: 0,
                    size: len,
                }]);
            }

            let erase = self
                .uniform_type()
                .ok_or_else(|| Error::InvalidConfig("no uniform erase type".into()))?;
            if !erase.is_aligned(addr) || !erase.is_aligned(len) {
                return Err(misaligned());
            }
            let size = u64::from(erase.size);
            return Ok((0..len >> erase.size_shift)
                .map(|i| EraseCmd {
                    opcode: erase.opcode,
                    addr: addr + i * size,
                    size,
                })
                .collect());
        }

        let mut cmds = vec![];
        let mut pos = addr;
        let mut regions = self
            .regions
            .iter()
            .skip_while(|r| r.end() <= addr)
            .peekable();
        while pos < end {
            let region = regions.peek().ok_or_else(misaligned)?;
            let cmd = self.best_erase(region, pos, end - pos).ok_or_else(misaligned)?;
            pos += cmd.size;
            cmds.push(cmd);
            if pos >= region.end() {
                regions.next();
            }
        }

        Ok(cmds)
    }

    /// The biggest erase of `region` that starts at `addr` without erasing more than `remaining`
    fn best_erase(&self, region: &EraseRegion, addr: u64, remaining: u64) -> Option<EraseCmd> {
        self.types
            .iter()
            .enumerate()
            .rev()
            .filter(|(i, _)| region.mask & (1 << i) != 0)
            .find_map(|(_, t)| {
                if region.overlaid && addr == region.offset && region.size <= remaining {
                    return Some(EraseCmd {
                        opcode: t.opcode,
                        addr,
                        size: region.size,
                    });
                }
                let size = u64::from(t.size);
                (size <= remaining && t.is_aligned(addr) && addr + size <= region.end()).then_some(
                    EraseCmd {
                        opcode: t.opcode,
                        addr,
                        size,
                    },
                )
            })
    }
}
