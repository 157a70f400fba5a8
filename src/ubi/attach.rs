//! The attach info: everything a scan of the device learned, ready to be handed to the
//! wear-leveler and EBA initializers.
//!
//! PEB records live in one arena and are referred to by [PebId]. Every record is in exactly one
//! place: one of the lists (free, erase, corr, alien, fastmap, handed out), or referenced by the
//! LEB(s) it holds in a volume. Bad PEBs have no record; they are kept by number in
//! [AttachInfo::bad].

use std::collections::{BTreeMap, VecDeque};

use bitflags::bitflags;
use rand::Rng;

use super::headers::*;
use super::io::{HeaderStatus, Medium, ReadStatus, UbiIo};
use super::{check, fastmap, scan};
use crate::error::{Error, Result};

/// Index of a [PebRecord] in its [AttachInfo]
pub type PebId = usize;

/// What attach knows about one physical eraseblock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PebRecord {
    pub pnum: u32,

    /// Erase counter; `None` until late analysis fills in the mean for unreadable EC headers
    pub ec: Option<u64>,

    /// Bit-flips were seen; the contents should be moved and the PEB erased
    pub scrub: bool,

    /// Volume, LEB and sequence number of the (first) VID header seen, if any
    pub vol_id: Option<u32>,
    pub lnum: Option<u32>,
    pub sqnum: u64,

    /// LEBs currently held by this PEB
    pub live_lebs: u32,
}

/// One LEB of a volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachLeb {
    pub peb: PebId,
    pub lnum: u32,
    pub sqnum: u64,
    pub copy_flag: bool,

    /// Data slot within the PEB
    pub slot: u32,
}

/// Everything attach learned about one volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachVolume {
    pub vol_id: u32,
    pub vol_type: VolType,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub compat: u8,
    pub highest_lnum: u32,

    /// `data_size` of the VID header of the highest LEB
    pub last_data_size: u32,

    pub lebs: BTreeMap<u32, AttachLeb>,
}

impl AttachVolume {
    fn new(vid: &Vid) -> Self {
        Self {
            vol_id: vid.vol_id,
            vol_type: vid.vol_type,
            used_ebs: vid.used_ebs,
            data_pad: vid.data_pad,
            compat: vid.compat,
            highest_lnum: 0,
            last_data_size: 0,
            lebs: BTreeMap::new(),
        }
    }

    /// Every VID header of a volume must agree with the first one seen
    fn validate(&self, vid: &Vid, pnum: u32) -> Result<()> {
        let field = if vid.vol_type != self.vol_type {
            "vol_type"
        } else if vid.used_ebs != self.used_ebs {
            "used_ebs"
        } else if vid.data_pad != self.data_pad {
            "data_pad"
        } else if vid.compat != self.compat {
            "compat"
        } else {
            return Ok(());
        };

        log::error!("inconsistent VID header at PEB {pnum}: {vid:?}");
        Err(Error::Inconsistent(format!(
            "inconsistent {field} in VID header of PEB {pnum}, volume {}",
            self.vol_id
        )))
    }
}

/// The lists a PEB record can be placed on
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PebList {
    /// Erased, with a valid EC header, ready for use
    Free,

    /// Must be erased before use
    Erase,

    /// Unexpectedly corrupted; preserved for inspection
    Corr,

    /// Belongs to an internal volume this implementation does not know, and must be preserved
    Alien,

    /// Holds a fastmap
    Fastmap,

    /// Given out by [AttachInfo::early_get_peb]
    HandedOut,
}

bitflags! {
    /// The result of [compare_lebs]
    pub struct LebComparison: u8 {
        /// The second (newly found) copy wins
        const SECOND_NEWER = 1;
        /// The winner was read with bit-flips
        const BITFLIPS = 2;
        /// The loser failed its data CRC
        const CORRUPTED = 4;
    }
}

/// What happened to a LEB offered to [AttachInfo::add_to_volume]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LebOutcome {
    Attached,

    /// An existing copy won; `corrupted` if this copy failed its data CRC
    Lost { corrupted: bool },
}

/// How attach goes about its work
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AttachConfig {
    /// Try to attach from a fastmap before scanning everything
    pub fastmap: bool,

    /// PEBs scanned for a fastmap anchor
    pub fm_max_start: u32,

    /// Re-read and verify everything after attaching
    pub self_check: bool,

    /// Scan every PEB even if fastmap is enabled
    pub force_scan: bool,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            fastmap: true,
            fm_max_start: 64,
            self_check: false,
            force_scan: false,
        }
    }
}

/// The complete logical state of a device, as found on media
#[derive(Debug, Clone, Default)]
pub struct AttachInfo {
    pebs: Vec<PebRecord>,

    pub volumes: BTreeMap<u32, AttachVolume>,

    pub free: VecDeque<PebId>,
    pub erase: VecDeque<PebId>,
    pub corr: VecDeque<PebId>,
    pub alien: VecDeque<PebId>,
    pub fastmap: VecDeque<PebId>,
    pub handed_out: VecDeque<PebId>,

    /// Numbers of PEBs the medium reports bad
    pub bad: Vec<u32>,

    pub bad_peb_count: u32,
    pub corr_peb_count: u32,
    pub empty_peb_count: u32,
    pub maybe_bad_peb_count: u32,
    pub alien_peb_count: u32,

    pub ec_sum: u64,
    pub ec_count: u32,
    pub mean_ec: u64,
    pub min_ec: u64,
    pub max_ec: u64,
    pub max_sqnum: u64,

    pub image_seq: u32,

    /// Nothing but erased PEBs were found
    pub is_empty: bool,

    /// A read-only compatible internal volume was found
    pub ro_mode: bool,

    /// Fastmap must not be trusted on this attach
    pub force_full_scan: bool,

    /// This attach info was built from a fastmap rather than a full scan
    pub from_fastmap: bool,
}

impl AttachInfo {
    pub fn new() -> Self {
        Self {
            min_ec: UBI_MAX_ERASECOUNTER,
            ..Default::default()
        }
    }

    pub fn peb(&self, id: PebId) -> &PebRecord {
        &self.pebs[id]
    }

    pub(crate) fn peb_mut(&mut self, id: PebId) -> &mut PebRecord {
        &mut self.pebs[id]
    }

    /// All PEB records, in allocation order
    pub fn pebs(&self) -> &[PebRecord] {
        &self.pebs
    }

    pub fn list(&self, list: PebList) -> &VecDeque<PebId> {
        match list {
            PebList::Free => &self.free,
            PebList::Erase => &self.erase,
            PebList::Corr => &self.corr,
            PebList::Alien => &self.alien,
            PebList::Fastmap => &self.fastmap,
            PebList::HandedOut => &self.handed_out,
        }
    }

    fn list_mut(&mut self, list: PebList) -> &mut VecDeque<PebId> {
        match list {
            PebList::Free => &mut self.free,
            PebList::Erase => &mut self.erase,
            PebList::Corr => &mut self.corr,
            PebList::Alien => &mut self.alien,
            PebList::Fastmap => &mut self.fastmap,
            PebList::HandedOut => &mut self.handed_out,
        }
    }

    /// PEB numbers on `list`, in list order
    pub fn pnums(&self, list: PebList) -> Vec<u32> {
        self.list(list)
            .iter()
            .map(|&id| self.pebs[id].pnum)
            .collect()
    }

    pub fn volume(&self, vol_id: u32) -> Option<&AttachVolume> {
        self.volumes.get(&vol_id)
    }

    /// The LEB `vol_id:lnum` and the PEB holding it
    pub fn leb(&self, vol_id: u32, lnum: u32) -> Option<(&AttachLeb, &PebRecord)> {
        let leb = self.volumes.get(&vol_id)?.lebs.get(&lnum)?;
        Some((leb, &self.pebs[leb.peb]))
    }

    /// Allocate a record without placing it anywhere
    pub(crate) fn alloc_peb(&mut self, pnum: u32, ec: Option<u64>) -> Result<PebId> {
        self.pebs.try_reserve(1)?;
        self.pebs.push(PebRecord {
            pnum,
            ec,
            scrub: false,
            vol_id: None,
            lnum: None,
            sqnum: 0,
            live_lebs: 0,
        });
        Ok(self.pebs.len() - 1)
    }

    /// Place a record on a list; `to_head` puts it first in line
    pub(crate) fn push(&mut self, list: PebList, id: PebId, to_head: bool) -> Result<()> {
        log::debug!(
            "add to {list:?}: PEB {}, EC {:?}",
            self.pebs[id].pnum,
            self.pebs[id].ec
        );
        if list == PebList::Alien {
            self.alien_peb_count += 1;
        }

        let list = self.list_mut(list);
        list.try_reserve(1)?;
        if to_head {
            list.push_front(id);
        } else {
            list.push_back(id);
        }
        Ok(())
    }

    /// Allocate a record for `pnum` and place it on `list`
    pub(crate) fn add_to_list(
        &mut self,
        list: PebList,
        pnum: u32,
        ec: Option<u64>,
        vid: Option<&Vid>,
        to_head: bool,
    ) -> Result<PebId> {
        let id = self.alloc_peb(pnum, ec)?;
        if let Some(vid) = vid {
            let record = &mut self.pebs[id];
            record.vol_id = Some(vid.vol_id);
            record.lnum = Some(vid.lnum);
            record.sqnum = vid.sqnum;
        }
        self.push(list, id, to_head)?;
        Ok(id)
    }

    /// Preserve an unexpectedly corrupted PEB
    pub(crate) fn add_corrupted(&mut self, pnum: u32, ec: Option<u64>) -> Result<PebId> {
        self.corr_peb_count += 1;
        self.add_to_list(PebList::Corr, pnum, ec, None, false)
    }

    /// A fastmap PEB: candidates for the anchor, or old fastmaps to be erased
    pub(crate) fn add_fastmap(&mut self, pnum: u32, ec: Option<u64>, vid: &Vid) -> Result<PebId> {
        self.add_to_list(PebList::Fastmap, pnum, ec, Some(vid), false)
    }

    /// Count a known erase counter towards the mean
    pub(crate) fn account_ec(&mut self, ec: u64) {
        self.ec_sum += ec;
        self.ec_count += 1;
        self.max_ec = self.max_ec.max(ec);
        self.min_ec = self.min_ec.min(ec);
    }

    /// One LEB held by `id` lost to a newer copy; when it was the last, demote the PEB
    pub(crate) fn release(&mut self, id: PebId, corrupted: bool) -> Result<()> {
        let record = &mut self.pebs[id];
        record.live_lebs = record.live_lebs.saturating_sub(1);
        if record.live_lebs > 0 {
            return Ok(());
        }
        self.demote(id, corrupted)
    }

    /// Place a PEB that holds no live LEBs: erase it, or keep it if it is corrupted
    pub(crate) fn demote(&mut self, id: PebId, corrupted: bool) -> Result<()> {
        if corrupted {
            self.corr_peb_count += 1;
            self.push(PebList::Corr, id, false)
        } else {
            self.push(PebList::Erase, id, false)
        }
    }

    /// Attach the LEB described by `vid`, held by the PEB `id`, to its volume.
    ///
    /// If the LEB is already known, the two copies are compared and the older is released.
    pub(crate) fn add_to_volume<M: Medium>(
        &mut self,
        io: &mut UbiIo<M>,
        id: PebId,
        vid: &Vid,
        bitflips: bool,
    ) -> Result<LebOutcome> {
        let pnum = self.pebs[id].pnum;
        let (vol_id, lnum, sqnum) = (vid.vol_id, vid.lnum, vid.sqnum);
        log::debug!("PEB {pnum}, LEB {vol_id}:{lnum}, sqnum {sqnum}, bitflips {bitflips}");

        if self.pebs[id].vol_id.is_none() {
            let record = &mut self.pebs[id];
            record.vol_id = Some(vol_id);
            record.lnum = Some(lnum);
            record.sqnum = sqnum;
        }

        if !self.volumes.contains_key(&vol_id) {
            log::debug!("added volume {vol_id}");
        }
        let av = self
            .volumes
            .entry(vol_id)
            .or_insert_with(|| AttachVolume::new(vid));

        // Every copy must agree with the volume, including one that is about to lose
        av.validate(vid, pnum)?;
        self.max_sqnum = self.max_sqnum.max(sqnum);

        let existing = av.lebs.get(&lnum).cloned();
        let Some(existing) = existing else {
            av.lebs.insert(
                lnum,
                AttachLeb {
                    peb: id,
                    lnum,
                    sqnum,
                    copy_flag: vid.copy_flag,
                    slot: vid.slot(),
                },
            );
            if av.highest_lnum <= lnum {
                av.highest_lnum = lnum;
                av.last_data_size = vid.data_size;
            }

            let record = &mut self.pebs[id];
            record.live_lebs += 1;
            record.scrub |= bitflips;
            return Ok(LebOutcome::Attached);
        };

        let old_pnum = self.pebs[existing.peb].pnum;
        log::debug!(
            "this LEB already exists: PEB {old_pnum}, sqnum {}, EC {:?}",
            existing.sqnum,
            self.pebs[existing.peb].ec
        );

        if existing.sqnum == sqnum && sqnum != 0 {
            log::error!("two LEBs with same sequence number {sqnum}");
            return Err(Error::DuplicateSqnum {
                vol_id,
                lnum,
                pnum_a: old_pnum,
                pnum_b: pnum,
                sqnum,
            });
        }

        let cmp = compare_lebs(io, &existing, old_pnum, pnum, vid)?;
        if !cmp.contains(LebComparison::SECOND_NEWER) {
            return Ok(LebOutcome::Lost {
                corrupted: cmp.contains(LebComparison::CORRUPTED),
            });
        }

        // The new copy wins
        if let Some(av) = self.volumes.get_mut(&vol_id) {
            av.lebs.insert(
                lnum,
                AttachLeb {
                    peb: id,
                    lnum,
                    sqnum,
                    copy_flag: vid.copy_flag,
                    slot: vid.slot(),
                },
            );
            if av.highest_lnum == lnum {
                av.last_data_size = vid.data_size;
            }
        }

        let record = &mut self.pebs[id];
        record.live_lebs += 1;
        record.scrub = cmp.contains(LebComparison::BITFLIPS) || bitflips;

        self.release(existing.peb, cmp.contains(LebComparison::CORRUPTED))?;
        Ok(LebOutcome::Attached)
    }

    /// Detach every LEB held by `pnum` (it was found erased after all), returning its record
    pub(crate) fn unmap_peb(&mut self, pnum: u32) -> Option<PebId> {
        let mut found = None;
        let pebs = &self.pebs;
        for av in self.volumes.values_mut() {
            av.lebs.retain(|_, leb| {
                if pebs[leb.peb].pnum == pnum {
                    found = Some(leb.peb);
                    false
                } else {
                    true
                }
            });
            av.highest_lnum = av.lebs.keys().last().copied().unwrap_or(0);
        }
        if let Some(id) = found {
            self.pebs[id].live_lebs = 0;
        }
        found
    }

    /// Compute the mean erase counter, check the result is plausible, and fill in unknown ECs
    pub(crate) fn finish_scan(&mut self, peb_count: u32) -> Result<()> {
        if self.ec_count > 0 {
            self.mean_ec = self.ec_sum / u64::from(self.ec_count);
        }

        self.late_analysis(peb_count)?;

        let mean_ec = self.mean_ec;
        for record in self.pebs.iter_mut().filter(|r| r.ec.is_none()) {
            record.ec = Some(mean_ec);
        }

        log::info!(
            "scanned {peb_count} PEBs: {} volumes, {} free, {} to erase, {} corrupted, {} bad, \
             mean EC {}, max sqnum {}",
            self.volumes.len(),
            self.free.len(),
            self.erase.len(),
            self.corr.len(),
            self.bad_peb_count,
            self.mean_ec,
            self.max_sqnum,
        );
        Ok(())
    }

    /// Decide whether the scan found a usable UBI image
    fn late_analysis(&mut self, peb_count: u32) -> Result<()> {
        let peb_count = peb_count
            .saturating_sub(self.bad_peb_count)
            .saturating_sub(self.alien_peb_count);
        let max_corr = std::cmp::max(peb_count / 20, 8);

        if self.corr_peb_count > 0 {
            log::error!(
                "{} PEBs are corrupted and preserved: {:?}",
                self.corr_peb_count,
                self.pnums(PebList::Corr)
            );
            if self.corr_peb_count >= max_corr {
                log::error!("too many corrupted PEBs, refusing");
                return Err(Error::TooManyCorruptPebs {
                    corrupted: self.corr_peb_count,
                    limit: max_corr,
                });
            }
        }

        if self.empty_peb_count + self.maybe_bad_peb_count == peb_count {
            if self.maybe_bad_peb_count <= 2 {
                self.is_empty = true;
                self.image_seq = rand::thread_rng().gen_range(1..=u32::MAX);
                log::info!("empty device detected");
            } else {
                log::error!(
                    "device is not UBI-formatted and possibly contains non-UBI data - refusing it"
                );
                return Err(Error::NotUbiFormatted);
            }
        }

        Ok(())
    }

    /// Get a PEB that is known good and erased, with a fresh EC header, during attach.
    ///
    /// Free PEBs go first; otherwise PEBs on the erase list are erased in turn until one works.
    pub fn early_get_peb<M: Medium>(&mut self, io: &mut UbiIo<M>) -> Result<PebId> {
        if let Some(id) = self.free.pop_front() {
            log::debug!(
                "return free PEB {}, EC {:?}",
                self.pebs[id].pnum,
                self.pebs[id].ec
            );
            self.push(PebList::HandedOut, id, false)?;
            return Ok(id);
        }

        let mut index = 0;
        while let Some(&id) = self.erase.get(index) {
            let pnum = self.pebs[id].pnum;
            let ec = self.pebs[id].ec.unwrap_or(self.mean_ec);
            self.pebs[id].ec = Some(ec);

            let new_ec = ec + 1;
            if new_ec >= UBI_MAX_ERASECOUNTER {
                log::error!("erase counter overflow at PEB {pnum}, EC {new_ec}");
                return Err(Error::EcOverflow { pnum, ec: new_ec });
            }

            let image_seq = self.image_seq;
            match io
                .sync_erase(pnum)
                .and_then(|()| io.write_ec_hdr(pnum, new_ec, image_seq))
            {
                Ok(()) => {
                    self.erase.remove(index);
                    self.pebs[id].ec = Some(new_ec);
                    self.pebs[id].scrub = false;
                    log::debug!("return PEB {pnum}, EC {new_ec}");
                    self.push(PebList::HandedOut, id, false)?;
                    return Ok(id);
                }
                Err(e) => {
                    log::warn!("cannot prepare PEB {pnum}: {e}");
                    index += 1;
                }
            }
        }

        log::error!("no free eraseblocks");
        Err(Error::NoSpace)
    }
}

/// Decide which of two copies of one LEB is authoritative.
///
/// `existing` is the copy already attached, held by `pnum_a`; `vid_b` is the newly found copy in
/// `pnum_b`. The copy with the higher sequence number wins unless it was written as a copy and its
/// data fails the CRC check, in which case the older copy wins.
pub fn compare_lebs<M: Medium>(
    io: &mut UbiIo<M>,
    existing: &AttachLeb,
    pnum_a: u32,
    pnum_b: u32,
    vid_b: &Vid,
) -> Result<LebComparison> {
    let sqnum_b = vid_b.sqnum;
    if sqnum_b == existing.sqnum {
        // Only images from before sequence numbers get here, and only after an unclean reboot.
        log::error!("unsupported on-flash UBI format");
        return Err(Error::AncientUnclean {
            vol_id: vid_b.vol_id,
            lnum: vid_b.lnum,
        });
    }

    let mut second_is_newer = sqnum_b > existing.sqnum;
    let mut result = LebComparison::empty();

    let (pnum, vid) = if second_is_newer {
        if !vid_b.copy_flag {
            log::debug!("second PEB {pnum_b} is newer, copy_flag is unset");
            return Ok(LebComparison::SECOND_NEWER);
        }
        (pnum_b, *vid_b)
    } else {
        if !existing.copy_flag {
            log::debug!("first PEB {pnum_a} is newer, copy_flag is unset");
            return Ok(result);
        }

        let (status, vids) = io.read_vid_hdrs(pnum_a)?;
        let vid = vids
            .into_iter()
            .find(|v| v.vol_id == vid_b.vol_id && v.lnum == vid_b.lnum)
            .filter(|_| status.is_valid())
            .ok_or_else(|| {
                log::error!("VID header of PEB {pnum_a} is bad, but it was OK earlier");
                Error::Inconsistent(format!("VID header of PEB {pnum_a} went bad during attach"))
            })?;
        if status == HeaderStatus::BitFlips {
            result |= LebComparison::BITFLIPS;
        }
        (pnum_a, vid)
    };

    let mut data = Vec::new();
    data.try_reserve_exact(vid.data_size as usize)?;
    data.resize(vid.data_size as usize, 0);
    let read = io.read_data(pnum, vid.slot(), 0, &mut data)?;

    let crc = UBI_CRC.checksum(&data);
    if crc != vid.data_crc {
        log::debug!(
            "PEB {pnum} CRC error: calculated {crc:#010x}, must be {:#010x}",
            vid.data_crc
        );
        result = LebComparison::CORRUPTED;
        second_is_newer = !second_is_newer;
    } else {
        log::debug!("PEB {pnum} CRC is OK");
        if read != ReadStatus::Clean {
            result |= LebComparison::BITFLIPS;
        }
    }

    if second_is_newer {
        log::debug!("second PEB {pnum_b} is newer, copy_flag is set");
        result |= LebComparison::SECOND_NEWER;
    } else {
        log::debug!("first PEB {pnum_a} is newer, copy_flag is set");
    }
    Ok(result)
}

/// Build the attach info of the device behind `io`.
///
/// With fastmap enabled, the first `fm_max_start` PEBs are scanned for a fastmap anchor. If a
/// valid fastmap is found it is used; if none is found the scan simply continues over the rest of
/// the device; if one is found but cannot be trusted, everything is scanned again from scratch.
pub fn attach<M: Medium>(io: &mut UbiIo<M>, config: &AttachConfig) -> Result<AttachInfo> {
    let peb_count = io.geometry().peb_count;

    let ai = if config.force_scan || !config.fastmap {
        scan::scan_all(io, AttachInfo::new(), 0)?
    } else {
        let fm_start = config.fm_max_start.min(peb_count);
        let mut scan_ai = AttachInfo::new();
        for pnum in 0..fm_start {
            scan::scan_peb(io, &mut scan_ai, pnum, true)?;
        }

        if scan_ai.force_full_scan {
            log::warn!("damaged VID header found while looking for fastmap, scanning everything");
            scan::scan_all(io, scan_ai, fm_start)?
        } else {
            match fastmap::scan_fastmap(io, &scan_ai)? {
                fastmap::FastmapScan::Attached(ai) => ai,
                fastmap::FastmapScan::NoFastmap => scan::scan_all(io, scan_ai, fm_start)?,
                fastmap::FastmapScan::Bad => {
                    log::warn!("fastmap is unusable, scanning everything");
                    scan::scan_all(io, AttachInfo::new(), 0)?
                }
            }
        }
    };

    if config.self_check {
        check::self_check_ai(io, &ai)?;
    }

    Ok(ai)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ubi::io::test::MemMedium;
    use crate::ubi::io::Geometry;

    const PEB_SIZE: usize = 4096;
    const MIN_IO: usize = 64;

    fn io(peb_count: u32) -> UbiIo<MemMedium> {
        let geometry = Geometry::new(peb_count, PEB_SIZE, MIN_IO, 1).unwrap();
        UbiIo::new(MemMedium::new(peb_count, PEB_SIZE, MIN_IO), geometry)
    }

    fn config() -> AttachConfig {
        AttachConfig {
            fastmap: false,
            self_check: true,
            ..Default::default()
        }
    }

    /// Write a PEB holding LEB `vol_id:lnum` with `data`
    fn write_leb(
        io: &mut UbiIo<MemMedium>,
        pnum: u32,
        ec: u64,
        vid: Vid,
        data: &[u8],
    ) -> anyhow::Result<()> {
        io.write_ec_hdr(pnum, ec, 0x5EED)?;
        io.write_vid_hdrs(pnum, &[vid])?;
        if !data.is_empty() {
            io.write_data(pnum, 0, data)?;
        }
        Ok(())
    }

    fn format_free(io: &mut UbiIo<MemMedium>, ec: u64) -> anyhow::Result<()> {
        for pnum in 0..io.geometry().peb_count {
            io.write_ec_hdr(pnum, ec, 0x5EED)?;
        }
        Ok(())
    }

    fn vid(vol_id: u32, lnum: u32, sqnum: u64) -> Vid {
        Vid {
            vol_id,
            lnum,
            sqnum,
            ..Default::default()
        }
    }

    fn copied(vol_id: u32, lnum: u32, sqnum: u64, data: &[u8], data_crc: u32) -> Vid {
        Vid {
            copy_flag: true,
            data_size: data.len() as u32,
            data_crc,
            ..vid(vol_id, lnum, sqnum)
        }
    }

    #[test]
    fn test_empty_device() -> anyhow::Result<()> {
        let mut io = io(128);
        let ai = attach(&mut io, &config())?;

        assert!(ai.is_empty);
        assert_eq!(ai.ec_count, 0);
        assert_eq!(ai.mean_ec, 0);
        assert!(ai.volumes.is_empty());
        assert_eq!(ai.erase.len(), 128);
        assert_eq!(ai.pnums(PebList::Erase), (0..128).collect::<Vec<_>>());
        assert_ne!(ai.image_seq, 0);
        assert!(ai.pebs().iter().all(|r| r.ec == Some(0)));
        Ok(())
    }

    #[test]
    fn test_newer_copy_wins() -> anyhow::Result<()> {
        let mut io = io(32);
        format_free(&mut io, 3)?;
        io.medium().pebs[10].fill(0xFF);
        io.medium().pebs[12].fill(0xFF);
        write_leb(&mut io, 10, 3, vid(7, 3, 100), &[])?;
        write_leb(&mut io, 12, 3, vid(7, 3, 200), &[])?;

        let ai = attach(&mut io, &config())?;
        let av = ai.volume(7).unwrap();
        assert_eq!(av.highest_lnum, 3);
        assert_eq!(ai.leb(7, 3).map(|(_, peb)| peb.pnum), Some(12));
        assert_eq!(ai.pnums(PebList::Erase), [10]);
        assert_eq!(ai.free.len(), 30);
        assert_eq!(ai.max_sqnum, 200);
        Ok(())
    }

    #[test]
    fn test_copy_with_good_crc() -> anyhow::Result<()> {
        let mut io = io(32);
        format_free(&mut io, 1)?;
        let data = vec![0x5Au8; 300];
        let crc = UBI_CRC.checksum(&data);

        io.medium().pebs[10].fill(0xFF);
        io.medium().pebs[12].fill(0xFF);
        let older = Vid {
            data_crc: 0x1234,
            ..vid(7, 3, 100)
        };
        write_leb(&mut io, 10, 1, older, &data)?;
        write_leb(&mut io, 12, 1, copied(7, 3, 200, &data, crc), &data)?;

        let ai = attach(&mut io, &config())?;
        assert_eq!(ai.leb(7, 3).map(|(_, peb)| peb.pnum), Some(12));
        assert_eq!(ai.pnums(PebList::Erase), [10]);
        assert!(ai.corr.is_empty());
        Ok(())
    }

    #[test]
    fn test_copy_with_bad_crc() -> anyhow::Result<()> {
        let mut io = io(32);
        format_free(&mut io, 1)?;
        let data = vec![0x5Au8; 300];
        let crc = UBI_CRC.checksum(&data);

        io.medium().pebs[10].fill(0xFF);
        io.medium().pebs[12].fill(0xFF);
        write_leb(&mut io, 10, 1, vid(7, 3, 100), &data)?;
        write_leb(&mut io, 12, 1, copied(7, 3, 200, &data, crc ^ 1), &data)?;

        let ai = attach(&mut io, &config())?;
        assert_eq!(ai.leb(7, 3).map(|(_, peb)| peb.pnum), Some(10));
        assert_eq!(ai.pnums(PebList::Corr), [12]);
        assert!(ai.erase.is_empty());
        assert_eq!(ai.corr_peb_count, 1);
        Ok(())
    }

    #[test]
    fn test_order_does_not_matter() -> anyhow::Result<()> {
        // Same as above, but the copy is found first
        let mut io = io(32);
        format_free(&mut io, 1)?;
        let data = vec![0x77u8; 64];
        let crc = UBI_CRC.checksum(&data);

        io.medium().pebs[4].fill(0xFF);
        io.medium().pebs[9].fill(0xFF);
        write_leb(&mut io, 4, 1, copied(2, 0, 50, &data, crc ^ 1), &data)?;
        write_leb(&mut io, 9, 1, vid(2, 0, 20), &data)?;

        let ai = attach(&mut io, &config())?;
        assert_eq!(ai.leb(2, 0).map(|(_, peb)| peb.pnum), Some(9));
        assert_eq!(ai.pnums(PebList::Corr), [4]);
        Ok(())
    }

    #[test]
    fn test_duplicate_sqnum() -> anyhow::Result<()> {
        let mut io = io(16);
        write_leb(&mut io, 1, 0, vid(0, 0, 9), &[])?;
        write_leb(&mut io, 2, 0, vid(0, 0, 9), &[])?;

        assert!(matches!(
            attach(&mut io, &config()),
            Err(Error::DuplicateSqnum {
                pnum_a: 1,
                pnum_b: 2,
                sqnum: 9,
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_ancient_unclean() -> anyhow::Result<()> {
        let mut io = io(16);
        write_leb(&mut io, 1, 0, vid(0, 0, 0), &[])?;
        write_leb(&mut io, 2, 0, vid(0, 0, 0), &[])?;

        assert!(matches!(
            attach(&mut io, &config()),
            Err(Error::AncientUnclean { vol_id: 0, lnum: 0 })
        ));
        Ok(())
    }

    #[test]
    fn test_inconsistent_volume() -> anyhow::Result<()> {
        let mut io = io(16);
        write_leb(&mut io, 1, 0, vid(4, 0, 1), &[])?;
        let other = Vid {
            data_pad: 64,
            ..vid(4, 1, 2)
        };
        write_leb(&mut io, 2, 0, other, &[])?;

        assert!(matches!(
            attach(&mut io, &config()),
            Err(Error::Inconsistent(_))
        ));
        Ok(())
    }

    #[test]
    fn test_inconsistent_stale_copy() -> anyhow::Result<()> {
        // The older copy loses the comparison but still disagrees with its volume
        let mut io = io(16);
        write_leb(&mut io, 1, 0, vid(4, 0, 9), &[])?;
        let stale = Vid {
            data_pad: 64,
            ..vid(4, 0, 3)
        };
        write_leb(&mut io, 2, 0, stale, &[])?;

        assert!(matches!(
            attach(&mut io, &config()),
            Err(Error::Inconsistent(_))
        ));
        Ok(())
    }

    #[test]
    fn test_mean_ec_for_unknown() -> anyhow::Result<()> {
        let mut io = io(16);
        format_free(&mut io, 0)?;
        for (pnum, ec) in [(0u32, 10u64), (1, 20), (2, 31)] {
            io.medium().pebs[pnum as usize].fill(0xFF);
            io.write_ec_hdr(pnum, ec, 0x5EED)?;
        }
        // PEB 5: EC header damaged, VID header intact
        io.medium().pebs[5].fill(0xFF);
        write_leb(&mut io, 5, 7, vid(1, 0, 5), &[])?;
        io.medium().pebs[5][20] ^= 0x01;

        let ai = attach(&mut io, &config())?;
        assert_eq!(ai.ec_count, 15);
        assert_eq!(ai.mean_ec, 61 / 15);
        let (_, peb) = ai.leb(1, 0).unwrap();
        assert_eq!(peb.ec, Some(ai.mean_ec));
        Ok(())
    }

    #[test]
    fn test_bad_and_corrupted() -> anyhow::Result<()> {
        let mut io = io(40);
        format_free(&mut io, 2)?;
        io.medium().bad.insert(3);

        // Valid EC, garbage VID and data: unexpected corruption
        io.medium().pebs[7][MIN_IO..MIN_IO + 4].copy_from_slice(b"junk");
        io.medium().pebs[7][2 * MIN_IO] = 0;

        // Valid EC, garbage VID, erased data: interrupted erase
        io.medium().pebs[8][MIN_IO..MIN_IO + 4].copy_from_slice(b"junk");

        let ai = attach(&mut io, &config())?;
        assert_eq!(ai.bad, [3]);
        assert_eq!(ai.bad_peb_count, 1);
        assert_eq!(ai.pnums(PebList::Corr), [7]);
        assert_eq!(ai.pnums(PebList::Erase), [8]);
        assert_eq!(ai.free.len(), 37);
        Ok(())
    }

    #[test]
    fn test_too_many_corrupted() -> anyhow::Result<()> {
        let mut io = io(40);
        format_free(&mut io, 2)?;
        for pnum in 0..8 {
            io.medium().pebs[pnum][MIN_IO..MIN_IO + 4].copy_from_slice(b"junk");
            io.medium().pebs[pnum][2 * MIN_IO] = 0;
        }

        assert!(matches!(
            attach(&mut io, &config()),
            Err(Error::TooManyCorruptPebs {
                corrupted: 8,
                limit: 8
            })
        ));
        Ok(())
    }

    #[test]
    fn test_not_ubi() -> anyhow::Result<()> {
        let mut io = io(16);
        for pnum in 0..4 {
            io.medium().fault(pnum, 0, PEB_SIZE, ReadStatus::Uncorrectable);
            io.medium().pebs[pnum as usize][..4].copy_from_slice(b"FAT ");
        }

        assert!(matches!(
            attach(&mut io, &config()),
            Err(Error::NotUbiFormatted)
        ));
        Ok(())
    }

    #[test]
    fn test_image_seq_mismatch() -> anyhow::Result<()> {
        let mut io = io(16);
        io.write_ec_hdr(0, 1, 0x1111)?;
        io.write_ec_hdr(1, 1, 0)?;
        io.write_ec_hdr(2, 1, 0x2222)?;

        assert!(matches!(
            attach(&mut io, &config()),
            Err(Error::Inconsistent(_))
        ));
        Ok(())
    }

    #[test]
    fn test_ec_overflow() -> anyhow::Result<()> {
        let mut io = io(16);
        io.write_ec_hdr(4, UBI_MAX_ERASECOUNTER + 1, 0)?;
        assert!(matches!(
            attach(&mut io, &config()),
            Err(Error::EcOverflow { pnum: 4, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_internal_volume_compat() -> anyhow::Result<()> {
        let internal = |compat, lnum| Vid {
            compat,
            ..vid(UBI_INTERNAL_VOL_START + 10, lnum, u64::from(lnum) + 1)
        };

        let mut io = io(16);
        format_free(&mut io, 1)?;
        for pnum in [1, 2, 3] {
            io.medium().pebs[pnum].fill(0xFF);
        }
        write_leb(&mut io, 1, 1, internal(UBI_COMPAT_DELETE, 0), &[])?;
        write_leb(&mut io, 2, 1, internal(UBI_COMPAT_PRESERVE, 1), &[])?;
        write_leb(&mut io, 3, 1, internal(UBI_COMPAT_RO, 2), &[])?;

        let ai = attach(&mut io, &config())?;
        assert_eq!(ai.pnums(PebList::Erase), [1]);
        assert_eq!(ai.pnums(PebList::Alien), [2]);
        assert_eq!(ai.alien_peb_count, 1);
        assert!(ai.ro_mode);
        assert!(ai.leb(UBI_INTERNAL_VOL_START + 10, 2).is_some());

        io.medium().pebs[4].fill(0xFF);
        write_leb(&mut io, 4, 1, internal(UBI_COMPAT_REJECT, 3), &[])?;
        assert!(matches!(
            attach(&mut io, &config()),
            Err(Error::Inconsistent(_))
        ));
        Ok(())
    }

    #[test]
    fn test_early_get_peb() -> anyhow::Result<()> {
        let mut io = io(8);
        let mut ai = attach(&mut io, &config())?;
        assert_eq!(ai.erase.len(), 8);

        io.medium().failing_erase.insert(0);
        let id = ai.early_get_peb(&mut io)?;
        assert_eq!(ai.peb(id).pnum, 1);
        assert_eq!(ai.peb(id).ec, Some(1));
        assert_eq!(ai.pnums(PebList::HandedOut), [1]);
        assert_eq!(ai.erase.len(), 7);

        let (status, ec) = io.read_ec_hdr(1)?;
        assert_eq!(status, HeaderStatus::Ok);
        assert_eq!(ec.map(|x| (x.ec, x.image_seq)), Some((1, ai.image_seq)));

        for _ in 0..6 {
            ai.early_get_peb(&mut io)?;
        }
        assert!(matches!(ai.early_get_peb(&mut io), Err(Error::NoSpace)));
        Ok(())
    }

    #[test]
    fn test_early_get_prefers_free() -> anyhow::Result<()> {
        let mut io = io(8);
        format_free(&mut io, 5)?;
        let mut ai = attach(&mut io, &config())?;
        let erases = io.medium().erase_count;

        let id = ai.early_get_peb(&mut io)?;
        assert_eq!(ai.peb(id).pnum, 0);
        assert_eq!(ai.peb(id).ec, Some(5));
        assert_eq!(io.medium().erase_count, erases);
        Ok(())
    }

    #[test]
    fn test_early_get_overflow() -> anyhow::Result<()> {
        let mut io = io(8);
        io.write_ec_hdr(0, UBI_MAX_ERASECOUNTER - 1, 0)?;
        io.medium().pebs[0][MIN_IO..MIN_IO + 4].copy_from_slice(b"junk");
        let mut ai = attach(&mut io, &config())?;
        assert_eq!(ai.pnums(PebList::Erase)[0], 0);

        assert!(matches!(
            ai.early_get_peb(&mut io),
            Err(Error::EcOverflow { pnum: 0, .. })
        ));
        Ok(())
    }
}
