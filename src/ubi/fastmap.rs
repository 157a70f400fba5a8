//! Fastmap: a snapshot of the attach info stored on the device itself, so attaching does not
//! have to read every PEB.
//!
//! The anchor PEB (volume `UBI_FM_SB_VOLUME_ID`) lives within the first `fm_max_start` PEBs and
//! holds the super block, which lists the PEBs the rest of the fastmap occupies. Concatenated,
//! their data areas hold:
//!
//! ```text
//! super block | header | pool | wl pool | free ECs | used ECs | scrub ECs | erase ECs |
//!     (volume header | EBA table) * vol_count
//! ```
//!
//! PEBs in the two pools may have been written after the fastmap was, so they are scanned like
//! any other PEB and win over what the fastmap says.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use deku::prelude::*;

use super::attach::{AttachInfo, AttachLeb, AttachVolume, LebOutcome, PebId, PebList};
use super::headers::*;
use super::io::{HeaderStatus, Medium, ReadStatus, UbiIo};
use crate::error::{self, Error};

pub const UBI_FM_SB_MAGIC: u32 = 0x7B11_D69F;
pub const UBI_FM_HDR_MAGIC: u32 = 0xD4B8_2EF7;
pub const UBI_FM_VHDR_MAGIC: u32 = 0xFA37_0ED1;
pub const UBI_FM_POOL_MAGIC: u32 = 0x67AF_4D08;
pub const UBI_FM_EBA_MAGIC: u32 = 0xF0C0_40A8;
pub const UBI_FM_FMT_VERSION: u8 = 2;

/// PEBs one fastmap may span
pub const UBI_FM_MAX_BLOCKS: usize = 32;

/// PEBs one pool may list
pub const UBI_FM_MAX_POOL_SIZE: usize = 256;

/// Volume types as fastmap records them
const FM_DYNAMIC_VOLUME: u8 = 3;
const FM_STATIC_VOLUME: u8 = 4;

/// EBA entry of an unmapped LEB
const FM_UNMAPPED: u32 = u32::MAX;

/// Byte offset of `data_crc` within the super block
const FM_SB_CRC_OFFSET: usize = 8;

#[derive(Debug, PartialEq, Eq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmSb {
    pub magic: u32,
    pub version: u8,
    pub padding1: [u8; 3],
    pub data_crc: u32,
    pub used_blocks: u32,
    pub block_loc: [u32; UBI_FM_MAX_BLOCKS],
    pub block_ec: [u32; UBI_FM_MAX_BLOCKS],
    pub sqnum: u64,
    pub padding2: [u8; 32],
}

#[derive(Debug, PartialEq, Eq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmHdr {
    pub magic: u32,
    pub free_peb_count: u32,
    pub used_peb_count: u32,
    pub scrub_peb_count: u32,
    pub bad_peb_count: u32,
    pub erase_peb_count: u32,
    pub vol_count: u32,
    pub padding: [u8; 4],
}

#[derive(Debug, PartialEq, Eq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmScanPool {
    pub magic: u32,
    pub size: u16,
    pub max_size: u16,
    pub pebs: [u32; UBI_FM_MAX_POOL_SIZE],
    pub padding: [u32; 4],
}

#[derive(Debug, PartialEq, Eq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmEc {
    pub pnum: u32,
    pub ec: u32,
}

#[derive(Debug, PartialEq, Eq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmVolhdr {
    pub magic: u32,
    pub vol_id: u32,
    pub vol_type: u8,
    pub padding1: [u8; 3],
    pub data_pad: u32,
    pub used_ebs: u32,
    pub last_eb_bytes: u32,
    pub padding2: [u8; 8],
}

#[derive(Debug, PartialEq, Eq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FmEba {
    pub magic: u32,
    pub reserved_pebs: u32,
    #[deku(count = "reserved_pebs")]
    pub pnum: Vec<u32>,
}

impl FmScanPool {
    fn new(pebs: &[u32]) -> Self {
        let mut pool = Self {
            magic: UBI_FM_POOL_MAGIC,
            size: pebs.len() as u16,
            max_size: UBI_FM_MAX_POOL_SIZE as u16,
            pebs: [0; UBI_FM_MAX_POOL_SIZE],
            padding: [0; 4],
        };
        pool.pebs[..pebs.len()].copy_from_slice(pebs);
        pool
    }

    fn members(&self) -> &[u32] {
        &self.pebs[..usize::from(self.size)]
    }
}

/// What looking for a fastmap found
#[derive(Debug)]
pub enum FastmapScan {
    Attached(AttachInfo),

    /// No anchor; the scan should simply carry on
    NoFastmap,

    /// A fastmap is present but cannot be trusted
    Bad,
}

/// Why a fastmap was rejected. These are not errors: the caller falls back to a full scan.
struct Rejected;

type FmResult<T> = std::result::Result<T, Rejected>;

fn reject<T>(why: std::fmt::Arguments) -> error::Result<FmResult<T>> {
    log::warn!("bad fastmap: {why}");
    Ok(Err(Rejected))
}

/// Parse one structure off the front of `rest`
fn take<'a, T: DekuContainerRead<'a>>(rest: &mut &'a [u8]) -> Option<T> {
    match T::from_bytes((*rest, 0)) {
        Ok(((tail, _), value)) => {
            *rest = tail;
            Some(value)
        }
        Err(e) => {
            log::debug!("fastmap parse error: {e}");
            None
        }
    }
}

fn take_ecs(count: u32, rest: &mut &[u8]) -> Option<Vec<FmEc>> {
    (0..count).map(|_| take::<FmEc>(rest)).collect()
}

/// A PEB that is part of the fastmap itself
struct FmBlock {
    pnum: u32,
    ec: u64,
    vid: Vid,
}

/// Find the newest fastmap anchor among the PEBs `scan_ai` has seen and attach from it
pub(crate) fn scan_fastmap<M: Medium>(
    io: &mut UbiIo<M>,
    scan_ai: &AttachInfo,
) -> error::Result<FastmapScan> {
    let anchor = scan_ai
        .fastmap
        .iter()
        .map(|&id| scan_ai.peb(id))
        .filter(|r| r.vol_id == Some(UBI_FM_SB_VOLUME_ID))
        .max_by_key(|r| r.sqnum);
    let Some(anchor) = anchor else {
        log::debug!("no fastmap found");
        return Ok(FastmapScan::NoFastmap);
    };

    if io.geometry().max_lebs_per_peb != 1 {
        log::warn!("fastmap cannot describe consolidated PEBs, ignoring it");
        return Ok(FastmapScan::Bad);
    }

    Ok(match read_fastmap(io, scan_ai, anchor.pnum)? {
        Ok(ai) => {
            log::info!("attached by fastmap, anchor at PEB {}", anchor.pnum);
            FastmapScan::Attached(ai)
        }
        Err(Rejected) => FastmapScan::Bad,
    })
}

/// Read a fastmap block's headers and data, appending the data to `blob`
fn read_block<M: Medium>(
    io: &mut UbiIo<M>,
    index: usize,
    pnum: u32,
    image_seq: Option<u32>,
    blob: &mut Vec<u8>,
) -> error::Result<FmResult<FmBlock>> {
    if pnum >= io.geometry().peb_count {
        return reject(format_args!("fastmap block #{index} at PEB {pnum} is out of range"));
    }

    let (ec_status, ech) = io.read_ec_hdr(pnum)?;
    let Some(ech) = ech.filter(|_| ec_status.is_valid()) else {
        return reject(format_args!("unable to read fastmap block #{index} EC (PEB {pnum})"));
    };
    if image_seq.is_some_and(|seq| seq != ech.image_seq) {
        return reject(format_args!("fastmap block #{index} has a foreign image_seq"));
    }

    let (vid_status, vids) = io.read_vid_hdrs(pnum)?;
    let expected = if index == 0 {
        UBI_FM_SB_VOLUME_ID
    } else {
        UBI_FM_DATA_VOLUME_ID
    };
    let vid = match (vid_status, vids.first()) {
        // A bit-flip in the anchor means the whole fastmap is suspect
        (HeaderStatus::BitFlips, _) if index == 0 => {
            return reject(format_args!("anchor PEB {pnum} was read with bit-flips"))
        }
        (status, Some(vid)) if status.is_valid() && vid.vol_id == expected => *vid,
        _ => {
            return reject(format_args!(
                "unable to read fastmap block #{index} VID header (PEB {pnum})"
            ))
        }
    };

    let leb_size = io.geometry().leb_size;
    let start = blob.len();
    blob.try_reserve(leb_size)?;
    blob.resize(start + leb_size, 0);
    if io.read_data(pnum, 0, 0, &mut blob[start..])? == ReadStatus::Uncorrectable {
        return reject(format_args!("unable to read fastmap block #{index} data (PEB {pnum})"));
    }

    Ok(Ok(FmBlock {
        pnum,
        ec: ech.ec,
        vid,
    }))
}

/// Read and verify the fastmap anchored at `anchor`, and build the attach info it describes
fn read_fastmap<M: Medium>(
    io: &mut UbiIo<M>,
    scan_ai: &AttachInfo,
    anchor: u32,
) -> error::Result<FmResult<AttachInfo>> {
    let geo = *io.geometry();

    let mut first = Vec::new();
    let Ok(block) = read_block(io, 0, anchor, None, &mut first)? else {
        return Ok(Err(Rejected));
    };
    let Some(sb) = take::<FmSb>(&mut first.as_slice()) else {
        return reject(format_args!("unreadable super block in PEB {anchor}"));
    };
    if sb.magic != UBI_FM_SB_MAGIC {
        return reject(format_args!("super block magic {:#x}", sb.magic));
    }
    if sb.version != UBI_FM_FMT_VERSION {
        return reject(format_args!("unsupported fastmap version {}", sb.version));
    }
    let used_blocks = sb.used_blocks as usize;
    if used_blocks == 0 || used_blocks > UBI_FM_MAX_BLOCKS || sb.block_loc[0] != anchor {
        return reject(format_args!("bad block list in super block"));
    }

    let (_, anchor_ec) = io.read_ec_hdr(anchor)?;
    let image_seq = anchor_ec.map(|ec| ec.image_seq);

    let mut blob = Vec::new();
    blob.try_reserve(used_blocks * geo.leb_size)?;
    let mut blocks = vec![block];
    blob.extend_from_slice(&first);
    for (index, &pnum) in sb.block_loc.iter().enumerate().take(used_blocks).skip(1) {
        let Ok(block) = read_block(io, index, pnum, image_seq, &mut blob)? else {
            return Ok(Err(Rejected));
        };
        blocks.push(block);
    }

    let mut zeroed = blob.clone();
    zeroed[FM_SB_CRC_OFFSET..FM_SB_CRC_OFFSET + 4].fill(0);
    let crc = UBI_CRC.checksum(&zeroed);
    if crc != sb.data_crc {
        return reject(format_args!(
            "data CRC is invalid: calculated {crc:#010x}, stored {:#010x}",
            sb.data_crc
        ));
    }

    let mut ai = AttachInfo::new();
    ai.from_fastmap = true;
    ai.image_seq = image_seq.unwrap_or_default();
    ai.max_sqnum = sb.sqnum;

    let mut rest = blob.as_slice();
    let _ = take::<FmSb>(&mut rest);
    match build(io, &mut ai, &mut rest, blocks, scan_ai)? {
        Ok(()) => Ok(Ok(ai)),
        Err(Rejected) => Ok(Err(Rejected)),
    }
}

/// Claim `pnum` for one place in the attach info; every PEB may be claimed once
fn claim(claimed: &mut BTreeSet<u32>, pnum: u32, peb_count: u32) -> bool {
    pnum < peb_count && claimed.insert(pnum)
}

fn build<M: Medium>(
    io: &mut UbiIo<M>,
    ai: &mut AttachInfo,
    rest: &mut &[u8],
    blocks: Vec<FmBlock>,
    scan_ai: &AttachInfo,
) -> error::Result<FmResult<()>> {
    let peb_count = io.geometry().peb_count;
    let mut claimed = BTreeSet::new();

    let Some(hdr) = take::<FmHdr>(rest).filter(|h| h.magic == UBI_FM_HDR_MAGIC) else {
        return reject(format_args!("bad fastmap header"));
    };
    let total = u64::from(hdr.free_peb_count)
        + u64::from(hdr.used_peb_count)
        + u64::from(hdr.scrub_peb_count)
        + u64::from(hdr.erase_peb_count);
    if total > u64::from(peb_count) {
        return reject(format_args!("fastmap lists {total} PEBs, device has {peb_count}"));
    }

    let mut pools = Vec::new();
    for _ in 0..2 {
        match take::<FmScanPool>(rest) {
            Some(pool)
                if pool.magic == UBI_FM_POOL_MAGIC
                    && pool.size <= pool.max_size
                    && usize::from(pool.max_size) <= UBI_FM_MAX_POOL_SIZE =>
            {
                pools.push(pool)
            }
            _ => return reject(format_args!("bad fastmap pool")),
        }
    }

    let (Some(free), Some(used), Some(scrub), Some(erase)) = (
        take_ecs(hdr.free_peb_count, rest),
        take_ecs(hdr.used_peb_count, rest),
        take_ecs(hdr.scrub_peb_count, rest),
        take_ecs(hdr.erase_peb_count, rest),
    ) else {
        return reject(format_args!("truncated EC lists"));
    };

    for (list, entries) in [(PebList::Free, &free), (PebList::Erase, &erase)] {
        for entry in entries {
            if !claim(&mut claimed, entry.pnum, peb_count) {
                return reject(format_args!("PEB {} listed twice", entry.pnum));
            }
            ai.add_to_list(list, entry.pnum, Some(u64::from(entry.ec)), None, false)?;
            ai.account_ec(u64::from(entry.ec));
        }
    }

    // PEBs holding LEBs; the EBA tables say which
    let mut in_use: BTreeMap<u32, (u64, bool)> = BTreeMap::new();
    for (entries, scrub) in [(&used, false), (&scrub, true)] {
        for entry in entries {
            in_use.insert(entry.pnum, (u64::from(entry.ec), scrub));
        }
    }

    let mut leb_pebs: BTreeMap<u32, PebId> = BTreeMap::new();
    for _ in 0..hdr.vol_count {
        let Some(vh) = take::<FmVolhdr>(rest).filter(|v| v.magic == UBI_FM_VHDR_MAGIC) else {
            return reject(format_args!("bad volume header"));
        };
        let vol_type = match vh.vol_type {
            FM_DYNAMIC_VOLUME => VolType::Dynamic,
            FM_STATIC_VOLUME => VolType::Static,
            other => return reject(format_args!("bad volume type {other}")),
        };
        let Some(eba) = take::<FmEba>(rest).filter(|e| e.magic == UBI_FM_EBA_MAGIC) else {
            return reject(format_args!("bad EBA table for volume {}", vh.vol_id));
        };
        if ai.volumes.contains_key(&vh.vol_id) {
            return reject(format_args!("volume {} described twice", vh.vol_id));
        }

        let mut av = AttachVolume {
            vol_id: vh.vol_id,
            vol_type,
            used_ebs: vh.used_ebs,
            data_pad: vh.data_pad,
            compat: if vh.vol_id == UBI_LAYOUT_VOLUME_ID {
                UBI_COMPAT_REJECT
            } else {
                0
            },
            highest_lnum: 0,
            last_data_size: vh.last_eb_bytes,
            lebs: BTreeMap::new(),
        };

        for (lnum, &pnum) in eba.pnum.iter().enumerate() {
            if pnum == FM_UNMAPPED {
                continue;
            }
            let lnum = lnum as u32;
            let Some((ec, scrub)) = in_use.remove(&pnum) else {
                return reject(format_args!("PEB {pnum} is in EBA but not in used list"));
            };
            if !claim(&mut claimed, pnum, peb_count) {
                return reject(format_args!("PEB {pnum} listed twice"));
            }

            let id = ai.alloc_peb(pnum, Some(ec))?;
            let record = ai.peb_mut(id);
            record.scrub = scrub;
            record.vol_id = Some(vh.vol_id);
            record.lnum = Some(lnum);
            record.live_lebs = 1;
            ai.account_ec(ec);
            leb_pebs.insert(pnum, id);

            av.lebs.insert(
                lnum,
                AttachLeb {
                    peb: id,
                    lnum,
                    sqnum: 0,
                    copy_flag: false,
                    slot: 0,
                },
            );
            av.highest_lnum = lnum;
        }
        ai.volumes.insert(vh.vol_id, av);
    }

    for (pnum, (ec, _)) in in_use {
        log::warn!("PEB {pnum} is in the used list but holds no LEB, will erase it");
        if !claim(&mut claimed, pnum, peb_count) {
            return reject(format_args!("PEB {pnum} listed twice"));
        }
        ai.add_to_list(PebList::Erase, pnum, Some(ec), None, false)?;
        ai.account_ec(ec);
    }

    for pool in &pools {
        for &pnum in pool.members() {
            if scan_pool_peb(io, ai, pnum, &mut claimed, &mut leb_pebs)?.is_err() {
                return Ok(Err(Rejected));
            }
        }
    }

    let current: BTreeSet<u32> = blocks.iter().map(|b| b.pnum).collect();
    for block in &blocks {
        if !claim(&mut claimed, block.pnum, peb_count) {
            return reject(format_args!("fastmap PEB {} is also listed", block.pnum));
        }
        ai.add_fastmap(block.pnum, Some(block.ec), &block.vid)?;
        ai.account_ec(block.ec);
        ai.max_sqnum = ai.max_sqnum.max(block.vid.sqnum);
    }

    // Older fastmaps found by the scan are garbage now
    for &id in &scan_ai.fastmap {
        let old = scan_ai.peb(id);
        if current.contains(&old.pnum) || !claim(&mut claimed, old.pnum, peb_count) {
            continue;
        }
        log::debug!("old fastmap PEB {} will be erased", old.pnum);
        ai.add_to_list(PebList::Erase, old.pnum, old.ec, None, false)?;
        if let Some(ec) = old.ec {
            ai.account_ec(ec);
        }
    }

    for pnum in 0..peb_count {
        if claimed.contains(&pnum) {
            continue;
        }
        if io.is_bad(pnum)? {
            ai.bad.push(pnum);
            ai.bad_peb_count += 1;
        } else {
            return reject(format_args!("PEB {pnum} is not referenced"));
        }
    }

    if ai.ec_count > 0 {
        ai.mean_ec = ai.ec_sum / u64::from(ai.ec_count);
    }
    Ok(Ok(()))
}

/// Scan a PEB the fastmap lists in a pool, and let what it holds override the fastmap
fn scan_pool_peb<M: Medium>(
    io: &mut UbiIo<M>,
    ai: &mut AttachInfo,
    pnum: u32,
    claimed: &mut BTreeSet<u32>,
    leb_pebs: &mut BTreeMap<u32, PebId>,
) -> error::Result<FmResult<()>> {
    let peb_count = io.geometry().peb_count;
    let (ec_status, ech) = io.read_ec_hdr(pnum)?;
    let Some(ech) = ech.filter(|_| ec_status.is_valid()) else {
        return reject(format_args!("bad EC header in pool PEB {pnum}"));
    };
    if ech.image_seq != ai.image_seq {
        return reject(format_args!("pool PEB {pnum} has a foreign image_seq"));
    }
    let ec = ech.ec;

    let (vid_status, vids) = io.read_vid_hdrs(pnum)?;
    let scrub = ec_status == HeaderStatus::BitFlips
        || matches!(
            vid_status,
            HeaderStatus::BitFlips | HeaderStatus::EmptyBitFlips
        );

    match vid_status {
        HeaderStatus::Empty | HeaderStatus::EmptyBitFlips => {
            log::debug!("adding pool PEB {pnum} to free");
            let id = match leb_pebs.remove(&pnum) {
                Some(id) => {
                    ai.unmap_peb(pnum);
                    let record = ai.peb_mut(id);
                    record.vol_id = None;
                    record.lnum = None;
                    id
                }
                None => {
                    if !claim(claimed, pnum, peb_count) {
                        return reject(format_args!("pool PEB {pnum} listed twice"));
                    }
                    let id = ai.alloc_peb(pnum, Some(ec))?;
                    ai.account_ec(ec);
                    id
                }
            };
            let record = ai.peb_mut(id);
            record.ec = Some(ec);
            record.scrub = scrub;
            ai.push(PebList::Free, id, false)?;
        }
        HeaderStatus::Ok | HeaderStatus::BitFlips => {
            let Some(&vid) = vids.first() else {
                return reject(format_args!("pool PEB {pnum} has no LEBs"));
            };
            if !ai.volumes.contains_key(&vid.vol_id) {
                return reject(format_args!("orphaned volume {} in pool PEB {pnum}", vid.vol_id));
            }

            if let Some(&id) = leb_pebs.get(&pnum) {
                // Already where the fastmap put it
                if ai.leb(vid.vol_id, vid.lnum).map(|(leb, _)| leb.peb) == Some(id) {
                    return Ok(Ok(()));
                }
                return reject(format_args!("pool PEB {pnum} holds a LEB the EBA disagrees with"));
            }
            if !claim(claimed, pnum, peb_count) {
                return reject(format_args!("pool PEB {pnum} listed twice"));
            }

            let id = ai.alloc_peb(pnum, Some(ec))?;
            ai.account_ec(ec);
            if let LebOutcome::Lost { corrupted } = ai.add_to_volume(io, id, &vid, scrub)? {
                ai.demote(id, corrupted)?;
            }
        }
        HeaderStatus::BadHdr | HeaderStatus::BadHdrEbadmsg => {
            return reject(format_args!("fastmap pool contains damaged PEB {pnum}"));
        }
    }

    Ok(Ok(()))
}

fn to_bytes<T: DekuContainerWrite>(value: &T, out: &mut Vec<u8>) -> anyhow::Result<()> {
    out.extend_from_slice(&value.to_bytes()?);
    Ok(())
}

fn fm_ec(ai: &AttachInfo, id: PebId) -> FmEc {
    let record = ai.peb(id);
    FmEc {
        pnum: record.pnum,
        ec: record.ec.unwrap_or(ai.mean_ec) as u32,
    }
}

/// Serialize `ai` as a fastmap into `blocks` (the first becomes the anchor), listing `pool` as
/// PEBs to be scanned on the next attach.
///
/// This is what a clean detach leaves behind. The blocks are erased and get fresh EC and VID
/// headers; they and the pool members are left out of the lists.
pub fn write_fastmap<M: Medium>(
    io: &mut UbiIo<M>,
    ai: &AttachInfo,
    blocks: &[u32],
    pool: &[u32],
    sqnum: u64,
) -> error::Result<()> {
    let geo = *io.geometry();
    if blocks.is_empty() || blocks.len() > UBI_FM_MAX_BLOCKS {
        return Err(Error::InvalidConfig(format!(
            "a fastmap spans 1 to {UBI_FM_MAX_BLOCKS} PEBs, not {}",
            blocks.len()
        )));
    }
    if pool.len() > UBI_FM_MAX_POOL_SIZE {
        return Err(Error::InvalidConfig(format!(
            "a fastmap pool holds at most {UBI_FM_MAX_POOL_SIZE} PEBs"
        )));
    }
    if geo.max_lebs_per_peb != 1 {
        return Err(Error::InvalidConfig(
            "fastmap cannot describe consolidated PEBs".into(),
        ));
    }
    if !ai.corr.is_empty() || !ai.alien.is_empty() {
        return Err(Error::InvalidConfig(
            "fastmap cannot describe corrupted or alien PEBs".into(),
        ));
    }

    let skip: BTreeSet<u32> = blocks.iter().chain(pool).copied().collect();
    let listed = |lists: &[&VecDeque<PebId>]| -> Vec<FmEc> {
        lists
            .iter()
            .flat_map(|list| list.iter())
            .map(|&id| fm_ec(ai, id))
            .filter(|e| !skip.contains(&e.pnum))
            .collect()
    };

    let free = listed(&[&ai.free, &ai.handed_out]);
    let erase = listed(&[&ai.erase, &ai.fastmap]);

    let (mut used, mut scrub) = (Vec::new(), Vec::new());
    for av in ai.volumes.values() {
        for leb in av.lebs.values() {
            let entry = fm_ec(ai, leb.peb);
            if skip.contains(&entry.pnum) || used.contains(&entry) || scrub.contains(&entry) {
                continue;
            }
            if ai.peb(leb.peb).scrub {
                scrub.push(entry);
            } else {
                used.push(entry);
            }
        }
    }

    let mut blob = Vec::new();
    let block_ecs: Vec<u64> = blocks
        .iter()
        .map(|&pnum| {
            ai.pebs()
                .iter()
                .find(|r| r.pnum == pnum)
                .and_then(|r| r.ec)
                .unwrap_or(ai.mean_ec)
                + 1
        })
        .collect();

    let mut sb = FmSb {
        magic: UBI_FM_SB_MAGIC,
        version: UBI_FM_FMT_VERSION,
        padding1: [0; 3],
        data_crc: 0,
        used_blocks: blocks.len() as u32,
        block_loc: [0; UBI_FM_MAX_BLOCKS],
        block_ec: [0; UBI_FM_MAX_BLOCKS],
        sqnum,
        padding2: [0; 32],
    };
    sb.block_loc[..blocks.len()].copy_from_slice(blocks);
    for (slot, &ec) in sb.block_ec.iter_mut().zip(&block_ecs) {
        *slot = ec as u32;
    }
    to_bytes(&sb, &mut blob)?;

    let hdr = FmHdr {
        magic: UBI_FM_HDR_MAGIC,
        free_peb_count: free.len() as u32,
        used_peb_count: used.len() as u32,
        scrub_peb_count: scrub.len() as u32,
        bad_peb_count: ai.bad_peb_count,
        erase_peb_count: erase.len() as u32,
        vol_count: ai.volumes.len() as u32,
        padding: [0; 4],
    };
    to_bytes(&hdr, &mut blob)?;
    to_bytes(&FmScanPool::new(pool), &mut blob)?;
    to_bytes(&FmScanPool::new(&[]), &mut blob)?;
    for entry in free.iter().chain(&used).chain(&scrub).chain(&erase) {
        to_bytes(entry, &mut blob)?;
    }

    for av in ai.volumes.values() {
        let vh = FmVolhdr {
            magic: UBI_FM_VHDR_MAGIC,
            vol_id: av.vol_id,
            vol_type: match av.vol_type {
                VolType::Dynamic => FM_DYNAMIC_VOLUME,
                VolType::Static => FM_STATIC_VOLUME,
            },
            padding1: [0; 3],
            data_pad: av.data_pad,
            used_ebs: av.used_ebs,
            last_eb_bytes: av.last_data_size,
            padding2: [0; 8],
        };
        to_bytes(&vh, &mut blob)?;

        let reserved = av.lebs.keys().last().map_or(0, |&lnum| lnum + 1);
        let mut eba = vec![FM_UNMAPPED; reserved as usize];
        for (&lnum, leb) in &av.lebs {
            let pnum = ai.peb(leb.peb).pnum;
            if !skip.contains(&pnum) {
                eba[lnum as usize] = pnum;
            }
        }
        let eba = FmEba {
            magic: UBI_FM_EBA_MAGIC,
            reserved_pebs: reserved,
            pnum: eba,
        };
        to_bytes(&eba, &mut blob)?;
    }

    let size = blocks.len() * geo.leb_size;
    if blob.len() > size {
        return Err(Error::InvalidConfig(format!(
            "fastmap needs {} bytes, {} PEBs hold {size}",
            blob.len(),
            blocks.len()
        )));
    }
    blob.resize(size, 0);
    let crc = UBI_CRC.checksum(&blob);
    blob[FM_SB_CRC_OFFSET..FM_SB_CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());

    for (index, ((&pnum, &ec), chunk)) in blocks
        .iter()
        .zip(&block_ecs)
        .zip(blob.chunks(geo.leb_size))
        .enumerate()
    {
        io.sync_erase(pnum)?;
        io.write_ec_hdr(pnum, ec, ai.image_seq)?;
        let vid = Vid {
            vol_id: if index == 0 {
                UBI_FM_SB_VOLUME_ID
            } else {
                UBI_FM_DATA_VOLUME_ID
            },
            lnum: index as u32,
            compat: UBI_COMPAT_DELETE,
            sqnum: sqnum + index as u64,
            ..Default::default()
        };
        io.write_vid_hdrs(pnum, &[vid])?;
        io.write_data(pnum, 0, chunk)?;
    }

    log::info!(
        "fastmap written to PEBs {blocks:?}: {} free, {} used, {} scrub, {} erase, {} volumes",
        free.len(),
        used.len(),
        scrub.len(),
        erase.len(),
        ai.volumes.len()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ubi::attach::{attach, AttachConfig};
    use crate::ubi::io::test::MemMedium;
    use crate::ubi::io::Geometry;

    const PEBS: u32 = 32;

    fn config(fastmap: bool) -> AttachConfig {
        AttachConfig {
            fastmap,
            self_check: true,
            ..Default::default()
        }
    }

    /// A formatted device with volume 1, LEBs 0..=3 in PEBs 5..=8
    fn device() -> anyhow::Result<UbiIo<MemMedium>> {
        let mut io = UbiIo::new(
            MemMedium::new(PEBS, 4096, 64),
            Geometry::new(PEBS, 4096, 64, 1)?,
        );
        for pnum in 0..PEBS {
            io.write_ec_hdr(pnum, u64::from(pnum % 3), 0xC0FFEE)?;
        }
        for lnum in 0..4 {
            let pnum = 5 + lnum;
            io.write_vid_hdrs(
                pnum,
                &[Vid {
                    vol_id: 1,
                    lnum,
                    sqnum: 10 + u64::from(lnum),
                    ..Default::default()
                }],
            )?;
            io.write_data(pnum, 0, &[lnum as u8; 64])?;
        }
        Ok(io)
    }

    fn lebs(ai: &AttachInfo) -> Vec<(u32, u32)> {
        ai.volume(1)
            .into_iter()
            .flat_map(|av| av.lebs.values())
            .map(|leb| (leb.lnum, ai.peb(leb.peb).pnum))
            .collect()
    }

    #[test]
    fn test_attach_from_fastmap() -> anyhow::Result<()> {
        let mut io = device()?;
        let ai = attach(&mut io, &config(false))?;
        write_fastmap(&mut io, &ai, &[0], &[], ai.max_sqnum + 1)?;

        let fm_ai = attach(&mut io, &config(true))?;
        assert!(fm_ai.from_fastmap);
        assert_eq!(lebs(&fm_ai), lebs(&ai));
        assert_eq!(fm_ai.leb(1, 2).map(|(leb, _)| leb.sqnum), Some(0));
        assert_eq!(fm_ai.pnums(PebList::Fastmap), [0]);
        assert_eq!(fm_ai.free.len(), PEBS as usize - 5);
        assert_eq!(fm_ai.image_seq, 0xC0FFEE);
        assert_eq!(fm_ai.max_sqnum, ai.max_sqnum + 1);

        // The fastmap is also found (and set aside) by a full scan
        let full = attach(&mut io, &config(false))?;
        assert!(!full.from_fastmap);
        assert_eq!(full.pnums(PebList::Fastmap), [0]);
        assert_eq!(lebs(&full), lebs(&ai));
        Ok(())
    }

    #[test]
    fn test_pool_overrides_fastmap() -> anyhow::Result<()> {
        let mut io = device()?;
        let ai = attach(&mut io, &config(false))?;
        write_fastmap(&mut io, &ai, &[1], &[20, 21], 100)?;

        // After the fastmap was written, LEB 1:2 moved to PEB 20; 21 stayed empty
        io.write_vid_hdrs(
            20,
            &[Vid {
                vol_id: 1,
                lnum: 2,
                sqnum: 101,
                ..Default::default()
            }],
        )?;

        let fm_ai = attach(&mut io, &config(true))?;
        assert!(fm_ai.from_fastmap);
        assert_eq!(fm_ai.leb(1, 2).map(|(_, peb)| peb.pnum), Some(20));
        assert_eq!(fm_ai.leb(1, 2).map(|(leb, _)| leb.sqnum), Some(101));
        assert!(fm_ai.pnums(PebList::Erase).contains(&7));
        assert!(fm_ai.pnums(PebList::Free).contains(&21));
        assert_eq!(fm_ai.max_sqnum, 101);
        Ok(())
    }

    #[test]
    fn test_unreferenced_peb_rejects_fastmap() -> anyhow::Result<()> {
        let mut io = device()?;
        let mut ai = attach(&mut io, &config(false))?;
        ai.free.pop_back();
        write_fastmap(&mut io, &ai, &[0], &[], 50)?;

        let rescanned = attach(&mut io, &config(true))?;
        assert!(!rescanned.from_fastmap);
        assert_eq!(rescanned.free.len(), PEBS as usize - 5);
        Ok(())
    }

    #[test]
    fn test_corrupt_fastmap_rejected() -> anyhow::Result<()> {
        let mut io = device()?;
        let ai = attach(&mut io, &config(false))?;
        write_fastmap(&mut io, &ai, &[0], &[], 50)?;

        let leb_start = io.geometry().leb_start;
        io.medium().pebs[0][leb_start + 400] ^= 0x01;

        let rescanned = attach(&mut io, &config(true))?;
        assert!(!rescanned.from_fastmap);
        assert_eq!(lebs(&rescanned), lebs(&ai));
        Ok(())
    }

    #[test]
    fn test_no_fastmap_continues_scan() -> anyhow::Result<()> {
        let mut io = device()?;
        let fast = attach(
            &mut io,
            &AttachConfig {
                fm_max_start: 8,
                ..config(true)
            },
        )?;
        let full = attach(&mut io, &config(false))?;
        assert!(!fast.from_fastmap);
        assert_eq!(lebs(&fast), lebs(&full));
        assert_eq!(fast.pnums(PebList::Free), full.pnums(PebList::Free));
        assert_eq!(fast.ec_sum, full.ec_sum);
        Ok(())
    }

    #[test]
    fn test_write_limits() -> anyhow::Result<()> {
        let mut io = device()?;
        let ai = attach(&mut io, &config(false))?;
        assert!(write_fastmap(&mut io, &ai, &[], &[], 1).is_err());
        let too_many: Vec<u32> = (0..33).collect();
        assert!(write_fastmap(&mut io, &ai, &too_many, &[], 1).is_err());
        Ok(())
    }
}
