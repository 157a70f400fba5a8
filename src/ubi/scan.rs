//! This module contains code to scan PEBs and sort them into the attach info according to their
//! EC and VID headers.

use super::attach::{AttachInfo, LebOutcome, PebList};
use super::headers::*;
use super::io::{HeaderStatus, Medium, ReadStatus, UbiIo};
use crate::error::{Error, Result};
use crate::util::PageUtil;

/// Look at the data area of a PEB whose VID header is damaged (but whose EC header is fine), and
/// decide whether the damage is an interrupted erase/write or something unexpected.
///
/// Returns `true` if the PEB must be preserved as corrupted, `false` if it may simply be erased.
pub(crate) fn check_corruption<M: Medium>(io: &mut UbiIo<M>, pnum: u32) -> Result<bool> {
    let geo = io.geometry();
    let mut buf = Vec::new();
    buf.try_reserve_exact(geo.peb_size - geo.leb_start)?;
    buf.resize(geo.peb_size - geo.leb_start, 0);

    // A power cut during erase can leave garbage that fails ECC; that is not unexpected.
    if io.read_data(pnum, 0, 0, &mut buf)? != ReadStatus::Clean {
        return Ok(false);
    }

    if buf.is_erased() {
        return Ok(false);
    }

    log::error!("PEB {pnum} contains corrupted VID header, and the data does not contain all 0xFF");
    log::error!(
        "this may be a non-UBI PEB or a severe VID header corruption which requires manual inspection"
    );
    Ok(true)
}

/// Read the headers of one PEB and file it in `ai`.
///
/// `fast` is set while looking for a fastmap: a damaged VID header then means the fastmap cannot
/// be trusted to describe this PEB.
pub(crate) fn scan_peb<M: Medium>(
    io: &mut UbiIo<M>,
    ai: &mut AttachInfo,
    pnum: u32,
    fast: bool,
) -> Result<()> {
    if io.is_bad(pnum)? {
        log::debug!("PEB {pnum} is bad");
        ai.bad_peb_count += 1;
        ai.bad.push(pnum);
        return Ok(());
    }

    let (ec_status, ech) = io.read_ec_hdr(pnum)?;
    let mut bitflips = false;
    let mut ec_err = None;
    match ec_status {
        HeaderStatus::Ok => {}
        HeaderStatus::BitFlips => bitflips = true,
        HeaderStatus::Empty | HeaderStatus::EmptyBitFlips => {
            ai.empty_peb_count += 1;
            ai.add_to_list(
                PebList::Erase,
                pnum,
                None,
                None,
                ec_status == HeaderStatus::EmptyBitFlips,
            )?;
            return Ok(());
        }
        HeaderStatus::BadHdr | HeaderStatus::BadHdrEbadmsg => {
            // The EC is lost; late analysis fills in the mean
            ec_err = Some(ec_status);
            bitflips = true;
        }
    }

    let mut ec = None;
    if let Some(hdr) = ech {
        if hdr.ec > UBI_MAX_ERASECOUNTER {
            log::error!("erase counter overflow, max is {UBI_MAX_ERASECOUNTER}");
            return Err(Error::EcOverflow { pnum, ec: hdr.ec });
        }
        ec = Some(hdr.ec);

        if ai.image_seq == 0 {
            ai.image_seq = hdr.image_seq;
        }
        if hdr.image_seq != 0 && ai.image_seq != hdr.image_seq {
            log::error!(
                "bad image sequence number {} in PEB {pnum}, expected {}",
                hdr.image_seq,
                ai.image_seq
            );
            return Err(Error::Inconsistent(format!(
                "PEB {pnum} belongs to another UBI image (image_seq {:#x}, expected {:#x})",
                hdr.image_seq, ai.image_seq
            )));
        }
    }

    let (vid_status, vids) = io.read_vid_hdrs(pnum)?;
    match vid_status {
        HeaderStatus::Ok => {}
        HeaderStatus::BitFlips => bitflips = true,
        HeaderStatus::BadHdr | HeaderStatus::BadHdrEbadmsg => {
            if vid_status == HeaderStatus::BadHdrEbadmsg
                && ec_err == Some(HeaderStatus::BadHdrEbadmsg)
            {
                // Both headers unreadable: either a bad block the medium doesn't know about, or
                // data that isn't UBI at all. Late analysis tells these apart.
                ai.maybe_bad_peb_count += 1;
            }
            if fast {
                ai.force_full_scan = true;
            }

            let corrupted = ec_err.is_none() && check_corruption(io, pnum)?;
            if corrupted {
                ai.add_corrupted(pnum, ec)?;
            } else {
                ai.add_to_list(PebList::Erase, pnum, ec, None, true)?;
            }
            account_ec(ai, ec);
            return Ok(());
        }
        HeaderStatus::EmptyBitFlips => {
            ai.add_to_list(PebList::Erase, pnum, ec, None, true)?;
            account_ec(ai, ec);
            return Ok(());
        }
        HeaderStatus::Empty => {
            if ec_err.is_some() || bitflips {
                ai.add_to_list(PebList::Erase, pnum, ec, None, true)?;
            } else {
                ai.add_to_list(PebList::Free, pnum, ec, None, false)?;
            }
            account_ec(ai, ec);
            return Ok(());
        }
    }

    let Some(first) = vids.first().copied() else {
        return Err(Error::Inconsistent(format!(
            "PEB {pnum} has a valid VID header but no LEBs"
        )));
    };

    if first.vol_id >= UBI_MAX_VOLUMES && first.vol_id != UBI_LAYOUT_VOLUME_ID {
        let (vol_id, lnum) = (first.vol_id, first.lnum);
        match first.compat {
            UBI_COMPAT_DELETE => {
                if is_fm_vol(vol_id) {
                    ai.add_fastmap(pnum, ec, &first)?;
                } else {
                    log::info!(
                        "\"delete\" compatible internal volume {vol_id}:{lnum} found, will remove it"
                    );
                    ai.add_to_list(PebList::Erase, pnum, ec, Some(&first), true)?;
                }
                return Ok(());
            }
            UBI_COMPAT_RO => {
                log::info!(
                    "read-only compatible internal volume {vol_id}:{lnum} found, switch to \
                     read-only mode"
                );
                ai.ro_mode = true;
            }
            UBI_COMPAT_PRESERVE => {
                log::info!("\"preserve\" compatible internal volume {vol_id}:{lnum} found");
                ai.add_to_list(PebList::Alien, pnum, ec, Some(&first), false)?;
                return Ok(());
            }
            _ => {
                log::error!("incompatible internal volume {vol_id}:{lnum} found");
                return Err(Error::Inconsistent(format!(
                    "incompatible internal volume {vol_id} in PEB {pnum}"
                )));
            }
        }
    }

    if ec_err.is_some() {
        log::warn!("valid VID header but corrupted EC header at PEB {pnum}");
    }

    let id = ai.alloc_peb(pnum, ec)?;
    let mut lost_corrupted = false;
    for vid in &vids {
        if let LebOutcome::Lost { corrupted } = ai.add_to_volume(io, id, vid, bitflips)? {
            lost_corrupted |= corrupted;
        }
    }

    // Every LEB here lost to a newer copy elsewhere
    if ai.peb(id).live_lebs == 0 {
        ai.demote(id, lost_corrupted)?;
    }

    account_ec(ai, ec);
    Ok(())
}

fn account_ec(ai: &mut AttachInfo, ec: Option<u64>) {
    if let Some(ec) = ec {
        ai.account_ec(ec);
    }
}

/// Scan PEBs `start..` into `ai`, then run late analysis over the result
pub(crate) fn scan_all<M: Medium>(
    io: &mut UbiIo<M>,
    mut ai: AttachInfo,
    start: u32,
) -> Result<AttachInfo> {
    let peb_count = io.geometry().peb_count;
    let rpt = howudoin::new()
        .label("Scanning PEBs")
        .set_len(u64::from(peb_count.saturating_sub(start)));

    for pnum in start..peb_count {
        scan_peb(io, &mut ai, pnum, false)?;
        rpt.inc();
    }

    rpt.close();

    ai.finish_scan(peb_count)?;
    Ok(ai)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ubi::io::test::MemMedium;
    use crate::ubi::io::Geometry;

    fn io() -> anyhow::Result<UbiIo<MemMedium>> {
        Ok(UbiIo::new(
            MemMedium::new(16, 4096, 64),
            Geometry::new(16, 4096, 64, 1)?,
        ))
    }

    #[test]
    fn test_scan_peb() -> anyhow::Result<()> {
        let mut io = io()?;
        let mut ai = AttachInfo::new();

        // 0: erased, 1: EC only, 2: in use, 3: bad, 4: EC + VID read with bit-flips
        io.write_ec_hdr(1, 3, 0)?;
        io.write_ec_hdr(2, 4, 0)?;
        let vid = Vid {
            vol_id: 2,
            lnum: 1,
            sqnum: 12,
            ..Default::default()
        };
        io.write_vid_hdrs(2, &[vid])?;
        io.medium().bad.insert(3);
        io.write_ec_hdr(4, 5, 0)?;
        io.write_vid_hdrs(4, &[vid.sqnum(13)])?;
        io.medium().fault(4, 64, 64, ReadStatus::BitFlips);

        for pnum in 0..5 {
            scan_peb(&mut io, &mut ai, pnum, false)?;
        }

        assert_eq!(ai.pnums(PebList::Erase), [0, 2]);
        assert_eq!(ai.pnums(PebList::Free), [1]);
        assert_eq!(ai.bad, [3]);
        assert_eq!(ai.empty_peb_count, 1);

        let (leb, peb) = ai.leb(2, 1).unwrap();
        assert_eq!((peb.pnum, peb.ec, leb.sqnum), (4, Some(5), 13));
        assert!(peb.scrub);
        assert_eq!((ai.ec_count, ai.ec_sum), (3, 12));
        Ok(())
    }

    #[test]
    fn test_damaged_later_slot() -> anyhow::Result<()> {
        let mut medium = MemMedium::new(4, 8192, 64);
        medium.max_lebs_per_peb = 2;
        let mut io = UbiIo::new(medium, Geometry::new(4, 8192, 64, 2)?);
        let mut ai = AttachInfo::new();

        io.write_ec_hdr(0, 2, 0)?;
        let vid = Vid {
            vol_id: 1,
            sqnum: 5,
            ..Default::default()
        };
        io.write_vid_hdrs(
            0,
            &[
                vid,
                Vid {
                    lnum: 1,
                    lpos: 1,
                    ..vid.sqnum(6)
                },
            ],
        )?;
        let offset = io.geometry().vid_hdr_offset + UBI_VID_HDR_SIZE + 10;
        io.medium().pebs[0][offset] ^= 0x01;

        scan_peb(&mut io, &mut ai, 0, false)?;

        let (leb, peb) = ai.leb(1, 0).unwrap();
        assert_eq!((leb.sqnum, peb.pnum), (5, 0));
        assert!(peb.scrub);
        assert!(ai.leb(1, 1).is_none());
        assert_eq!(ai.max_sqnum, 5);

        // A clean second slot is still picked up
        let mut ai = AttachInfo::new();
        io.medium().pebs[0][offset] ^= 0x01;
        scan_peb(&mut io, &mut ai, 0, false)?;
        assert!(ai.leb(1, 1).is_some());
        assert!(!ai.leb(1, 0).unwrap().1.scrub);
        Ok(())
    }

    #[test]
    fn test_fast_scan_flags_damage() -> anyhow::Result<()> {
        let mut io = io()?;
        let mut ai = AttachInfo::new();
        io.write_ec_hdr(6, 1, 0)?;
        io.medium().pebs[6][64..68].copy_from_slice(b"UBI!");

        scan_peb(&mut io, &mut ai, 6, true)?;
        assert!(ai.force_full_scan);
        assert_eq!(ai.pnums(PebList::Erase), [6]);
        Ok(())
    }

    #[test]
    fn test_fastmap_pebs_listed() -> anyhow::Result<()> {
        let mut io = io()?;
        let mut ai = AttachInfo::new();
        io.write_ec_hdr(0, 1, 0)?;
        let sb = Vid {
            vol_id: UBI_FM_SB_VOLUME_ID,
            compat: UBI_COMPAT_DELETE,
            sqnum: 40,
            ..Default::default()
        };
        io.write_vid_hdrs(0, &[sb])?;

        scan_peb(&mut io, &mut ai, 0, true)?;
        assert_eq!(ai.pnums(PebList::Fastmap), [0]);
        assert_eq!(ai.peb(ai.fastmap[0]).sqnum, 40);
        assert!(ai.volumes.is_empty());
        Ok(())
    }

    #[test]
    fn test_check_corruption() -> anyhow::Result<()> {
        let mut io = io()?;
        assert!(!check_corruption(&mut io, 0)?);

        io.medium().pebs[0][4000] = 0x00;
        assert!(check_corruption(&mut io, 0)?);

        io.medium().fault(0, 3968, 64, ReadStatus::Uncorrectable);
        assert!(!check_corruption(&mut io, 0)?);
        Ok(())
    }
}
