//! Consistency checks of a finished attach info against itself and against the media.

use std::collections::BTreeMap;

use super::attach::{AttachInfo, PebList};
use super::headers::*;
use super::io::{Medium, UbiIo};
use crate::error::{Error, Result};

fn fail(msg: String) -> Result<()> {
    log::error!("self-check failed: {msg}");
    Err(Error::Inconsistent(msg))
}

/// Verify that `ai` is internally consistent, that every LEB agrees with the VID header on the
/// media, and that every PEB is accounted for exactly once.
pub fn self_check_ai<M: Medium>(io: &mut UbiIo<M>, ai: &AttachInfo) -> Result<()> {
    let geo = *io.geometry();

    for av in ai.volumes.values() {
        let vol_id = av.vol_id;
        if ai.is_empty {
            return fail(format!("volume {vol_id} found on an empty device"));
        }
        if (UBI_MAX_VOLUMES..UBI_INTERNAL_VOL_START).contains(&vol_id) {
            return fail(format!("bad volume ID {vol_id}"));
        }
        if av.data_pad as usize > geo.leb_size / 2 {
            return fail(format!("bad data_pad {} in volume {vol_id}", av.data_pad));
        }

        for (&lnum, leb) in &av.lebs {
            let peb = ai.peb(leb.peb);
            if lnum != leb.lnum {
                return fail(format!("LEB {vol_id}:{lnum} filed as LEB {}", leb.lnum));
            }
            if peb.pnum >= geo.peb_count {
                return fail(format!(
                    "too high PEB number {}, total PEBs {}",
                    peb.pnum, geo.peb_count
                ));
            }
            if ai.ec_count > 0 {
                let ec = peb.ec.unwrap_or(ai.mean_ec);
                if ec < ai.min_ec || ec > ai.max_ec {
                    return fail(format!(
                        "EC {ec} of PEB {} outside {}..={}",
                        peb.pnum, ai.min_ec, ai.max_ec
                    ));
                }
            }
            match av.vol_type {
                VolType::Static if lnum >= av.used_ebs => {
                    return fail(format!("bad lnum {lnum} or used_ebs {}", av.used_ebs))
                }
                VolType::Dynamic if av.used_ebs != 0 => {
                    return fail(format!("non-zero used_ebs in dynamic volume {vol_id}"))
                }
                _ => {}
            }
            if lnum > av.highest_lnum {
                return fail(format!(
                    "incorrect highest_lnum {} or lnum {lnum}",
                    av.highest_lnum
                ));
            }
        }

        if let Some(&last) = av.lebs.keys().last() {
            if last != av.highest_lnum {
                return fail(format!("bad highest_lnum {} in volume {vol_id}", av.highest_lnum));
            }
        }
    }

    // Now against what is actually written
    for av in ai.volumes.values() {
        let vol_id = av.vol_id;
        for leb in av.lebs.values() {
            let peb = ai.peb(leb.peb);
            let pnum = peb.pnum;
            let (status, vids) = io.read_vid_hdrs(pnum)?;
            if !status.is_valid() {
                return fail(format!("VID header of PEB {pnum} is not OK ({status:?})"));
            }
            let Some(vid) = vids.iter().find(|v| v.slot() == leb.slot) else {
                return fail(format!("PEB {pnum} has no VID header for slot {}", leb.slot));
            };

            let field = if av.vol_type != vid.vol_type {
                Some("vol_type")
            } else if leb.sqnum != 0 && leb.sqnum != vid.sqnum {
                Some("sqnum")
            } else if vol_id != vid.vol_id {
                Some("vol_id")
            } else if av.compat != vid.compat {
                Some("compat")
            } else if leb.lnum != vid.lnum {
                Some("lnum")
            } else if av.used_ebs != vid.used_ebs {
                Some("used_ebs")
            } else if av.data_pad != vid.data_pad {
                Some("data_pad")
            } else if leb.lnum == av.highest_lnum && av.last_data_size != vid.data_size {
                Some("last_data_size")
            } else {
                None
            };
            if let Some(field) = field {
                log::error!("attach info of LEB {vol_id}:{}: {leb:?}, media: {vid:?}", leb.lnum);
                return fail(format!("bad {field} for PEB {pnum}"));
            }
        }
    }

    // Every PEB in exactly one place
    let mut refs: BTreeMap<u32, Vec<&'static str>> = BTreeMap::new();
    for &pnum in &ai.bad {
        refs.entry(pnum).or_default().push("bad");
    }
    for (list, name) in [
        (PebList::Free, "free"),
        (PebList::Erase, "erase"),
        (PebList::Corr, "corr"),
        (PebList::Alien, "alien"),
        (PebList::Fastmap, "fastmap"),
        (PebList::HandedOut, "handed out"),
    ] {
        for pnum in ai.pnums(list) {
            refs.entry(pnum).or_default().push(name);
        }
    }
    let mut held: BTreeMap<usize, u32> = BTreeMap::new();
    for av in ai.volumes.values() {
        for leb in av.lebs.values() {
            *held.entry(leb.peb).or_default() += 1;
        }
    }
    for (&id, &count) in &held {
        let peb = ai.peb(id);
        if peb.live_lebs != count {
            return fail(format!(
                "PEB {} holds {count} LEBs but counts {}",
                peb.pnum, peb.live_lebs
            ));
        }
        refs.entry(peb.pnum).or_default().push("volume");
    }

    for pnum in 0..geo.peb_count {
        match refs.get(&pnum).map(Vec::as_slice) {
            Some([_]) => {}
            None if io.is_bad(pnum)? => {}
            None => return fail(format!("PEB {pnum} is not referenced")),
            Some(places) => return fail(format!("PEB {pnum} is in {places:?}")),
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ubi::attach::{attach, AttachConfig};
    use crate::ubi::io::test::MemMedium;
    use crate::ubi::io::Geometry;

    fn attached() -> anyhow::Result<(UbiIo<MemMedium>, AttachInfo)> {
        let mut io = UbiIo::new(
            MemMedium::new(12, 4096, 64),
            Geometry::new(12, 4096, 64, 1)?,
        );
        for pnum in 0..12 {
            io.write_ec_hdr(pnum, 2, 7)?;
        }
        for (pnum, lnum) in [(3, 0), (4, 1)] {
            io.write_vid_hdrs(
                pnum,
                &[Vid {
                    vol_id: 0,
                    lnum,
                    sqnum: u64::from(lnum) + 1,
                    ..Default::default()
                }],
            )?;
        }
        let config = AttachConfig {
            fastmap: false,
            ..Default::default()
        };
        let ai = attach(&mut io, &config)?;
        Ok((io, ai))
    }

    #[test]
    fn test_consistent() -> anyhow::Result<()> {
        let (mut io, ai) = attached()?;
        self_check_ai(&mut io, &ai)?;
        Ok(())
    }

    #[test]
    fn test_detects_double_listing() -> anyhow::Result<()> {
        let (mut io, mut ai) = attached()?;
        let id = ai.free[0];
        ai.erase.push_back(id);
        assert!(matches!(
            self_check_ai(&mut io, &ai),
            Err(Error::Inconsistent(_))
        ));
        Ok(())
    }

    #[test]
    fn test_detects_missing_peb() -> anyhow::Result<()> {
        let (mut io, mut ai) = attached()?;
        ai.free.pop_front();
        assert!(self_check_ai(&mut io, &ai).is_err());
        Ok(())
    }

    #[test]
    fn test_detects_media_mismatch() -> anyhow::Result<()> {
        let (mut io, ai) = attached()?;
        io.medium().pebs[4].fill(0xFF);
        io.write_ec_hdr(4, 2, 7)?;
        io.write_vid_hdrs(
            4,
            &[Vid {
                vol_id: 0,
                lnum: 1,
                sqnum: 99,
                ..Default::default()
            }],
        )?;
        assert!(self_check_ai(&mut io, &ai).is_err());
        Ok(())
    }
}
