//! The medium UBI sits on, and header-level I/O on top of it.

use super::headers::*;
use crate::error::{Error, Result};
use crate::nand::NandLayout;
use crate::util::PageUtil;

/// What a read from the medium found
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadStatus {
    Clean,

    /// The data is good, but enough bits needed correcting that it should be moved
    BitFlips,

    /// The medium could not return intact data; the buffer holds what it could read
    Uncorrectable,
}

/// Raw, eraseblock-addressed access to a flash device
pub trait Medium {
    /// Number of physical eraseblocks
    fn peb_count(&self) -> u32;

    /// Bytes per physical eraseblock
    fn peb_size(&self) -> usize;

    /// Smallest writable unit
    fn min_io_size(&self) -> usize;

    /// How many LEBs one PEB may hold
    fn max_lebs_per_peb(&self) -> u32 {
        1
    }

    fn is_bad(&mut self, pnum: u32) -> anyhow::Result<bool>;

    /// Read `buf.len()` bytes from `offset` within PEB `pnum`
    fn read(&mut self, pnum: u32, offset: usize, buf: &mut [u8]) -> anyhow::Result<ReadStatus>;

    /// Write `data` at `offset` within PEB `pnum`; both must be aligned to the min I/O size
    fn write(&mut self, pnum: u32, offset: usize, data: &[u8]) -> anyhow::Result<()>;

    fn erase(&mut self, pnum: u32) -> anyhow::Result<()>;
}

impl<M: Medium + ?Sized> Medium for &mut M {
    fn peb_count(&self) -> u32 {
        (**self).peb_count()
    }
    fn peb_size(&self) -> usize {
        (**self).peb_size()
    }
    fn min_io_size(&self) -> usize {
        (**self).min_io_size()
    }
    fn max_lebs_per_peb(&self) -> u32 {
        (**self).max_lebs_per_peb()
    }
    fn is_bad(&mut self, pnum: u32) -> anyhow::Result<bool> {
        (**self).is_bad(pnum)
    }
    fn read(&mut self, pnum: u32, offset: usize, buf: &mut [u8]) -> anyhow::Result<ReadStatus> {
        (**self).read(pnum, offset, buf)
    }
    fn write(&mut self, pnum: u32, offset: usize, data: &[u8]) -> anyhow::Result<()> {
        (**self).write(pnum, offset, data)
    }
    fn erase(&mut self, pnum: u32) -> anyhow::Result<()> {
        (**self).erase(pnum)
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Where everything lives inside a PEB
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub peb_count: u32,
    pub peb_size: usize,
    pub min_io_size: usize,

    /// Bytes the EC header occupies, rounded up to the min I/O size
    pub ec_hdr_alsize: usize,

    /// Bytes the VID header area occupies, rounded up to the min I/O size
    pub vid_hdr_alsize: usize,

    pub vid_hdr_offset: usize,

    /// Where LEB data starts
    pub leb_start: usize,

    /// Bytes per LEB
    pub leb_size: usize,

    /// VID headers (and LEBs) per PEB
    pub max_lebs_per_peb: u32,
}

impl Geometry {
    /// Standard placement: EC header first, VID header(s) in the next min I/O unit, data after
    pub fn new(
        peb_count: u32,
        peb_size: usize,
        min_io_size: usize,
        max_lebs_per_peb: u32,
    ) -> Result<Self> {
        if min_io_size == 0 || peb_size % min_io_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "PEB size {peb_size} is not a multiple of min I/O size {min_io_size}"
            )));
        }
        if max_lebs_per_peb == 0 || max_lebs_per_peb > u32::from(LPOS_INVALID) {
            return Err(Error::InvalidConfig(format!(
                "cannot hold {max_lebs_per_peb} LEBs per PEB"
            )));
        }

        let ec_hdr_alsize = align_up(UBI_EC_HDR_SIZE, min_io_size);
        let vid_hdr_alsize = align_up(UBI_VID_HDR_SIZE * max_lebs_per_peb as usize, min_io_size);
        let vid_hdr_offset = ec_hdr_alsize;
        let leb_start = vid_hdr_offset + vid_hdr_alsize;

        let per_leb = peb_size.saturating_sub(leb_start) / max_lebs_per_peb as usize;
        let leb_size = per_leb / min_io_size * min_io_size;
        if leb_size == 0 {
            return Err(Error::InvalidConfig(format!(
                "PEB size {peb_size} leaves no room for data"
            )));
        }

        Ok(Self {
            peb_count,
            peb_size,
            min_io_size,
            ec_hdr_alsize,
            vid_hdr_alsize,
            vid_hdr_offset,
            leb_start,
            leb_size,
            max_lebs_per_peb,
        })
    }

    /// Geometry of a NAND where every block is a PEB and every page a min I/O unit
    pub fn for_layout(layout: &NandLayout, max_lebs_per_peb: u32) -> Result<Self> {
        Self::new(
            layout.blocks,
            layout.block_size(),
            layout.bytes_per_page,
            max_lebs_per_peb,
        )
    }

    /// Geometry as the medium describes itself
    pub fn for_medium<M: Medium + ?Sized>(medium: &M) -> Result<Self> {
        Self::new(
            medium.peb_count(),
            medium.peb_size(),
            medium.min_io_size(),
            medium.max_lebs_per_peb(),
        )
    }

    /// Offset of the data of the LEB in slot `slot`
    pub fn data_offset(&self, slot: u32) -> usize {
        self.leb_start + slot as usize * self.leb_size
    }
}

/// How a header read turned out
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeaderStatus {
    Ok,

    /// Valid, but read with correctable errors
    BitFlips,

    /// The header area is erased
    Empty,

    /// The header area is erased, but read with correctable errors
    EmptyBitFlips,

    /// Something other than a valid header
    BadHdr,

    /// Not a valid header, and the medium reported an uncorrectable error
    BadHdrEbadmsg,
}

impl HeaderStatus {
    pub fn is_valid(self) -> bool {
        matches!(self, HeaderStatus::Ok | HeaderStatus::BitFlips)
    }

    pub fn is_bad(self) -> bool {
        matches!(self, HeaderStatus::BadHdr | HeaderStatus::BadHdrEbadmsg)
    }

    /// Classify a header buffer given how its read went and how it parsed
    fn classify<T>(
        read: ReadStatus,
        buf: &[u8],
        parsed: &std::result::Result<T, HeaderDefect>,
    ) -> Self {
        match (parsed, read) {
            (Ok(_), ReadStatus::Clean) => HeaderStatus::Ok,
            (Ok(_), _) => HeaderStatus::BitFlips,
            (Err(HeaderDefect::Magic), ReadStatus::Uncorrectable) => HeaderStatus::BadHdrEbadmsg,
            (Err(HeaderDefect::Magic), read) if buf.is_erased() => match read {
                ReadStatus::Clean => HeaderStatus::Empty,
                _ => HeaderStatus::EmptyBitFlips,
            },
            (Err(_), ReadStatus::Clean) => HeaderStatus::BadHdr,
            (Err(_), _) => HeaderStatus::BadHdrEbadmsg,
        }
    }
}

/// Header and data I/O on one medium, according to one geometry
pub struct UbiIo<M: Medium> {
    medium: M,
    geometry: Geometry,
}

impl<M: Medium> UbiIo<M> {
    pub fn new(medium: M, geometry: Geometry) -> Self {
        Self { medium, geometry }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn medium(&mut self) -> &mut M {
        &mut self.medium
    }

    pub fn into_medium(self) -> M {
        self.medium
    }

    pub fn is_bad(&mut self, pnum: u32) -> Result<bool> {
        Ok(self.medium.is_bad(pnum)?)
    }

    /// Read and classify the EC header of `pnum`.
    ///
    /// A CRC-valid header from another UBI version, or with offsets that do not match the
    /// geometry, is an error: it cannot be told apart from a misconfigured attach.
    pub fn read_ec_hdr(&mut self, pnum: u32) -> Result<(HeaderStatus, Option<Ec>)> {
        let mut buf = [0u8; UBI_EC_HDR_SIZE];
        let read = self.medium.read(pnum, 0, &mut buf)?;
        let parsed = Ec::decode(&buf);
        let status = HeaderStatus::classify(read, &buf, &parsed);

        match parsed {
            Ok(ec) if status.is_valid() => {
                self.validate_ec(pnum, &ec)?;
                Ok((status, Some(ec)))
            }
            Err(HeaderDefect::Version(version)) => Err(Error::BadHeader {
                what: "EC",
                pnum,
                reason: format!("incompatible UBI version {version}"),
            }),
            _ => Ok((status, None)),
        }
    }

    fn validate_ec(&self, pnum: u32, ec: &Ec) -> Result<()> {
        let geo = &self.geometry;
        if ec.vid_hdr_offset as usize != geo.vid_hdr_offset || ec.data_offset as usize != geo.leb_start
        {
            return Err(Error::BadHeader {
                what: "EC",
                pnum,
                reason: format!(
                    "VID header offset {} / data offset {} do not match {} / {}",
                    ec.vid_hdr_offset, ec.data_offset, geo.vid_hdr_offset, geo.leb_start
                ),
            });
        }
        Ok(())
    }

    /// Read and classify the VID header(s) of `pnum`.
    ///
    /// Slots after the first are read up to the first erased one. A damaged later slot is logged
    /// and skipped, and turns an `Ok` status into `BitFlips` so that the PEB gets scrubbed.
    pub fn read_vid_hdrs(&mut self, pnum: u32) -> Result<(HeaderStatus, Vec<Vid>)> {
        let count = self.geometry.max_lebs_per_peb as usize;
        let mut buf = vec![0u8; UBI_VID_HDR_SIZE * count];
        let read = self
            .medium
            .read(pnum, self.geometry.vid_hdr_offset, &mut buf)?;

        let mut slots = buf.chunks_exact(UBI_VID_HDR_SIZE);
        let first = slots.next().unwrap_or_default();
        let parsed = Vid::decode(first);
        let mut status = HeaderStatus::classify(read, first, &parsed);

        let first = match parsed {
            Ok(vid) if status.is_valid() => vid,
            Err(HeaderDefect::Version(version)) => {
                return Err(Error::BadHeader {
                    what: "VID",
                    pnum,
                    reason: format!("incompatible UBI version {version}"),
                })
            }
            _ => return Ok((status, Vec::new())),
        };

        let mut vids = vec![first];
        for (index, slot) in slots.enumerate() {
            let parsed = Vid::decode(slot);
            match (HeaderStatus::classify(read, slot, &parsed), parsed) {
                (HeaderStatus::Empty | HeaderStatus::EmptyBitFlips, _) => break,
                (slot_status, Ok(vid)) if slot_status.is_valid() => {
                    if vid.lpos != LPOS_INVALID {
                        vids.push(vid);
                    }
                }
                (slot_status, parsed) => {
                    log::error!(
                        "damaged VID header in slot {} of PEB {pnum} ({slot_status:?}, {:?}),                          its LEB is lost",
                        index + 1,
                        parsed.err()
                    );
                    status = HeaderStatus::BitFlips;
                }
            }
        }

        for vid in &vids {
            self.validate_vid(pnum, vid)?;
        }

        Ok((status, vids))
    }

    fn validate_vid(&self, pnum: u32, vid: &Vid) -> Result<()> {
        let geo = &self.geometry;
        let reason = if vid.slot() >= geo.max_lebs_per_peb {
            format!("slot {} beyond {} LEBs per PEB", vid.slot(), geo.max_lebs_per_peb)
        } else if vid.vol_id >= UBI_MAX_VOLUMES && vid.vol_id < UBI_INTERNAL_VOL_START {
            format!("bad volume ID {}", vid.vol_id)
        } else if vid.data_pad as usize >= geo.leb_size {
            format!("data_pad {} exceeds LEB size", vid.data_pad)
        } else if vid.data_size as usize > geo.leb_size - vid.data_pad as usize {
            format!("data_size {} exceeds usable LEB size", vid.data_size)
        } else if vid.compat != 0 && vid.vol_id < UBI_INTERNAL_VOL_START {
            format!("compat {} on user volume", vid.compat)
        } else if vid.vol_id >= UBI_INTERNAL_VOL_START
            && !matches!(
                vid.compat,
                UBI_COMPAT_DELETE | UBI_COMPAT_RO | UBI_COMPAT_PRESERVE | UBI_COMPAT_REJECT
            )
        {
            format!("bad compat {} on internal volume", vid.compat)
        } else {
            return Ok(());
        };

        Err(Error::BadHeader {
            what: "VID",
            pnum,
            reason,
        })
    }

    /// Read LEB data from slot `slot` of `pnum`
    pub fn read_data(
        &mut self,
        pnum: u32,
        slot: u32,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<ReadStatus> {
        let start = self.geometry.data_offset(slot) + offset;
        Ok(self.medium.read(pnum, start, buf)?)
    }

    /// Write a fresh EC header
    pub fn write_ec_hdr(&mut self, pnum: u32, ec: u64, image_seq: u32) -> Result<()> {
        let mut buf = vec![0xFFu8; self.geometry.ec_hdr_alsize];
        Ec {
            ec,
            vid_hdr_offset: self.geometry.vid_hdr_offset as u32,
            data_offset: self.geometry.leb_start as u32,
            image_seq,
        }
        .encode(&mut buf)?;
        Ok(self.medium.write(pnum, 0, &buf)?)
    }

    /// Write the VID header area: one header per LEB held by the PEB
    pub fn write_vid_hdrs(&mut self, pnum: u32, vids: &[Vid]) -> Result<()> {
        if vids.is_empty() || vids.len() > self.geometry.max_lebs_per_peb as usize {
            return Err(Error::InvalidConfig(format!(
                "{} VID headers for one PEB",
                vids.len()
            )));
        }

        let mut buf = vec![0xFFu8; self.geometry.vid_hdr_alsize];
        for (vid, slot) in vids.iter().zip(buf.chunks_exact_mut(UBI_VID_HDR_SIZE)) {
            vid.encode(slot)?;
        }
        Ok(self
            .medium
            .write(pnum, self.geometry.vid_hdr_offset, &buf)?)
    }

    /// Write LEB data to slot `slot` of `pnum`, padded with 0xFF to the min I/O size
    pub fn write_data(&mut self, pnum: u32, slot: u32, data: &[u8]) -> Result<()> {
        if data.len() > self.geometry.leb_size {
            return Err(Error::InvalidConfig(format!(
                "{} bytes do not fit in a LEB",
                data.len()
            )));
        }
        let mut buf = data.to_vec();
        buf.resize(align_up(data.len(), self.geometry.min_io_size), 0xFF);
        Ok(self
            .medium
            .write(pnum, self.geometry.data_offset(slot), &buf)?)
    }

    /// Erase `pnum`
    pub fn sync_erase(&mut self, pnum: u32) -> Result<()> {
        log::debug!("erase PEB {pnum}");
        Ok(self.medium.erase(pnum)?)
    }
}
