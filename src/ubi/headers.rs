//! This module contains the code necessary to read and write EC/VID headers, with CRC
//! verification/computation.

use crc::{Crc, CRC_32_JAMCRC};
use deku::prelude::*;
use income::{EcHdr, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};

/// CRC-32 as UBI computes it (seeded with `UBI_CRC32_INIT`, no final inversion)
pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
pub const UBI_VERSION: u8 = 1;

pub const UBI_EC_HDR_SIZE: usize = 64;
pub const UBI_VID_HDR_SIZE: usize = 64;

/// The largest erase counter UBI accepts
pub const UBI_MAX_ERASECOUNTER: u64 = 0x7FFF_FFFF;

/// User volumes have IDs below this
pub const UBI_MAX_VOLUMES: u32 = 128;

pub const UBI_INTERNAL_VOL_START: u32 = 0x7FFF_FFFF - 4096;
pub const UBI_LAYOUT_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START;
pub const UBI_FM_SB_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START + 1;
pub const UBI_FM_DATA_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START + 2;

/// Internal volume may be deleted by implementations that don't know it
pub const UBI_COMPAT_DELETE: u8 = 1;
/// Internal volume forces read-only operation on implementations that don't know it
pub const UBI_COMPAT_RO: u8 = 2;
/// Internal volume must be left alone by implementations that don't know it
pub const UBI_COMPAT_PRESERVE: u8 = 4;
/// Implementations that don't know the internal volume must refuse the image
pub const UBI_COMPAT_REJECT: u8 = 5;

/// `lpos` value for a VID header slot that does not describe a LEB
pub const LPOS_INVALID: u8 = 0xFF;

/// Is `vol_id` one of the two fastmap volumes?
pub fn is_fm_vol(vol_id: u32) -> bool {
    vol_id == UBI_FM_SB_VOLUME_ID || vol_id == UBI_FM_DATA_VOLUME_ID
}

/// Why a header buffer did not parse
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeaderDefect {
    /// No header magic: the buffer holds something other than this header
    Magic,

    /// The magic is present but the CRC does not match
    Crc,

    /// Intact, but written by an incompatible UBI version
    Version(u8),
}

/// On-media layout of a VID header.
///
/// The `income` crate's VID header has no slot position, so it is described here.
#[derive(Debug, PartialEq, Eq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct VidHdr {
    pub magic: [u8; 4],
    pub version: u8,
    pub vol_type: u8,
    pub copy_flag: u8,
    pub compat: u8,
    pub vol_id: u32,
    pub lnum: u32,
    pub lpos: u8,
    pub padding1: [u8; 3],
    pub data_size: u32,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub data_crc: u32,
    pub padding2: [u8; 4],
    pub sqnum: u64,
    pub padding3: [u8; 12],
    pub hdr_crc: u32,
}

/// Parses UBI headers from byteslices, with magic and CRC verification.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn get_magic() -> &'static [u8];
    fn get_hdr_magic(&self) -> &[u8];
    fn get_hdr_version(&self) -> u8;

    fn parse(buf: &'a [u8]) -> Result<Self, HeaderDefect> {
        let (_, header) = Self::from_bytes((buf, 0)).map_err(|_| HeaderDefect::Magic)?;

        if header.get_hdr_magic() != Self::get_magic() {
            return Err(HeaderDefect::Magic);
        }

        if !header.check_crc() {
            return Err(HeaderDefect::Crc);
        }

        match header.get_hdr_version() {
            UBI_VERSION => Ok(header),
            version => Err(HeaderDefect::Version(version)),
        }
    }
}

impl ParseHeader<'_> for EcHdr {
    fn get_magic() -> &'static [u8] {
        UBI_EC_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

impl ParseHeader<'_> for VidHdr {
    fn get_magic() -> &'static [u8] {
        UBI_VID_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

/// Computes the header CRC over everything but the trailing CRC field
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        match self.to_bytes() {
            Ok(header_bytes) => {
                let header_len = header_bytes.len() - std::mem::size_of::<u32>();
                UBI_CRC.checksum(&header_bytes[..header_len])
            }
            // Unserializable headers never verify
            Err(_) => !self.get_crc(),
        }
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

fn put_bytes(bytes: &[u8], out_bytes: &mut [u8]) -> anyhow::Result<()> {
    let out_bytes = out_bytes
        .get_mut(..bytes.len())
        .ok_or(anyhow::anyhow!("out_bytes too small"))?;
    out_bytes.copy_from_slice(bytes);
    Ok(())
}

/// This represents the specific fields we care about in an EC header
///
/// This is meant to be more ergonomic to work with than EcHdr, which represents the raw data
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    /// Change the erase counter of this EC header
    pub fn ec(mut self, ec: u64) -> Self {
        self.ec = ec;
        self
    }

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderDefect> {
        EcHdr::parse(bytes).map(|x| x.into())
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        put_bytes(&EcHdr::from(self).to_bytes()?, out_bytes)
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        } = value;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&UBI_EC_HDR_MAGIC[..4]);

        let mut target = Self {
            magic,
            version: UBI_VERSION,

            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for whole-volume updates
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Static => 1,
            VolType::Dynamic => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Static),
            2 => Ok(Self::Dynamic),
            _ => Err(()),
        }
    }
}

/// This represents the specific fields we care about in a VID header
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how UBI should handle the volume.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    /// In a PEB holding several LEBs, the slot holding this LEB's data.
    pub lpos: u8,

    /// For `Static` volumes and copied LEBs, the number of bytes written at the same time as the
    /// VID header, which are thus included in `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is `Dynamic`
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the PEB, to cut the LEB down to a multiple of the
    /// requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written, for resolving `vol_id:lnum`
    /// collisions.
    pub sqnum: u64,
}

impl Vid {
    /// Change the sequence number for this `Vid`
    pub fn sqnum(mut self, sqnum: u64) -> Self {
        self.sqnum = sqnum;
        self
    }

    /// Data slot within the PEB; headers without a valid slot describe slot 0
    pub fn slot(&self) -> u32 {
        match self.lpos {
            LPOS_INVALID => 0,
            lpos => u32::from(lpos),
        }
    }

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderDefect> {
        let hdr = VidHdr::parse(bytes)?;
        hdr.try_into().map_err(|_| HeaderDefect::Crc)
    }

    /// Write into a byte slice
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        put_bytes(&VidHdr::from(self).to_bytes()?, out_bytes)
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = ();

    fn try_from(value: VidHdr) -> Result<Self, Self::Error> {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            lpos,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let copy_flag = copy_flag != 0;

        Ok(Self {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            lpos,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        })
    }
}

impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            lpos,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        } = value;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&UBI_VID_HDR_MAGIC[..4]);

        let mut target = Self {
            magic,
            version: UBI_VERSION,

            vol_type: vol_type.into(),
            copy_flag: copy_flag.into(),
            compat,
            vol_id,
            lnum,
            lpos,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        };

        target.fix_crc();
        target
    }
}

#[test]
fn test_encode() -> anyhow::Result<()> {
    let ec = Ec::default().ec(17);
    let vid = Vid {
        vol_id: 3,
        lnum: 9,
        lpos: 2,
        ..Default::default()
    };

    let mut buf = vec![0u8; 1024];

    ec.encode(&mut buf)?;
    assert_eq!(Ec::decode(&buf), Ok(ec));
    assert_eq!(Vid::decode(&buf), Err(HeaderDefect::Magic));

    vid.encode(&mut buf)?;
    assert_eq!(Vid::decode(&buf), Ok(vid));
    assert_eq!(vid.slot(), 2);

    Ok(())
}

#[test]
fn test_vid_layout() -> anyhow::Result<()> {
    let vid = Vid {
        vol_type: VolType::Static,
        copy_flag: true,
        compat: UBI_COMPAT_PRESERVE,
        vol_id: 0x0102_0304,
        lnum: 5,
        lpos: LPOS_INVALID,
        sqnum: 0x1122_3344_5566_7788,
        ..Default::default()
    };
    let mut buf = [0u8; UBI_VID_HDR_SIZE];
    vid.encode(&mut buf)?;

    assert_eq!(&buf[..4], b"UBI!");
    assert_eq!(buf[4..8], [UBI_VERSION, 1, 1, 4]);
    assert_eq!(buf[8..12], [1, 2, 3, 4]);
    assert_eq!(buf[16], LPOS_INVALID);
    assert_eq!(buf[40..48], [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
    assert_eq!(vid.slot(), 0);
    Ok(())
}

#[test]
fn test_vol_type_bytes() -> anyhow::Result<()> {
    let mut buf = [0u8; UBI_VID_HDR_SIZE];
    for (vol_type, byte) in [(VolType::Static, 1), (VolType::Dynamic, 2)] {
        let vid = Vid {
            vol_type,
            vol_id: 4,
            ..Default::default()
        };
        vid.encode(&mut buf)?;
        assert_eq!(buf[5], byte);
        assert_eq!(Vid::decode(&buf), Ok(vid));
    }

    assert_eq!(VolType::try_from(3), Err(()));
    Ok(())
}

#[test]
fn test_defects() -> anyhow::Result<()> {
    let mut buf = [0xFFu8; UBI_EC_HDR_SIZE];
    assert_eq!(Ec::decode(&buf), Err(HeaderDefect::Magic));

    Ec::default().encode(&mut buf)?;
    buf[10] ^= 0x40;
    assert_eq!(Ec::decode(&buf), Err(HeaderDefect::Crc));

    let mut hdr = EcHdr::from(Ec::default());
    hdr.version = 2;
    hdr.fix_crc();
    let bytes = hdr.to_bytes()?;
    assert_eq!(Ec::decode(&bytes), Err(HeaderDefect::Version(2)));
    Ok(())
}
