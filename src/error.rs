//! The crate-wide error type.
//!
//! Device backends speak `anyhow` (see [crate::nand::NandBlock] and [crate::ubi::Medium]); those
//! errors are carried through as [Error::Io]. Everything else here is a condition the core itself
//! detected.

/// Errors raised by the ECC, SPI-NOR and UBI layers
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The medium reported an uncorrectable read failure where intact data was required
    #[error("uncorrectable read error at PEB {pnum}, offset {offset}")]
    IntegrityError { pnum: u32, offset: u32 },

    /// An ECC step could not be decoded
    #[error("uncorrectable ECC error")]
    Uncorrectable,

    /// A CRC mismatch on something that had to be intact
    #[error("corrupted {what}")]
    Corrupt { what: String },

    /// A header passed its CRC check but carries values this implementation cannot accept
    #[error("bad {what} header at PEB {pnum}: {reason}")]
    BadHeader {
        what: &'static str,
        pnum: u32,
        reason: String,
    },

    /// Multiple valid copies of something disagree
    #[error("inconsistent media: {0}")]
    Inconsistent(String),

    /// Two live copies of one LEB carry the same non-zero sequence number
    #[error("LEB {vol_id}:{lnum} found in PEBs {pnum_a} and {pnum_b} with the same sqnum {sqnum}")]
    DuplicateSqnum {
        vol_id: u32,
        lnum: u32,
        pnum_a: u32,
        pnum_b: u32,
        sqnum: u64,
    },

    /// An image without sequence numbers shows signs of an unclean reboot
    #[error("unsupported on-flash UBI format: LEB {vol_id}:{lnum} has two copies without sqnum")]
    AncientUnclean { vol_id: u32, lnum: u32 },

    /// An erase counter reached the fatal range
    #[error("erase counter overflow at PEB {pnum}: EC {ec}")]
    EcOverflow { pnum: u32, ec: u64 },

    /// Too many PEBs carry unexpected corruption to trust the device
    #[error("too many corrupted PEBs ({corrupted}, limit {limit}), refusing")]
    TooManyCorruptPebs { corrupted: u32, limit: u32 },

    /// The device holds data that is not a UBI image
    #[error("device is not UBI-formatted and possibly contains non-UBI data")]
    NotUbiFormatted,

    /// No known part matches the probed JEDEC ID
    #[error("unrecognized JEDEC id bytes: {0:02x?}")]
    Unknown([u8; 3]),

    /// Nothing answered the JEDEC ID probe
    #[error("no SPI-NOR device found")]
    NoDevice,

    /// An erase request cannot be covered by the erase types of its regions
    #[error("erase of {len:#x} bytes at {addr:#x} cannot be aligned to any erase type")]
    Misaligned { addr: u64, len: u64 },

    /// The quad-enable bit did not stick
    #[error("quad enable bit not set after {procedure}")]
    QeNotSet { procedure: &'static str },

    /// Allocation failure while building the attach info
    #[error("out of memory")]
    OutOfMemory,

    /// No free or erasable PEB left
    #[error("no free eraseblocks")]
    NoSpace,

    /// The requested configuration cannot be honored
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The underlying device failed
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

pub type Result<T> = std::result::Result<T, Error>;
