//! This module implements UBI attach: rebuilding the logical state of a flash device from the
//! headers UBI leaves on it.
//!
//! UBI populates the first writable unit of every PEB with an "erase counter" ("EC") header, and
//! if the PEB holds data, a "volume ID" ("VID") header in the next one:
//!
//! ```text
//! +- PEB --------------------------------------------+
//! | EC header | VID header(s) | LEB data ...         |
//! +--------------------------------------------------+
//!   0           vid_hdr_offset  leb_start
//! ```
//!
//! Attach reads both headers of every PEB (or, with a fastmap, of only a few) and sorts each PEB
//! into one place: a LEB of some volume, or one of the free, erase, corrupted, alien and fastmap
//! lists. Bad PEBs are only recorded by number.
//!
//! Power cuts leave traces that attach has to reason about:
//! 1. A LEB that was being moved exists twice; the copy with the higher sequence number wins,
//!    unless it was written as a copy and its data CRC shows the copy did not finish.
//! 2. An erase that was interrupted leaves a damaged VID header over erased data; that PEB is just
//!    erased again. A damaged VID header over data that is *not* erased is unexpected, and the PEB
//!    is preserved for inspection. Too many of those and attach refuses the device.
//! 3. An unreadable EC header loses the erase count; it is replaced by the mean of all known ones.

mod attach;
mod check;
mod device;
pub mod fastmap;
mod headers;
mod io;
mod scan;

pub use attach::{
    attach, compare_lebs, AttachConfig, AttachInfo, AttachLeb, AttachVolume, LebComparison,
    LebOutcome, PebId, PebList, PebRecord,
};
pub use check::self_check_ai;
pub use device::UbiDevice;
pub use headers::{
    Ec, HeaderDefect, Vid, VolType, UBI_COMPAT_DELETE, UBI_COMPAT_PRESERVE, UBI_COMPAT_REJECT,
    UBI_COMPAT_RO, UBI_CRC, UBI_FM_DATA_VOLUME_ID, UBI_FM_SB_VOLUME_ID, UBI_INTERNAL_VOL_START,
    UBI_LAYOUT_VOLUME_ID, UBI_MAX_ERASECOUNTER, UBI_MAX_VOLUMES,
};
pub use io::{Geometry, HeaderStatus, Medium, ReadStatus, UbiIo};
