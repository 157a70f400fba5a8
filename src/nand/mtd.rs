//! NAND access through the Linux MTD character devices (`/dev/mtdX`)
//!
//! [MtdNand] exposes blocks with their OOB area. Opened with [MtdNand::open_raw], the kernel's
//! ECC is bypassed so that an [EccEngine](crate::ecc::EccEngine) can be layered on top through
//! [NandMedium](super::NandMedium). [MtdMedium] instead lets the kernel correct the data and
//! learns about bitflips from its ECC statistics.

use super::{Nand, NandBlock, NandLayout};
use crate::ubi::{Medium, ReadStatus};

use anyhow::{anyhow, bail, ensure};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
    raw: bool,
}

/// The kernel's running ECC counters for one MTD device
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct EccStats {
    pub corrected: u32,
    pub failed: u32,
    pub bad_blocks: u32,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0"), with the kernel correcting reads
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::options().read(true).write(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        log::debug!("opened {}: {layout:?}", path.display());
        Ok(Self {
            file,
            layout,
            raw: false,
        })
    }

    /// Open an `mtd` device with the kernel's ECC switched off, for a userspace engine
    pub fn open_raw<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut nand = Self::open(path)?;
        unsafe {
            ioctl::mtdfilemode(nand.file.as_raw_fd(), ioctl::MTD_FILE_MODE_RAW)?;
        }
        nand.raw = true;
        Ok(nand)
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        let path = Self::find_named(name)?;
        Self::open(path)
    }

    /// Find the device node of the MTD partition called `name`
    pub fn find_named(name: &str) -> anyhow::Result<std::path::PathBuf> {
        // Names are quoted in /proc/mtd
        let quoted = format!("\"{name}\"");

        let proc_mtd = BufReader::new(File::open("/proc/mtd")?);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&quoted) {
                let mtd_dev = line
                    .split(':')
                    .next()
                    .ok_or_else(|| anyhow!("malformed /proc/mtd line {line:?}"))?;
                return Ok(Path::new("/dev").join(mtd_dev));
            }
        }

        bail!("MTD device {quoted} could not be found");
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    /// Read the kernel's ECC counters
    pub fn ecc_stats(&self) -> anyhow::Result<EccStats> {
        let stats = unsafe {
            let mut stats = MaybeUninit::<ioctl::mtd_ecc_stats>::uninit();
            ioctl::eccgetstats(self.file.as_raw_fd(), stats.as_mut_ptr())?;
            stats.assume_init()
        };
        Ok(EccStats {
            corrected: stats.corrected,
            failed: stats.failed,
            bad_blocks: stats.badblocks,
        })
    }

    fn block_base(&self, index: u32) -> u64 {
        self.layout.block_size() as u64 * u64::from(index)
    }
}

impl Nand for MtdNand {
    type Block<'a> = MtdBlock<'a>;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<MtdBlock<'_>>> {
        ensure!(index < self.layout.blocks, "block {index} out of range");

        let block_base = self.block_base(index);
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base)? };
        if bad == 0 {
            Ok(Some(MtdBlock { nand: self, index }))
        } else {
            Ok(None)
        }
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

pub struct MtdBlock<'a> {
    nand: &'a MtdNand,
    index: u32,
}

impl MtdBlock<'_> {
    fn base(&self) -> u64 {
        self.nand.block_base(self.index)
    }

    /// Check that `bytes` covers whole pages inside this block, and compute the /dev/mtdX offset
    /// of `start_page`
    fn offset_for(&self, start_page: u32, bytes: usize) -> anyhow::Result<u64> {
        ensure!(
            bytes % self.page_size() == 0,
            "buffer not multiple of page size"
        );

        let end_page = start_page + (bytes / self.page_size()) as u32;
        ensure!(
            end_page <= self.page_count(),
            "block {0}, page range {start_page}..{end_page} out of bounds",
            self.index
        );

        Ok(self.base() + self.page_size() as u64 * u64::from(start_page))
    }
}

impl NandBlock for MtdBlock<'_> {
    fn page_count(&self) -> u32 {
        self.nand.layout.pages_per_block
    }
    fn page_size(&self) -> usize {
        self.nand.layout.bytes_per_page
    }
    fn oob_size(&self) -> usize {
        self.nand.layout.oob_per_page
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(start_page, content.len())?;
        Ok(self.nand.file.read_exact_at(content, offset)?)
    }

    fn read_oob(&self, page: u32, content: &mut [u8], oob: &mut [u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size(), "content not page-sized");
        ensure!(oob.len() == self.oob_size(), "OOB not OOB-sized");
        let offset = self.offset_for(page, content.len())?;
        self.nand.file.read_exact_at(content, offset)?;

        let mut req = ioctl::mtd_oob_buf64 {
            start: offset,
            pad: 0,
            length: oob.len() as u32,
            usr_ptr: oob.as_mut_ptr() as u64,
        };
        unsafe {
            ioctl::memreadoob64(self.nand.file.as_raw_fd(), &mut req)?;
        }
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(start_page, content.len())?;
        Ok(self.nand.file.write_all_at(content, offset)?)
    }

    fn program_oob(&mut self, page: u32, content: &[u8], oob: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size(), "content not page-sized");
        ensure!(oob.len() == self.oob_size(), "OOB not OOB-sized");
        let offset = self.offset_for(page, content.len())?;

        let mut req = ioctl::mtd_write_req {
            start: offset,
            len: content.len() as u64,
            ooblen: oob.len() as u64,
            usr_data: content.as_ptr() as u64,
            usr_oob: oob.as_ptr() as u64,
            mode: if self.nand.raw {
                ioctl::MTD_OPS_RAW
            } else {
                ioctl::MTD_OPS_PLACE_OOB
            },
            padding: [0; 7],
        };
        unsafe {
            ioctl::memwrite(self.nand.file.as_raw_fd(), &mut req)?;
        }
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        let erase_info = ioctl::erase_info_user64 {
            start: self.base(),
            length: self.nand.layout.block_size() as u64,
        };
        unsafe {
            ioctl::memerase64(self.nand.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }

    fn mark_bad(self) -> anyhow::Result<()> {
        let block_base = self.base();
        unsafe {
            ioctl::memsetbadblock(self.nand.file.as_raw_fd(), &block_base)?;
        }
        Ok(())
    }
}

/// A UBI [Medium] over an MTD device that corrects its own reads
///
/// Bitflips and uncorrectable pages are detected from the change in [EccStats] across a read. Any
/// corrected bit counts as a bitflip, since the kernel does not report against a threshold here.
#[derive(Debug)]
pub struct MtdMedium {
    nand: MtdNand,
}

impl MtdMedium {
    pub fn new(nand: MtdNand) -> anyhow::Result<Self> {
        ensure!(!nand.is_raw(), "MTD device opened raw; use NandMedium with an ECC engine");
        Ok(Self { nand })
    }

    pub fn into_inner(self) -> MtdNand {
        self.nand
    }

    fn layout(&self) -> NandLayout {
        self.nand.layout
    }
}

impl Medium for MtdMedium {
    fn peb_count(&self) -> u32 {
        self.layout().blocks
    }

    fn peb_size(&self) -> usize {
        self.layout().block_size()
    }

    fn min_io_size(&self) -> usize {
        self.layout().bytes_per_page
    }

    fn is_bad(&mut self, pnum: u32) -> anyhow::Result<bool> {
        Ok(self.nand.block(pnum)?.is_none())
    }

    fn read(&mut self, pnum: u32, offset: usize, buf: &mut [u8]) -> anyhow::Result<ReadStatus> {
        ensure!(
            offset + buf.len() <= self.peb_size(),
            "read beyond PEB {pnum}"
        );
        let before = self.nand.ecc_stats()?;
        self.nand
            .file
            .read_exact_at(buf, self.nand.block_base(pnum) + offset as u64)?;
        let after = self.nand.ecc_stats()?;

        Ok(if after.failed != before.failed {
            ReadStatus::Uncorrectable
        } else if after.corrected != before.corrected {
            ReadStatus::BitFlips
        } else {
            ReadStatus::Clean
        })
    }

    fn write(&mut self, pnum: u32, offset: usize, data: &[u8]) -> anyhow::Result<()> {
        let page_size = self.min_io_size();
        ensure!(
            offset % page_size == 0,
            "unaligned write to PEB {pnum}"
        );
        let mut block = self
            .nand
            .block(pnum)?
            .ok_or_else(|| anyhow!("PEB {pnum} is bad"))?;
        block.program((offset / page_size) as u32, data)
    }

    fn erase(&mut self, pnum: u32) -> anyhow::Result<()> {
        self.nand
            .block(pnum)?
            .ok_or_else(|| anyhow!("PEB {pnum} is bad"))?
            .erase()
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandLayout;

    use anyhow::ensure;
    use nix::{
        ioctl_read, ioctl_readwrite, ioctl_write_int_bad, ioctl_write_ptr, request_code_none,
    };

    const MTD_IOC_MAGIC: u8 = b'M';

    pub const MTD_OPS_PLACE_OOB: u8 = 0;
    pub const MTD_OPS_RAW: u8 = 2;
    pub const MTD_FILE_MODE_RAW: i32 = 3;

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryFrom<mtd_info_user> for NandLayout {
        type Error = anyhow::Error;

        fn try_from(mut info: mtd_info_user) -> anyhow::Result<NandLayout> {
            if info.writesize == 1 {
                // mtdram and other NOR-like devices write single bytes
                info.writesize = 64;
            }

            ensure!(info.erasesize != 0, "MTD erasesize is zero");
            ensure!(
                info.size % info.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                info.erasesize % info.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            Ok(NandLayout {
                blocks: info.size / info.erasesize,
                pages_per_block: info.erasesize / info.writesize,
                bytes_per_page: info.writesize as usize,
                oob_per_page: info.oobsize as usize,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user64 {
        pub start: u64,
        pub length: u64,
    }
    ioctl_write_ptr!(memerase64, MTD_IOC_MAGIC, 20, erase_info_user64);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    #[repr(C)]
    pub struct mtd_ecc_stats {
        pub corrected: u32,
        pub failed: u32,
        pub badblocks: u32,
        pub bbtblocks: u32,
    }
    ioctl_read!(eccgetstats, MTD_IOC_MAGIC, 18, mtd_ecc_stats);

    ioctl_write_int_bad!(mtdfilemode, request_code_none!(MTD_IOC_MAGIC, 19));

    #[repr(C)]
    pub struct mtd_oob_buf64 {
        pub start: u64,
        pub pad: u32,
        pub length: u32,
        pub usr_ptr: u64,
    }
    ioctl_readwrite!(memreadoob64, MTD_IOC_MAGIC, 22, mtd_oob_buf64);

    #[repr(C)]
    pub struct mtd_write_req {
        pub start: u64,
        pub len: u64,
        pub ooblen: u64,
        pub usr_data: u64,
        pub usr_oob: u64,
        pub mode: u8,
        pub padding: [u8; 7],
    }
    ioctl_readwrite!(memwrite, MTD_IOC_MAGIC, 24, mtd_write_req);

    #[cfg(test)]
    mod test {
        use super::*;

        fn info(size: u32, erasesize: u32, writesize: u32, oobsize: u32) -> mtd_info_user {
            mtd_info_user {
                r#type: 4,
                flags: 0,
                size,
                erasesize,
                writesize,
                oobsize,
                padding: 0,
            }
        }

        #[test]
        fn test_layout_from_info() -> anyhow::Result<()> {
            let layout = NandLayout::try_from(info(128 << 20, 128 << 10, 2048, 64))?;
            assert_eq!(layout, "1024x64x2048+64".parse()?);

            let layout = NandLayout::try_from(info(1 << 20, 64 << 10, 1, 0))?;
            assert_eq!(layout.bytes_per_page, 64);
            assert_eq!(layout.pages_per_block, 1024);

            assert!(NandLayout::try_from(info(1000, 64 << 10, 2048, 64)).is_err());
            assert!(NandLayout::try_from(info(1 << 20, 0, 2048, 64)).is_err());
            Ok(())
        }
    }
}
