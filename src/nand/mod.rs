//! Abstractions and code to access NAND flash

use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::ensure;

pub use crate::util::PageUtil;

mod medium;
#[cfg(target_os = "linux")]
pub mod mtd;
pub mod ops;

pub use medium::NandMedium;

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub oob_per_page: usize,
}

impl NandLayout {
    /// The number of bytes in one block, excluding OOB
    pub fn block_size(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES" or "BLOCKSxPAGESxBYTES+OOB"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (geometry, oob) = s.split_once('+').unwrap_or((s, "0"));
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = geometry
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x# or #x#x#+#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;
        let oob_per_page = oob.parse()?;

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            oob_per_page,
        })
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// How many out-of-band bytes accompany each page?
    fn oob_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// Read a single page together with its out-of-band area
    fn read_oob(&self, page: u32, content: &mut [u8], oob: &mut [u8]) -> anyhow::Result<()>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Note that `index` must be greater than any previously-written index, or in other words,
    /// writing a page makes it and all skipped pages nonwritable. This is to comply with the
    /// sequential-write requirements of certain MLC NANDs.
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Write a single page together with its out-of-band area, under the same ordering rules as
    /// [NandBlock::program]
    fn program_oob(&mut self, page: u32, content: &[u8], oob: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    ///
    /// This should be called if an erase() results in error, or if a (properly in-order) program()
    /// results in error and we have already tried erase() and reprogramming it.
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// The out-of-band bytes of all written pages, `oob_size` per page
    oob: Vec<u8>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// How many OOB bytes per page
    oob_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,

    /// Fail the next erase, as a dying block would
    fail_erase: bool,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self { blocks, layout }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    ///
    /// Only the main data area is loaded; OOB bytes are left erased.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in self.blocks.iter_mut() {
            let mut block = block;
            block.marked_bad = false;
            block.erase()?;
            read.read_exact(&mut buf)?;
            block.program(0, &buf)?;
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND block out to a writable stream (such as a File)
    pub fn save<W: Write>(&mut self, write: &mut W) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in 0..self.layout.blocks {
            match self.block(block)? {
                None => buf.fill(0xBD),
                Some(block) => block.read(0, &mut buf)?,
            };

            write.write_all(&buf)?;
        }

        Ok(())
    }

    /// Invert one bit of a page's main data area, as a disturbed cell would
    pub fn flip_bit(&mut self, block: u32, page: u32, bit: usize) -> anyhow::Result<()> {
        let sim = self.sim_block(block)?;
        ensure!(bit < sim.page_size * 8, "bit {bit} outside of page");
        let offset = page as usize * sim.page_size + bit / 8;
        sim.materialize(page)?;
        sim.data[offset] ^= 1 << (bit % 8);
        Ok(())
    }

    /// Invert one bit of a page's out-of-band area
    pub fn flip_oob_bit(&mut self, block: u32, page: u32, bit: usize) -> anyhow::Result<()> {
        let sim = self.sim_block(block)?;
        ensure!(bit < sim.oob_size * 8, "bit {bit} outside of OOB");
        let offset = page as usize * sim.oob_size + bit / 8;
        sim.materialize(page)?;
        sim.oob[offset] ^= 1 << (bit % 8);
        Ok(())
    }

    /// Make the next erase of `block` fail
    pub fn fail_next_erase(&mut self, block: u32) -> anyhow::Result<()> {
        self.sim_block(block)?.fail_erase = true;
        Ok(())
    }

    fn sim_block(&mut self, index: u32) -> anyhow::Result<&mut SimBlock> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            oob: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            oob_size: layout.oob_per_page,
            marked_bad: false,
            fail_erase: false,
        }
    }

    /// Extend the backing storage (with erased bytes) so that `page` is addressable
    fn materialize(&mut self, page: u32) -> anyhow::Result<()> {
        ensure!(page < self.page_count, "page index out of bounds");
        let end = (page as usize + 1) * self.page_size;
        if self.data.len() < end {
            self.data.resize(end, 0xFF);
        }
        let oob_end = (page as usize + 1) * self.oob_size;
        if self.oob.len() < oob_end {
            self.oob.resize(oob_end, 0xFF);
        }
        Ok(())
    }

    fn write_page(&mut self, index: u32, content: &[u8], oob: Option<&[u8]>) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");
        if let Some(oob) = oob {
            ensure!(oob.len() == self.oob_size, "OOB not OOB-sized");
        }

        let begin = index as usize * self.page_size;

        // Writing fully-erased content is a no-op.
        if content.is_erased() && oob.map_or(true, |x| x.is_erased()) {
            return Ok(());
        }

        ensure!(begin >= self.data.len(), "write in already-written area");

        self.data.resize(begin, 0xFF);
        self.data.extend_from_slice(content);

        self.oob.resize(index as usize * self.oob_size, 0xFF);
        match oob {
            Some(oob) => self.oob.extend_from_slice(oob),
            None => self.oob.resize(self.oob.len() + self.oob_size, 0xFF),
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8], oob: Option<&mut [u8]>) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;
        let end = begin + self.page_size;

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }

        if let Some(oob) = oob {
            ensure!(oob.len() == self.oob_size, "OOB not OOB-sized");
            let begin = index as usize * self.oob_size;
            match self.oob.get(begin..begin + self.oob_size) {
                Some(stored) => oob.copy_from_slice(stored),
                None => oob.fill(0xFF),
            }
        }

        Ok(())
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.sim_block(index)
            .map(|x| Some(x).filter(|y| !y.marked_bad))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

impl NandBlock for &mut SimBlock {
    fn page_count(&self) -> u32 {
        self.page_count
    }
    fn page_size(&self) -> usize {
        self.page_size
    }
    fn oob_size(&self) -> usize {
        self.oob_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks_mut(self.page_size()) {
            self.read_page(page, chunk, None)?;
            page += 1;
        }
        Ok(())
    }

    fn read_oob(&self, page: u32, content: &mut [u8], oob: &mut [u8]) -> anyhow::Result<()> {
        self.read_page(page, content, Some(oob))
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks(self.page_size()) {
            self.write_page(page, chunk, None)?;
            page += 1;
        }
        Ok(())
    }

    fn program_oob(&mut self, page: u32, content: &[u8], oob: &[u8]) -> anyhow::Result<()> {
        self.write_page(page, content, Some(oob))
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        if std::mem::take(&mut self.fail_erase) {
            anyhow::bail!("erase failed");
        }

        self.data.clear();
        self.oob.clear();

        Ok(())
    }

    fn mark_bad(self) -> anyhow::Result<()> {
        self.data.clear();
        self.oob.clear();
        self.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    oob_per_page: 16,
};

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.block(0).unwrap().unwrap().mark_bad().unwrap();
    assert!(nand.block(0).unwrap().is_none());
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; nand.get_layout().bytes_per_page];
    let mut data_out = data_in.clone();

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(2, &data_in).unwrap();
    assert!(block.program(1, &data_in).is_err());

    block.read(1, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    block.read(2, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    block.read(3, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_oob() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let layout = nand.get_layout();

    let data_in = vec![0xFFu8; layout.bytes_per_page];
    let mut oob_in = vec![0xFFu8; layout.oob_per_page];
    oob_in[4] = 0x12;

    let mut block = nand.block(1)?.unwrap();
    block.program_oob(0, &data_in, &oob_in)?;

    let mut data_out = vec![0u8; layout.bytes_per_page];
    let mut oob_out = vec![0u8; layout.oob_per_page];
    block.read_oob(0, &mut data_out, &mut oob_out)?;
    assert!(data_out.is_erased());
    assert_eq!(oob_out, oob_in);

    // The page counts as written, even though its data area is erased
    assert!(block.program_oob(0, &data_in, &oob_in).is_err());

    nand.flip_oob_bit(1, 0, 4 * 8)?;
    let block = nand.block(1)?.unwrap();
    block.read_oob(0, &mut data_out, &mut oob_out)?;
    assert_eq!(oob_out[4], 0x13);

    Ok(())
}

#[test]
fn test_sim_flip_and_fail() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.flip_bit(3, 5, 9)?;

    let mut buf = vec![0u8; TEST_LAYOUT.bytes_per_page];
    nand.block(3)?.unwrap().read(5, &mut buf)?;
    assert_eq!(buf[1], 0xFD);
    assert_eq!(buf.zero_bits(), 1);

    nand.fail_next_erase(3)?;
    assert!(nand.block(3)?.unwrap().erase().is_err());
    nand.block(3)?.unwrap().erase()?;
    nand.block(3)?.unwrap().read(5, &mut buf)?;
    assert!(buf.is_erased());

    Ok(())
}

#[test]
fn test_sim_load() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.load(&mut std::io::repeat(0x55u8)).unwrap();

    let mut buf = vec![0u8; nand.get_layout().block_size()];

    let block = nand.block(0).unwrap().unwrap();
    block.read(0, &mut buf).unwrap();

    assert!(buf.iter().all(|&x| x == 0x55u8));
}

#[test]
fn test_layout_parse() -> anyhow::Result<()> {
    let layout: NandLayout = "128x64x2048+64".parse()?;
    assert_eq!(layout.blocks, 128);
    assert_eq!(layout.oob_per_page, 64);

    let layout: NandLayout = "16x16x128".parse()?;
    assert_eq!(layout.oob_per_page, 0);
    assert!("16x16".parse::<NandLayout>().is_err());
    Ok(())
}
