//! Raw NAND pages, run through an ECC engine, presented as a UBI medium.

use anyhow::{anyhow, ensure};

use super::{Nand, NandBlock};
use crate::ecc::{Direction, EccEngine, EccMode, EccStatus, PageRequest};
use crate::ubi::{Medium, ReadStatus};

/// A UBI [Medium] on a NAND, one PEB per block and one min I/O unit per page
#[derive(Debug)]
pub struct NandMedium<N: Nand, E: EccEngine> {
    nand: N,
    ecc: E,
}

impl<N: Nand, E: EccEngine> NandMedium<N, E> {
    pub fn new(nand: N, ecc: E) -> Self {
        Self { nand, ecc }
    }

    pub fn nand(&mut self) -> &mut N {
        &mut self.nand
    }

    pub fn ecc(&self) -> &E {
        &self.ecc
    }

    pub fn into_inner(self) -> (N, E) {
        (self.nand, self.ecc)
    }
}

impl<N: Nand, E: EccEngine> Medium for NandMedium<N, E> {
    fn peb_count(&self) -> u32 {
        self.nand.get_layout().blocks
    }

    fn peb_size(&self) -> usize {
        self.nand.get_layout().block_size()
    }

    fn min_io_size(&self) -> usize {
        self.nand.get_layout().bytes_per_page
    }

    fn is_bad(&mut self, pnum: u32) -> anyhow::Result<bool> {
        Ok(self.nand.block(pnum)?.is_none())
    }

    fn read(&mut self, pnum: u32, offset: usize, buf: &mut [u8]) -> anyhow::Result<ReadStatus> {
        let layout = self.nand.get_layout();
        let page_size = layout.bytes_per_page;
        ensure!(
            offset + buf.len() <= layout.block_size(),
            "read beyond PEB {pnum}"
        );

        let block = self
            .nand
            .block(pnum)?
            .ok_or_else(|| anyhow!("PEB {pnum} is bad"))?;

        let threshold = self.ecc.bitflip_threshold();
        let mut page_buf = vec![0u8; page_size];
        let mut oob = vec![0u8; layout.oob_per_page];
        let mut status = ReadStatus::Clean;

        let mut pos = offset;
        let end = offset + buf.len();
        while pos < end {
            let page = (pos / page_size) as u32;
            let in_page = pos % page_size;
            let len = std::cmp::min(page_size - in_page, end - pos);

            let mut req = PageRequest {
                mode: EccMode::Ecc,
                direction: Direction::Read,
                data: &mut page_buf,
                oob: &mut oob,
            };
            self.ecc.prepare_io(&mut req)?;
            block.read_oob(page, req.data, req.oob)?;
            match self.ecc.finish_io(&mut req)? {
                EccStatus::Uncorrectable => {
                    log::debug!("uncorrectable ECC error in PEB {pnum}, page {page}");
                    status = ReadStatus::Uncorrectable;
                }
                EccStatus::Corrected { max_bitflips } if max_bitflips >= threshold => {
                    if status == ReadStatus::Clean {
                        status = ReadStatus::BitFlips;
                    }
                }
                _ => {}
            }

            buf[pos - offset..pos - offset + len].copy_from_slice(&page_buf[in_page..in_page + len]);
            pos += len;
        }

        Ok(status)
    }

    fn write(&mut self, pnum: u32, offset: usize, data: &[u8]) -> anyhow::Result<()> {
        let layout = self.nand.get_layout();
        let page_size = layout.bytes_per_page;
        ensure!(
            offset % page_size == 0 && data.len() % page_size == 0,
            "unaligned write to PEB {pnum}"
        );
        ensure!(
            offset + data.len() <= layout.block_size(),
            "write beyond PEB {pnum}"
        );

        let mut block = self
            .nand
            .block(pnum)?
            .ok_or_else(|| anyhow!("PEB {pnum} is bad"))?;

        let mut page_buf = vec![0u8; page_size];
        let mut oob = vec![0xFFu8; layout.oob_per_page];
        for (index, chunk) in data.chunks(page_size).enumerate() {
            let page = (offset / page_size + index) as u32;
            page_buf.copy_from_slice(chunk);
            oob.fill(0xFF);

            let mut req = PageRequest {
                mode: EccMode::Ecc,
                direction: Direction::Write,
                data: &mut page_buf,
                oob: &mut oob,
            };
            self.ecc.prepare_io(&mut req)?;
            block.program_oob(page, req.data, req.oob)?;
            self.ecc.finish_io(&mut req)?;
        }

        Ok(())
    }

    fn erase(&mut self, pnum: u32) -> anyhow::Result<()> {
        self.nand
            .block(pnum)?
            .ok_or_else(|| anyhow!("PEB {pnum} is bad"))?
            .erase()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ecc::{EccConfig, SwBchEngine};
    use crate::nand::{NandLayout, SimNand};
    use crate::ubi::{Geometry, HeaderStatus, UbiIo};

    const LAYOUT: NandLayout = NandLayout {
        blocks: 8,
        pages_per_block: 8,
        bytes_per_page: 2048,
        oob_per_page: 64,
    };

    fn medium() -> anyhow::Result<NandMedium<SimNand, SwBchEngine>> {
        let ecc = SwBchEngine::new(2048, 64, &EccConfig::default())?;
        Ok(NandMedium::new(SimNand::new(LAYOUT), ecc))
    }

    #[test]
    fn test_geometry() -> anyhow::Result<()> {
        let medium = medium()?;
        let geo = Geometry::for_medium(&medium)?;
        assert_eq!(geo, Geometry::for_layout(&LAYOUT, 1)?);
        assert_eq!(geo.leb_start, 4096);
        assert_eq!(geo.leb_size, 6 * 2048);
        Ok(())
    }

    #[test]
    fn test_bitflips_reported() -> anyhow::Result<()> {
        let mut medium = medium()?;
        let geo = Geometry::for_medium(&medium)?;
        let mut io = UbiIo::new(&mut medium, geo);
        io.write_ec_hdr(2, 9, 1)?;
        assert_eq!(io.read_ec_hdr(2)?.0, HeaderStatus::Ok);

        // One bit is below the threshold of 3 for strength 4
        io.medium().nand().flip_bit(2, 0, 20)?;
        let (status, ec) = io.read_ec_hdr(2)?;
        assert_eq!(status, HeaderStatus::Ok);
        assert_eq!(ec.map(|x| x.ec), Some(9));

        io.medium().nand().flip_bit(2, 0, 100)?;
        io.medium().nand().flip_bit(2, 0, 1000)?;
        let (status, ec) = io.read_ec_hdr(2)?;
        assert_eq!(status, HeaderStatus::BitFlips);
        assert_eq!(ec.map(|x| x.ec), Some(9));

        for bit in [1500, 2000, 3000] {
            io.medium().nand().flip_bit(2, 0, bit)?;
        }
        assert_eq!(io.read_ec_hdr(2)?.0, HeaderStatus::BadHdrEbadmsg);
        Ok(())
    }

    #[test]
    fn test_erased_and_bad() -> anyhow::Result<()> {
        let mut medium = medium()?;
        let mut buf = vec![0u8; 3000];
        assert_eq!(medium.read(1, 100, &mut buf)?, ReadStatus::Clean);
        assert!(buf.iter().all(|&x| x == 0xFF));

        medium.nand().block(5)?.unwrap().mark_bad()?;
        assert!(medium.is_bad(5)?);
        assert!(!medium.is_bad(4)?);
        assert!(medium.read(5, 0, &mut buf).is_err());
        Ok(())
    }

    #[test]
    fn test_unaligned_write() -> anyhow::Result<()> {
        let mut medium = medium()?;
        assert!(medium.write(0, 100, &[0u8; 2048]).is_err());
        assert!(medium.write(0, 0, &[0u8; 100]).is_err());
        medium.write(0, 2048, &[0x11u8; 4096])?;

        let mut buf = [0u8; 4];
        assert_eq!(medium.read(0, 2046, &mut buf)?, ReadStatus::Clean);
        assert_eq!(buf, [0xFF, 0xFF, 0x11, 0x11]);

        medium.erase(0)?;
        assert_eq!(medium.read(0, 2046, &mut buf)?, ReadStatus::Clean);
        assert_eq!(buf, [0xFF; 4]);
        Ok(())
    }
}
