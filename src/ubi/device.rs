use parking_lot::{Mutex, RwLockReadGuard};

use super::attach::{attach, AttachConfig, AttachInfo};
use super::io::{Geometry, Medium, ReadStatus, UbiIo};
use crate::error::{Error, Result};
use crate::lock::TopologyLock;

/// An attached UBI device: the medium plus what attach learned about it.
///
/// LEB reads run under the shared side of the topology lock and may proceed concurrently with
/// each other (the medium itself is serialized). A rescan takes the exclusive side.
pub struct UbiDevice<M: Medium> {
    io: Mutex<UbiIo<M>>,
    topology: TopologyLock<AttachInfo>,
    config: AttachConfig,
}

impl<M: Medium> UbiDevice<M> {
    /// Attach to `medium`, laid out as the medium describes itself
    pub fn attach(medium: M, config: AttachConfig) -> Result<Self> {
        let geometry = Geometry::for_medium(&medium)?;
        Self::attach_with(medium, geometry, config)
    }

    pub fn attach_with(medium: M, geometry: Geometry, config: AttachConfig) -> Result<Self> {
        let mut io = UbiIo::new(medium, geometry);
        let ai = attach(&mut io, &config)?;
        Ok(Self {
            io: Mutex::new(io),
            topology: TopologyLock::new(ai),
            config,
        })
    }

    pub fn geometry(&self) -> Geometry {
        *self.io.lock().geometry()
    }

    /// The attach info, held shared
    pub fn attach_info(&self) -> RwLockReadGuard<'_, AttachInfo> {
        self.topology.normal()
    }

    /// Read from LEB `vol_id:lnum`. Unmapped LEBs read as erased.
    pub fn read_leb(
        &self,
        vol_id: u32,
        lnum: u32,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<ReadStatus> {
        let ai = self.topology.normal();
        let av = ai
            .volume(vol_id)
            .ok_or_else(|| Error::InvalidConfig(format!("no volume {vol_id}")))?;

        let mut io = self.io.lock();
        let usable = io.geometry().leb_size - av.data_pad as usize;
        if offset + buf.len() > usable {
            return Err(Error::InvalidConfig(format!(
                "read of {} bytes at {offset} beyond LEB size {usable}",
                buf.len()
            )));
        }

        let Some((leb, peb)) = ai.leb(vol_id, lnum) else {
            buf.fill(0xFF);
            return Ok(ReadStatus::Clean);
        };

        match io.read_data(peb.pnum, leb.slot, offset, buf)? {
            ReadStatus::Uncorrectable => {
                log::error!("uncorrectable read of LEB {vol_id}:{lnum} in PEB {}", peb.pnum);
                Err(Error::IntegrityError {
                    pnum: peb.pnum,
                    offset: offset as u32,
                })
            }
            status => Ok(status),
        }
    }

    /// Scan the whole device again and replace the attach info
    pub fn rescan(&self) -> Result<()> {
        let mut ai = self.topology.maintenance();
        let mut io = self.io.lock();
        let config = AttachConfig {
            force_scan: true,
            ..self.config
        };
        *ai = attach(&mut io, &config)?;
        Ok(())
    }

    /// Take a fresh PEB during attach (see [AttachInfo::early_get_peb]), returning its number
    pub fn early_get_peb(&self) -> Result<u32> {
        let mut ai = self.topology.maintenance();
        let mut io = self.io.lock();
        let id = ai.early_get_peb(&mut io)?;
        Ok(ai.peb(id).pnum)
    }

    /// Hand the attach info over to the wear-leveler and EBA initialization
    pub fn into_attach_info(self) -> AttachInfo {
        self.topology.into_inner()
    }

    pub fn into_parts(self) -> (AttachInfo, M) {
        (self.topology.into_inner(), self.io.into_inner().into_medium())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ubi::headers::{Vid, UBI_CRC};
    use crate::ubi::io::test::MemMedium;

    fn device() -> anyhow::Result<UbiDevice<MemMedium>> {
        let mut medium = MemMedium::new(16, 4096, 64);
        {
            let mut io = UbiIo::new(&mut medium, Geometry::new(16, 4096, 64, 1)?);
            for pnum in 0..16 {
                io.write_ec_hdr(pnum, 1, 3)?;
            }
            let data = b"hello, world".to_vec();
            io.write_vid_hdrs(
                9,
                &[Vid {
                    vol_id: 2,
                    lnum: 0,
                    sqnum: 1,
                    data_size: data.len() as u32,
                    data_crc: UBI_CRC.checksum(&data),
                    ..Default::default()
                }],
            )?;
            io.write_data(9, 0, &data)?;
        }

        let config = AttachConfig {
            fastmap: false,
            self_check: true,
            ..Default::default()
        };
        Ok(UbiDevice::attach(medium, config)?)
    }

    #[test]
    fn test_read_leb() -> anyhow::Result<()> {
        let dev = device()?;
        let mut buf = [0u8; 5];
        assert_eq!(dev.read_leb(2, 0, 7, &mut buf)?, ReadStatus::Clean);
        assert_eq!(&buf, b"world");

        // Unmapped
        assert_eq!(dev.read_leb(2, 5, 0, &mut buf)?, ReadStatus::Clean);
        assert_eq!(buf, [0xFF; 5]);

        assert!(dev.read_leb(3, 0, 0, &mut buf).is_err());
        assert!(dev.read_leb(2, 0, dev.geometry().leb_size, &mut buf).is_err());
        Ok(())
    }

    #[test]
    fn test_uncorrectable_read() -> anyhow::Result<()> {
        let dev = device()?;
        dev.io.lock().medium().fault(9, 128, 64, ReadStatus::Uncorrectable);
        let mut buf = [0u8; 5];
        assert!(matches!(
            dev.read_leb(2, 0, 0, &mut buf),
            Err(Error::IntegrityError { pnum: 9, offset: 0 })
        ));
        Ok(())
    }

    #[test]
    fn test_concurrent_reads_and_rescan() -> anyhow::Result<()> {
        let dev = device()?;
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut buf = [0u8; 12];
                    for _ in 0..20 {
                        dev.read_leb(2, 0, 0, &mut buf).unwrap();
                        assert_eq!(&buf, b"hello, world");
                    }
                });
            }
            s.spawn(|| dev.rescan().unwrap());
        });

        assert_eq!(dev.attach_info().free.len(), 15);
        let pnum = dev.early_get_peb()?;
        assert_eq!(pnum, 0);

        let (ai, medium) = dev.into_parts();
        assert_eq!(ai.handed_out.len(), 1);
        assert_eq!(medium.pebs.len(), 16);
        Ok(())
    }
}
