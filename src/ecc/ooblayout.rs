//! Placement of ECC bytes within the out-of-band area of a page

use crate::error::{Error, Result};

/// A contiguous run of OOB bytes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OobRegion {
    pub offset: usize,
    pub length: usize,
}

/// Describes which OOB bytes hold ECC and which are free for upper layers.
///
/// Sections are numbered from 0; a layout returns `None` past its last section of each kind.
pub trait OobLayout {
    fn ecc(&self, section: usize) -> Option<OobRegion>;
    fn free(&self, section: usize) -> Option<OobRegion>;

    /// Total ECC bytes this layout can hold
    fn ecc_capacity(&self) -> usize {
        (0..).map_while(|i| self.ecc(i)).map(|r| r.length).sum()
    }

    /// Total free bytes this layout leaves to upper layers
    fn free_capacity(&self) -> usize {
        (0..).map_while(|i| self.free(i)).map(|r| r.length).sum()
    }
}

/// Scatter `ecc` into the ECC regions of `oob`, in section order
pub fn set_ecc_bytes(layout: &dyn OobLayout, ecc: &[u8], oob: &mut [u8]) -> Result<()> {
    let mut src = ecc;
    for region in (0..).map_while(|i| layout.ecc(i)) {
        if src.is_empty() {
            break;
        }
        let len = region.length.min(src.len());
        let dst = oob
            .get_mut(region.offset..region.offset + len)
            .ok_or_else(|| Error::InvalidConfig("OOB layout exceeds OOB area".into()))?;
        dst.copy_from_slice(&src[..len]);
        src = &src[len..];
    }

    if !src.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "{} ECC bytes do not fit the OOB layout",
            ecc.len()
        )));
    }
    Ok(())
}

/// Gather the ECC regions of `oob` into `ecc`, in section order
pub fn get_ecc_bytes(layout: &dyn OobLayout, ecc: &mut [u8], oob: &[u8]) -> Result<()> {
    let mut filled = 0;
    for region in (0..).map_while(|i| layout.ecc(i)) {
        if filled == ecc.len() {
            break;
        }
        let len = region.length.min(ecc.len() - filled);
        let src = oob
            .get(region.offset..region.offset + len)
            .ok_or_else(|| Error::InvalidConfig("OOB layout exceeds OOB area".into()))?;
        ecc[filled..filled + len].copy_from_slice(src);
        filled += len;
    }

    if filled != ecc.len() {
        return Err(Error::InvalidConfig(format!(
            "{} ECC bytes do not fit the OOB layout",
            ecc.len()
        )));
    }
    Ok(())
}

/// Layout for small-page devices (8 or 16 OOB bytes per 512-byte page): ECC around the
/// bad-block marker at bytes 4-5.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SmallPageLayout {
    pub oob_size: usize,
    pub ecc_total: usize,
}

impl OobLayout for SmallPageLayout {
    fn ecc(&self, section: usize) -> Option<OobRegion> {
        let first = if self.oob_size == 16 { 4 } else { 3 };
        match section {
            0 => Some(OobRegion {
                offset: 0,
                length: first.min(self.ecc_total),
            }),
            1 if self.oob_size != 8 && self.ecc_total > first => Some(OobRegion {
                offset: 6,
                length: self.ecc_total - first,
            }),
            _ => None,
        }
    }

    fn free(&self, section: usize) -> Option<OobRegion> {
        if self.oob_size == 16 {
            return (section == 0).then_some(OobRegion {
                offset: 8,
                length: 8,
            });
        }

        match section {
            0 => Some(OobRegion {
                offset: 3,
                length: 2,
            }),
            1 => Some(OobRegion {
                offset: 6,
                length: 2,
            }),
            _ => None,
        }
    }
}

/// Layout for large-page devices: ECC packed at the end of the OOB, free bytes from offset 2 so
/// the bad-block marker survives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LargePageLayout {
    pub oob_size: usize,
    pub ecc_total: usize,
}

impl OobLayout for LargePageLayout {
    fn ecc(&self, section: usize) -> Option<OobRegion> {
        (section == 0 && self.ecc_total > 0).then(|| OobRegion {
            offset: self.oob_size.saturating_sub(self.ecc_total),
            length: self.ecc_total,
        })
    }

    fn free(&self, section: usize) -> Option<OobRegion> {
        let length = self.oob_size.checked_sub(self.ecc_total + 2)?;
        (section == 0 && length > 0).then_some(OobRegion { offset: 2, length })
    }
}

/// Either of the standard layouts, picked by OOB size
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StandardLayout {
    Small(SmallPageLayout),
    Large(LargePageLayout),
}

impl StandardLayout {
    /// Choose the layout for `oob_size` OOB bytes carrying `ecc_total` ECC bytes, failing if the
    /// ECC bytes do not fit around the reserved bytes.
    pub fn new(oob_size: usize, ecc_total: usize) -> Result<Self> {
        let layout = if oob_size == 8 || oob_size == 16 {
            StandardLayout::Small(SmallPageLayout {
                oob_size,
                ecc_total,
            })
        } else {
            StandardLayout::Large(LargePageLayout {
                oob_size,
                ecc_total,
            })
        };

        let fits = match layout {
            StandardLayout::Small(small) => {
                let last = (0..).map_while(|i| small.ecc(i)).last();
                small.ecc_capacity() == ecc_total
                    && last.map_or(true, |r| r.offset + r.length <= oob_size)
                    && ecc_total <= if oob_size == 16 { 6 } else { 3 }
            }
            StandardLayout::Large(_) => ecc_total + 2 <= oob_size,
        };

        if !fits {
            return Err(Error::InvalidConfig(format!(
                "{ecc_total} ECC bytes do not fit in {oob_size} OOB bytes"
            )));
        }

        Ok(layout)
    }
}

impl OobLayout for StandardLayout {
    fn ecc(&self, section: usize) -> Option<OobRegion> {
        match self {
            StandardLayout::Small(x) => x.ecc(section),
            StandardLayout::Large(x) => x.ecc(section),
        }
    }

    fn free(&self, section: usize) -> Option<OobRegion> {
        match self {
            StandardLayout::Small(x) => x.free(section),
            StandardLayout::Large(x) => x.free(section),
        }
    }
}

#[test]
fn test_large_page_layout() -> anyhow::Result<()> {
    let layout = StandardLayout::new(64, 28)?;
    assert_eq!(
        layout.ecc(0),
        Some(OobRegion {
            offset: 36,
            length: 28
        })
    );
    assert_eq!(layout.ecc(1), None);
    assert_eq!(
        layout.free(0),
        Some(OobRegion {
            offset: 2,
            length: 34
        })
    );
    assert_eq!(layout.free_capacity(), 34);

    assert!(StandardLayout::new(64, 63).is_err());
    Ok(())
}

#[test]
fn test_small_page_layout() -> anyhow::Result<()> {
    let layout = StandardLayout::new(16, 6)?;
    assert_eq!(
        layout.ecc(1),
        Some(OobRegion {
            offset: 6,
            length: 2
        })
    );
    assert_eq!(layout.ecc_capacity(), 6);
    assert_eq!(
        layout.free(0),
        Some(OobRegion {
            offset: 8,
            length: 8
        })
    );

    let tiny = StandardLayout::new(8, 3)?;
    assert_eq!(tiny.ecc(1), None);
    assert_eq!(tiny.free_capacity(), 4);

    assert!(StandardLayout::new(16, 7).is_err());
    assert!(StandardLayout::new(8, 4).is_err());
    Ok(())
}

#[test]
fn test_scatter_gather() -> anyhow::Result<()> {
    let layout = StandardLayout::new(16, 6)?;
    let mut oob = [0xFFu8; 16];
    set_ecc_bytes(&layout, &[1, 2, 3, 4, 5, 6], &mut oob)?;
    assert_eq!(oob[..8], [1, 2, 3, 4, 0xFF, 0xFF, 5, 6]);

    let mut ecc = [0u8; 6];
    get_ecc_bytes(&layout, &mut ecc, &oob)?;
    assert_eq!(ecc, [1, 2, 3, 4, 5, 6]);
    Ok(())
}
