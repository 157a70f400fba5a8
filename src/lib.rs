//! Flash storage core: ECC engines, SPI-NOR discovery through SFDP, and the UBI attach scanner.
//!
//! The layers compose bottom-up. Raw NAND pages go through an [ecc::EccEngine] to become a UBI
//! [ubi::Medium]; [ubi::attach] rebuilds the logical state of the device from the on-media
//! headers. SPI-NOR parts are described by [spi_nor::SpiNor::scan] from their JEDEC ID and SFDP
//! tables.

pub mod ecc;
pub mod error;
pub mod lock;
pub mod nand;
pub mod spi_nor;
pub mod ubi;
pub mod util;

pub use error::{Error, Result};
