//! A command-line front end to the flash core.
//!
//! Attaches UBI on a simulated NAND image or a real MTD device and prints what attach found,
//! decodes SFDP dumps, and works out hardware ECC strengths for a page geometry.

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};

use std::fs::File;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
use flashcore::nand::mtd::{MtdMedium, MtdNand};
use flashcore::{
    ecc::{tune_hw_strength, EccConfig, HwEccCaps, SwBchEngine},
    nand::{NandLayout, NandMedium, SimNand},
    spi_nor::sfdp::{self, SfdpDump},
    ubi::{AttachConfig, Medium, PebList, UbiDevice},
};

#[derive(Args, Debug)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options")]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, group = "nand-options", requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate, as BLOCKSxPAGESxPAGE_SIZE[+OOB]
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,

    /// Bytes per ECC step on the simulated NAND
    #[clap(long, default_value_t = 512)]
    ecc_step: usize,

    /// Bits corrected per ECC step on the simulated NAND
    #[clap(long, default_value_t = 4)]
    ecc_strength: u32,
}

#[derive(Args, Debug)]
struct AttachOptions {
    /// Don't look for a fastmap
    #[clap(long)]
    no_fastmap: bool,

    /// PEBs to search for a fastmap anchor
    #[clap(long, default_value_t = 64)]
    fm_max_start: u32,

    /// Verify the attach result against the media afterwards
    #[clap(long)]
    self_check: bool,
}

impl From<&AttachOptions> for AttachConfig {
    fn from(value: &AttachOptions) -> Self {
        Self {
            fastmap: !value.no_fastmap,
            fm_max_start: value.fm_max_start,
            self_check: value.self_check,
            ..Default::default()
        }
    }
}

fn report<M: Medium>(dev: &UbiDevice<M>) {
    let geometry = dev.geometry();
    let ai = dev.attach_info();

    println!(
        "{} PEBs of {} bytes, LEBs of {} bytes at offset {}",
        geometry.peb_count, geometry.peb_size, geometry.leb_size, geometry.leb_start
    );
    println!(
        "image_seq {:#010x}, mean EC {}, EC range {}..={}, max sqnum {}{}",
        ai.image_seq,
        ai.mean_ec,
        ai.min_ec,
        ai.max_ec,
        ai.max_sqnum,
        if ai.from_fastmap { " (from fastmap)" } else { "" }
    );

    for (vol_id, av) in &ai.volumes {
        println!(
            "volume {vol_id:10}: {:?}, {} LEBs mapped, used_ebs {}, data_pad {}",
            av.vol_type,
            av.lebs.len(),
            av.used_ebs,
            av.data_pad
        );
    }

    for list in [
        PebList::Free,
        PebList::Erase,
        PebList::Corr,
        PebList::Alien,
        PebList::Fastmap,
    ] {
        println!("{list:?}: {:?}", ai.pnums(list));
    }
    println!("Bad: {:?}", ai.bad);

    if ai.ro_mode {
        println!("Read-only: a read-only compatible internal volume is present");
    }
}

fn attach_and_report<M: Medium>(medium: M, config: AttachConfig) -> Result<M> {
    let dev = UbiDevice::attach(medium, config)?;
    report(&dev);
    let (_, medium) = dev.into_parts();
    Ok(medium)
}

impl NandOptions {
    fn attach(&self, config: AttachConfig) -> Result<()> {
        if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)?;
            }

            let ecc_config = EccConfig {
                step_size: self.ecc_step,
                strength: self.ecc_strength,
                bitflip_threshold: None,
            };
            let ecc = SwBchEngine::new(layout.bytes_per_page, layout.oob_per_page, &ecc_config)?;
            let medium = attach_and_report(NandMedium::new(sim, ecc), config)?;

            if self.sim_write {
                if let Some(path) = &self.sim_path {
                    let (mut sim, _) = medium.into_inner();
                    sim.save(&mut File::create(path)?)?;
                }
            }
            return Ok(());
        }

        #[cfg(target_os = "linux")]
        {
            let mtd = if let Some(name) = &self.mtd_name {
                MtdNand::open_named(name)?
            } else if let Some(dev) = &self.mtd_dev {
                MtdNand::open(dev)?
            } else {
                return Err(anyhow!("no NAND given"));
            };

            attach_and_report(MtdMedium::new(mtd)?, config)?;
            Ok(())
        }

        #[cfg(not(target_os = "linux"))]
        Err(anyhow!("no NAND given"))
    }
}

fn print_sfdp(path: &Path) -> Result<()> {
    let data = std::fs::read(path)?;
    let sfdp = sfdp::parse(&mut SfdpDump(&data))?
        .ok_or_else(|| anyhow!("{} holds no SFDP of a known revision", path.display()))?;

    for h in &sfdp.headers {
        println!(
            "table {:#06x} rev {}.{}: {} dwords at {:#x}",
            h.id, h.major, h.minor, h.length, h.pointer
        );
    }

    let bfpt = &sfdp.bfpt;
    println!("size: {} bytes", bfpt.size);
    match bfpt.addr_nbytes {
        Some(n) => println!("address bytes: {n}"),
        None => println!("address bytes: 3 or 4"),
    }
    if let Some(page_size) = bfpt.page_size {
        println!("page size: {page_size}");
    }
    for (caps, read) in &bfpt.reads {
        println!(
            "read {caps:?}: opcode {:#04x}, {} mode clocks, {} wait states",
            read.opcode, read.mode_clocks, read.wait_states
        );
    }
    for erase in &bfpt.erase_types {
        println!(
            "erase type {}: opcode {:#04x}, {} bytes",
            erase.bfpt_index + 1,
            erase.opcode,
            erase.size
        );
    }
    if let Some(qe) = bfpt.quad_enable {
        println!("quad enable: {}", qe.name());
    }
    if let Some(mode) = bfpt.four_byte_mode {
        println!("4-byte mode: {mode:?}");
    }
    if bfpt.four_byte_opcodes {
        println!("dedicated 4-byte opcodes");
    }

    if let Some(four_bait) = &sfdp.four_bait {
        for (caps, opcode) in four_bait.reads() {
            println!("4-byte read {caps:?}: {opcode:#04x}");
        }
        for (caps, opcode, _) in four_bait.programs() {
            println!("4-byte program {caps:?}: {opcode:#04x}");
        }
    }

    if let Some(smpt) = &sfdp.smpt {
        for cmd in smpt.detection_cmds()? {
            println!("sector map detection: {cmd:?}");
        }
    }
    Ok(())
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach UBI and summarize the result; this does not write anything back unless asked to
    Attach {
        #[clap(flatten)]
        nand: NandOptions,

        #[clap(flatten)]
        options: AttachOptions,
    },

    /// Decode a dump of a SPI-NOR SFDP area
    Sfdp {
        /// The path to the dump
        path: PathBuf,
    },

    /// Pick the hardware ECC strength for a page geometry
    EccTune {
        #[clap(long)]
        page_size: usize,

        #[clap(long)]
        oob_size: usize,

        #[clap(long, default_value_t = 1024)]
        step_size: usize,

        #[clap(long)]
        strength: u32,
    },
}

impl Command {
    fn execute(self) -> Result<()> {
        match self {
            Command::Attach { nand, options } => nand.attach((&options).into())?,

            Command::Sfdp { path } => print_sfdp(&path)?,

            Command::EccTune {
                page_size,
                oob_size,
                step_size,
                strength,
            } => {
                let choice = tune_hw_strength(
                    &HwEccCaps::default(),
                    page_size,
                    oob_size,
                    step_size,
                    strength,
                )?;
                println!(
                    "strength {} using {} of {oob_size} OOB bytes ({} steps)",
                    choice.strength,
                    choice.spare_size * choice.steps,
                    choice.steps
                );
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    args.cmd.execute()
}
