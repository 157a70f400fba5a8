//! Read and page program modes, and the commands that implement them.

use bitflags::bitflags;

use super::op::Protocol;

bitflags! {
    /// Read and page program modes. Within each group, a higher bit is a faster mode.
    pub struct Hwcaps: u32 {
        const READ = 1 << 0;
        const READ_FAST = 1 << 1;
        const READ_1_1_2 = 1 << 2;
        const READ_1_2_2 = 1 << 3;
        const READ_2_2_2 = 1 << 4;
        const READ_1_1_4 = 1 << 5;
        const READ_1_4_4 = 1 << 6;
        const READ_4_4_4 = 1 << 7;
        const READ_1_1_8 = 1 << 8;
        const READ_1_8_8 = 1 << 9;
        const READ_8_8_8 = 1 << 10;

        const PP = 1 << 16;
        const PP_1_1_4 = 1 << 17;
        const PP_1_4_4 = 1 << 18;
        const PP_4_4_4 = 1 << 19;
        const PP_1_1_8 = 1 << 20;
        const PP_1_8_8 = 1 << 21;
        const PP_8_8_8 = 1 << 22;

        const READ_MASK = 0x0000_07FF;
        const PP_MASK = 0x007F_0000;
    }
}

impl Default for Hwcaps {
    /// A plain single-line controller
    fn default() -> Self {
        Hwcaps::READ | Hwcaps::READ_FAST | Hwcaps::PP
    }
}

impl Hwcaps {
    /// The fastest single mode in this set
    pub fn best(self) -> Option<Hwcaps> {
        let bits = self.bits();
        (bits != 0).then(|| Hwcaps::from_bits_truncate(1 << (31 - bits.leading_zeros())))
    }

    /// The bus widths of a single mode
    pub fn protocol(self) -> Option<Protocol> {
        Some(match self {
            Hwcaps::READ | Hwcaps::READ_FAST | Hwcaps::PP => Protocol::SPI_1_1_1,
            Hwcaps::READ_1_1_2 => Protocol::SPI_1_1_2,
            Hwcaps::READ_1_2_2 => Protocol::SPI_1_2_2,
            Hwcaps::READ_2_2_2 => Protocol::SPI_2_2_2,
            Hwcaps::READ_1_1_4 | Hwcaps::PP_1_1_4 => Protocol::SPI_1_1_4,
            Hwcaps::READ_1_4_4 | Hwcaps::PP_1_4_4 => Protocol::SPI_1_4_4,
            Hwcaps::READ_4_4_4 | Hwcaps::PP_4_4_4 => Protocol::SPI_4_4_4,
            Hwcaps::READ_1_1_8 | Hwcaps::PP_1_1_8 => Protocol::SPI_1_1_8,
            Hwcaps::READ_1_8_8 | Hwcaps::PP_1_8_8 => Protocol::SPI_1_8_8,
            Hwcaps::READ_8_8_8 | Hwcaps::PP_8_8_8 => Protocol::SPI_8_8_8,
            _ => return None,
        })
    }
}

/// A read command: opcode, bus widths, and the cycles between address and data
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ReadCmd {
    pub opcode: u8,
    pub mode_clocks: u8,
    pub wait_states: u8,
    pub proto: Protocol,
}

impl ReadCmd {
    pub fn new(opcode: u8, mode_clocks: u8, wait_states: u8, proto: Protocol) -> Self {
        Self {
            opcode,
            mode_clocks,
            wait_states,
            proto,
        }
    }

    /// Mode clocks and wait states, sent together as dummy cycles
    pub fn dummy(&self) -> u8 {
        self.mode_clocks + self.wait_states
    }
}

/// A page program command
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct PpCmd {
    pub opcode: u8,
    pub proto: Protocol,
}

#[test]
fn test_best() {
    let caps = Hwcaps::READ | Hwcaps::READ_1_1_4 | Hwcaps::READ_1_2_2 | Hwcaps::PP;
    assert_eq!((caps & Hwcaps::READ_MASK).best(), Some(Hwcaps::READ_1_1_4));
    assert_eq!((caps & Hwcaps::PP_MASK).best(), Some(Hwcaps::PP));
    assert_eq!(Hwcaps::empty().best(), None);
    assert_eq!(Hwcaps::READ_1_4_4.protocol(), Some(Protocol::SPI_1_4_4));
    assert_eq!(Hwcaps::READ_MASK.protocol(), None);
}
