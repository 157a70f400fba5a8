//! A binary BCH codec over GF(2^m).
//!
//! Codewords are systematic: the data bits (most significant bit of the first byte first) are
//! followed by `ecc_bits` parity bits, packed the same way into `ecc_bytes` bytes with zero
//! padding at the end. The code is shortened to the length actually used, so positions reported by
//! [Bch::decode] count from the first data bit.

use crate::error::{Error, Result};

/// Primitive polynomials for m = 5..=15
const PRIM_POLY: [u32; 11] = [
    0x25, 0x43, 0x83, 0x11d, 0x211, 0x409, 0x805, 0x1053, 0x201b, 0x402b, 0x8003,
];

pub const MIN_M: u32 = 5;
pub const MAX_M: u32 = 15;

/// A BCH code with fixed `m` and correction capability `t`
#[derive(Debug, Clone)]
pub struct Bch {
    m: u32,
    t: u32,

    /// Code length of the unshortened code, 2^m - 1
    n: u32,

    /// Degree of the generator polynomial
    ecc_bits: u32,

    /// alpha^i, doubled in length so that sums of two logs need no reduction
    exp: Vec<u16>,

    /// Discrete log of every non-zero field element
    log: Vec<u16>,

    /// Generator polynomial without its leading term, as an MSB-first bit register
    genpoly: Vec<u64>,
}

impl Bch {
    /// Build the code for GF(2^m) correcting up to `t` bit errors per codeword
    pub fn new(m: u32, t: u32) -> Result<Self> {
        if !(MIN_M..=MAX_M).contains(&m) {
            return Err(Error::InvalidConfig(format!("BCH m={m} out of range")));
        }
        let n = (1u32 << m) - 1;
        if t == 0 || m * t >= n {
            return Err(Error::InvalidConfig(format!(
                "BCH t={t} invalid for m={m}"
            )));
        }

        let poly = PRIM_POLY[(m - MIN_M) as usize];
        let mut exp = vec![0u16; 2 * n as usize];
        let mut log = vec![0u16; n as usize + 1];
        let mut x = 1u32;
        for i in 0..n {
            exp[i as usize] = x as u16;
            exp[(i + n) as usize] = x as u16;
            log[x as usize] = i as u16;
            x <<= 1;
            if x & (1 << m) != 0 {
                x ^= poly;
            }
        }

        let mut bch = Self {
            m,
            t,
            n,
            ecc_bits: 0,
            exp,
            log,
            genpoly: Vec::new(),
        };
        bch.build_generator()?;
        Ok(bch)
    }

    pub fn m(&self) -> u32 {
        self.m
    }

    pub fn t(&self) -> u32 {
        self.t
    }

    pub fn ecc_bits(&self) -> u32 {
        self.ecc_bits
    }

    /// The number of bytes [Bch::encode] produces
    pub fn ecc_bytes(&self) -> usize {
        self.ecc_bits.div_ceil(8) as usize
    }

    /// The largest number of data bytes one codeword can protect
    pub fn max_data_bytes(&self) -> usize {
        ((self.n - self.ecc_bits) / 8) as usize
    }

    fn mul(&self, a: u16, b: u16) -> u16 {
        if a == 0 || b == 0 {
            0
        } else {
            self.exp[self.log[a as usize] as usize + self.log[b as usize] as usize]
        }
    }

    fn div(&self, a: u16, b: u16) -> u16 {
        if a == 0 {
            0
        } else {
            let e = self.log[a as usize] as usize + self.n as usize - self.log[b as usize] as usize;
            self.exp[e]
        }
    }

    /// alpha^e for any non-negative exponent
    fn alpha_pow(&self, e: u64) -> u16 {
        self.exp[(e % u64::from(self.n)) as usize]
    }

    /// g(x) is the product of (x - r) over every root in the cyclotomic cosets of alpha^1 ..
    /// alpha^2t; the result has binary coefficients.
    fn build_generator(&mut self) -> Result<()> {
        let mut roots = vec![false; self.n as usize];
        for i in 1..=2 * self.t {
            let mut e = i % self.n;
            while !roots[e as usize] {
                roots[e as usize] = true;
                e = (e * 2) % self.n;
            }
        }

        // Coefficients, lowest degree first
        let mut g: Vec<u16> = vec![1];
        for (e, _) in roots.iter().enumerate().filter(|(_, &r)| r) {
            let r = self.exp[e];
            let mut next = vec![0u16; g.len() + 1];
            for (j, &c) in g.iter().enumerate() {
                next[j + 1] ^= c;
                next[j] ^= self.mul(c, r);
            }
            g = next;
        }

        if g.iter().any(|&c| c > 1) {
            return Err(Error::InvalidConfig(
                "BCH generator polynomial is not binary".into(),
            ));
        }

        let degree = g.len() as u32 - 1;
        self.ecc_bits = degree;
        self.genpoly = vec![0u64; degree.div_ceil(64) as usize];
        for p in 0..degree {
            // Register position p holds the coefficient of x^(degree - 1 - p)
            if g[(degree - 1 - p) as usize] != 0 {
                set_bit(&mut self.genpoly, p);
            }
        }

        Ok(())
    }

    /// Compute the parity bytes of `data`
    pub fn encode(&self, data: &[u8], ecc: &mut [u8]) -> Result<()> {
        self.check_lengths(data.len(), &[ecc.len()])?;

        let mut reg = vec![0u64; self.genpoly.len()];
        let last = reg.len() - 1;
        for &byte in data {
            for bit in (0..8).rev() {
                let feedback = ((byte >> bit) & 1) as u64 ^ (reg[0] >> 63);
                for w in 0..last {
                    reg[w] = (reg[w] << 1) | (reg[w + 1] >> 63);
                }
                reg[last] <<= 1;
                if feedback != 0 {
                    reg.iter_mut()
                        .zip(&self.genpoly)
                        .for_each(|(r, g)| *r ^= g);
                }
            }
        }

        ecc[..self.ecc_bytes()].fill(0);
        for p in 0..self.ecc_bits {
            if get_bit(&reg, p) {
                ecc[(p / 8) as usize] |= 0x80 >> (p % 8);
            }
        }
        Ok(())
    }

    fn check_lengths(&self, data_len: usize, ecc_lens: &[usize]) -> Result<()> {
        if data_len > self.max_data_bytes() {
            return Err(Error::InvalidConfig(format!(
                "BCH data of {data_len} bytes exceeds {}",
                self.max_data_bytes()
            )));
        }
        if let Some(len) = ecc_lens.iter().find(|&&len| len < self.ecc_bytes()) {
            return Err(Error::InvalidConfig(format!(
                "BCH ecc buffer of {len} bytes, need {}",
                self.ecc_bytes()
            )));
        }
        Ok(())
    }

    /// Locate the bit errors in a codeword of `data_len` data bytes, given the parity read back
    /// from the medium and the parity recomputed from the data as read.
    ///
    /// On success, `errloc` holds the codeword bit positions in error; positions below
    /// `data_len * 8` are data bits, the rest are parity bits.
    pub fn decode(
        &self,
        data_len: usize,
        read_ecc: &[u8],
        calc_ecc: &[u8],
        errloc: &mut Vec<u32>,
    ) -> Result<usize> {
        errloc.clear();
        self.check_lengths(data_len, &[read_ecc.len(), calc_ecc.len()])?;

        let r = self.ecc_bits;
        let mut diff = vec![0u64; self.genpoly.len()];
        for p in 0..r {
            let mask = 0x80u8 >> (p % 8);
            let byte = (p / 8) as usize;
            if (read_ecc[byte] ^ calc_ecc[byte]) & mask != 0 {
                set_bit(&mut diff, p);
            }
        }
        if diff.iter().all(|&w| w == 0) {
            return Ok(0);
        }

        let syndromes = self.syndromes(&diff);
        let lambda = self.berlekamp_massey(&syndromes);
        let degree = lambda.iter().rposition(|&c| c != 0).unwrap_or(0);
        if degree == 0 || degree > self.t as usize {
            return Err(Error::Uncorrectable);
        }

        let codeword_bits = data_len as u64 * 8 + u64::from(r);
        let n = u64::from(self.n);
        for d in 0..codeword_bits {
            // Evaluate lambda at alpha^-d
            let inv = (n - d % n) % n;
            let mut sum = 0u16;
            for (i, &c) in lambda.iter().enumerate().take(degree + 1) {
                if c != 0 {
                    sum ^= self.alpha_pow(u64::from(self.log[c as usize]) + inv * i as u64);
                }
            }
            if sum == 0 {
                errloc.push((codeword_bits - 1 - d) as u32);
            }
        }

        if errloc.len() != degree {
            errloc.clear();
            return Err(Error::Uncorrectable);
        }

        Ok(degree)
    }

    /// S_j = diff(alpha^j) for j = 1..=2t, returned as S_1 at index 0
    fn syndromes(&self, diff: &[u64]) -> Vec<u16> {
        let r = self.ecc_bits;
        let two_t = 2 * self.t as usize;
        let mut s = vec![0u16; two_t];

        for p in (0..r).filter(|&p| get_bit(diff, p)) {
            let degree = u64::from(r - 1 - p);
            for j in (1..=two_t).step_by(2) {
                s[j - 1] ^= self.alpha_pow(degree * j as u64);
            }
        }
        for j in (2..=two_t).step_by(2) {
            let half = s[j / 2 - 1];
            s[j - 1] = self.mul(half, half);
        }

        s
    }

    /// The error locator polynomial, lowest degree first
    fn berlekamp_massey(&self, s: &[u16]) -> Vec<u16> {
        let len = s.len() + 1;
        let mut c = vec![0u16; len];
        let mut b = vec![0u16; len];
        c[0] = 1;
        b[0] = 1;

        let mut l = 0usize;
        let mut shift = 1usize;
        let mut last_d = 1u16;

        for k in 0..s.len() {
            let mut d = s[k];
            for i in 1..=l {
                d ^= self.mul(c[i], s[k - i]);
            }

            if d == 0 {
                shift += 1;
                continue;
            }

            let coef = self.div(d, last_d);
            let previous = c.clone();
            for i in 0..len {
                if i + shift < len {
                    c[i + shift] ^= self.mul(coef, b[i]);
                }
            }

            if 2 * l <= k {
                l = k + 1 - l;
                b = previous;
                last_d = d;
                shift = 1;
            } else {
                shift += 1;
            }
        }

        c
    }
}

fn get_bit(reg: &[u64], p: u32) -> bool {
    reg[(p / 64) as usize] & (1u64 << (63 - p % 64)) != 0
}

fn set_bit(reg: &mut [u64], p: u32) {
    reg[(p / 64) as usize] |= 1u64 << (63 - p % 64);
}

#[cfg(test)]
mod test {
    use super::*;

    fn flip(data: &mut [u8], ecc: &mut [u8], k: usize) {
        if k < data.len() * 8 {
            data[k / 8] ^= 0x80 >> (k % 8);
        } else {
            let p = k - data.len() * 8;
            ecc[p / 8] ^= 0x80 >> (p % 8);
        }
    }

    #[test]
    fn test_parameters() -> anyhow::Result<()> {
        let bch = Bch::new(13, 4)?;
        assert_eq!(bch.ecc_bits(), 52);
        assert_eq!(bch.ecc_bytes(), 7);

        let bch = Bch::new(13, 8)?;
        assert_eq!(bch.ecc_bytes(), 13);
        assert!(bch.max_data_bytes() >= 512);

        assert!(Bch::new(4, 2).is_err());
        assert!(Bch::new(5, 8).is_err());
        Ok(())
    }

    #[test]
    fn test_clean_codeword() -> anyhow::Result<()> {
        let bch = Bch::new(13, 4)?;
        let data: Vec<u8> = (0..512u32).map(|x| (x * 7 + 3) as u8).collect();
        let mut ecc = vec![0u8; bch.ecc_bytes()];
        bch.encode(&data, &mut ecc)?;

        let mut errloc = Vec::new();
        assert_eq!(bch.decode(data.len(), &ecc, &ecc, &mut errloc)?, 0);
        assert!(errloc.is_empty());
        Ok(())
    }

    #[test]
    fn test_locate_errors() -> anyhow::Result<()> {
        let bch = Bch::new(13, 4)?;
        let data: Vec<u8> = (0..512u32).map(|x| (x ^ 0x5A) as u8).collect();
        let mut ecc = vec![0u8; bch.ecc_bytes()];
        bch.encode(&data, &mut ecc)?;

        let mut bad_data = data.clone();
        let mut bad_ecc = ecc.clone();
        let positions = [0usize, 1000, 4095, 4096 + 10];
        for &k in &positions {
            flip(&mut bad_data, &mut bad_ecc, k);
        }

        let mut calc = vec![0u8; bch.ecc_bytes()];
        bch.encode(&bad_data, &mut calc)?;

        let mut errloc = Vec::new();
        assert_eq!(bch.decode(bad_data.len(), &bad_ecc, &calc, &mut errloc)?, 4);
        errloc.sort();
        assert_eq!(errloc, [0, 1000, 4095, 4106]);
        Ok(())
    }

    #[test]
    fn test_too_many_errors() -> anyhow::Result<()> {
        let bch = Bch::new(13, 4)?;
        let data = vec![0x3Cu8; 512];
        let mut ecc = vec![0u8; bch.ecc_bytes()];
        bch.encode(&data, &mut ecc)?;

        let mut bad_data = data.clone();
        for k in [3usize, 77, 512, 1999, 3001, 4000] {
            bad_data[k / 8] ^= 0x80 >> (k % 8);
        }
        let mut calc = vec![0u8; bch.ecc_bytes()];
        bch.encode(&bad_data, &mut calc)?;

        let mut errloc = Vec::new();
        assert!(matches!(
            bch.decode(bad_data.len(), &ecc, &calc, &mut errloc),
            Err(Error::Uncorrectable)
        ));
        Ok(())
    }

    #[test]
    fn test_buffer_lengths() -> anyhow::Result<()> {
        let bch = Bch::new(13, 4)?;
        let data = vec![0u8; 512];
        let mut short = vec![0u8; bch.ecc_bytes() - 1];
        assert!(matches!(
            bch.encode(&data, &mut short),
            Err(Error::InvalidConfig(_))
        ));

        let too_long = vec![0u8; bch.max_data_bytes() + 1];
        let mut ecc = vec![0u8; bch.ecc_bytes()];
        assert!(matches!(
            bch.encode(&too_long, &mut ecc),
            Err(Error::InvalidConfig(_))
        ));

        bch.encode(&data, &mut ecc)?;
        let mut errloc = Vec::new();
        assert!(matches!(
            bch.decode(data.len(), &ecc[..2], &ecc, &mut errloc),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            bch.decode(data.len(), &ecc, &[], &mut errloc),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            bch.decode(too_long.len(), &ecc, &ecc, &mut errloc),
            Err(Error::InvalidConfig(_))
        ));
        Ok(())
    }
}
