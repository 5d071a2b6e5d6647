//! Byte-wise comparison of corrupted buffers reported by the device against
//! their known original content.

use log::warn;
use num_bigint::BigUint;
use num_traits::{One, Zero};
use std::fmt;

/// Modulus of the RSA key used by the authentication workload (2048 bit)
pub const REFERENCE_MODULUS_HEX: &str = concat!(
    "c44dc735f6682a261a0b8545a62dd13df4c646a5ede482cef858925baa1811fa0284766b3d1d2b4",
    "d6893df4d9c045efe3e84d8c5d03631b25420f1231d8211e2322eb7eb524da6c1e8fb4c3ae4a8f5",
    "ca13d1e0591f5c64e8e711b3726215cec59ed0ebc6bb042b917d44528887915fdf764df691d183e",
    "16f31ba1ed94c84b476e74b488463e85551022021763af35a64ddf105c1530ef3fcf7e54233e5d3",
    "a4747bbb17328a63e6e3384ac25ee80054bd566855e2eb59a2fd168d3643e44851acf0d118fb03c",
    "73ebc099b4add59c39367d6c91f498d8d607af2e57cc73e3b5718435a81123f080267726a2a9c1c",
    "c94b9c6bb6817427b85d8c670f9a53a777511b",
);

/// Size of the buffer copied by the memcpy workload, filled with `i % 256`
pub const MEMCPY_BUFLEN: usize = 0x1000;

/// One corrupted byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitFlip {
    pub index: usize,
    pub original: u8,
    pub observed: u8,
}

impl BitFlip {
    pub fn mask(&self) -> u8 {
        self.original ^ self.observed
    }

    /// Number of flipped bits
    pub fn count(&self) -> u32 {
        self.mask().count_ones()
    }
}

impl fmt::Display for BitFlip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\t\t\tBF,{},{:x},{:x},{:x},{}",
            self.index,
            self.original,
            self.observed,
            self.mask(),
            self.count()
        )
    }
}

/// Convert a hex string to bytes. Odd length strings get a leading `0`,
/// undecodable input yields a single zero byte.
pub fn decode_hex(s: &str) -> Vec<u8> {
    let s = s.trim();
    let padded;
    let s = if s.len() % 2 == 1 {
        padded = format!("0{}", s);
        padded.as_str()
    } else {
        s
    };
    match hex::decode(s) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Cannot decode hex string ({}): {}", e, s);
            vec![0]
        }
    }
}

/// Compare two buffers over their common length
pub fn diff_bytes(original: &[u8], observed: &[u8]) -> Vec<BitFlip> {
    original
        .iter()
        .zip(observed)
        .enumerate()
        .filter(|(_, (o, n))| o != n)
        .map(|(index, (&original, &observed))| BitFlip {
            index,
            original,
            observed,
        })
        .collect()
}

/// Witnesses for the Miller-Rabin test, also used for trial division
const WITNESSES: [u32; 20] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71,
];

/// Miller-Rabin test with the first 20 primes as witnesses
pub fn is_probable_prime(n: &BigUint) -> bool {
    if n < &BigUint::from(2u32) {
        return false;
    }
    for p in WITNESSES {
        let p = BigUint::from(p);
        if (n % &p).is_zero() {
            return n == &p;
        }
    }

    let n_minus_one = n - 1u32;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;
    let two = BigUint::from(2u32);
    'witness: for a in WITNESSES {
        let mut x = BigUint::from(a).modpow(&d, n);
        if x.is_one() || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Corrupted bytes of one buffer. Modulus candidates also carry whether the
/// corrupted value is still prime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlipReport {
    pub prime: Option<bool>,
    pub flips: Vec<BitFlip>,
}

impl FlipReport {
    pub fn is_empty(&self) -> bool {
        self.prime.is_none() && self.flips.is_empty()
    }
}

/// One `PRIME` line for modulus candidates, then one `BF` line per flip
impl fmt::Display for FlipReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = Vec::with_capacity(self.flips.len() + 1);
        if let Some(prime) = self.prime {
            lines.push(format!("\t\t\tPRIME,{}", if prime { "True" } else { "False" }));
        }
        lines.extend(self.flips.iter().map(BitFlip::to_string));
        write!(f, "{}", lines.join("\n"))
    }
}

/// Primality and bit flips of a modulus candidate against the reference
/// modulus
pub fn bitflip_report(observed_hex: &str) -> FlipReport {
    let observed = decode_hex(observed_hex);
    FlipReport {
        prime: Some(is_probable_prime(&BigUint::from_bytes_be(&observed))),
        flips: diff_bytes(&decode_hex(REFERENCE_MODULUS_HEX), &observed),
    }
}

/// Bit flips of a memcpy workload buffer against its fill pattern
pub fn memcpy_report(observed_hex: &str) -> FlipReport {
    let pattern: Vec<u8> = (0..MEMCPY_BUFLEN).map(|i| (i % 256) as u8).collect();
    FlipReport {
        prime: None,
        flips: diff_bytes(&pattern, &decode_hex(observed_hex)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_modulus_is_2048_bit() {
        assert_eq!(REFERENCE_MODULUS_HEX.len(), 512);
        assert_eq!(decode_hex(REFERENCE_MODULUS_HEX).len(), 256);
    }

    #[test]
    fn odd_and_invalid_hex() {
        assert_eq!(decode_hex("abc"), vec![0x0a, 0xbc]);
        assert_eq!(decode_hex("zz"), vec![0]);
    }

    #[test]
    fn unchanged_modulus_has_no_flips() {
        let report = bitflip_report(REFERENCE_MODULUS_HEX);
        assert!(report.flips.is_empty());
        assert_eq!(report.prime, Some(false));
        assert_eq!(report.to_string(), "\t\t\tPRIME,False");
    }

    #[test]
    fn primality_of_known_values() {
        let prime = |hex: &str| is_probable_prime(&BigUint::from_bytes_be(&decode_hex(hex)));
        assert!(prime("0d"));
        assert!(prime("02"));
        assert!(!prime("01"));
        assert!(!prime("00"));
        assert!(!prime("0f"));
        // 2^127 - 1
        assert!(prime("7fffffffffffffffffffffffffffffff"));
        // 2^521 - 1
        assert!(prime(&format!("1{}", "f".repeat(130))));
        // strong pseudoprime to the bases 2, 3, 5 and 7
        assert!(!prime("bfa17dc7"));
    }

    #[test]
    fn prime_modulus_candidate_is_reported() {
        let report = bitflip_report("7fffffffffffffffffffffffffffffff");
        assert_eq!(report.prime, Some(true));
        let text = report.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "\t\t\tPRIME,True");
        assert!(lines[1].starts_with("\t\t\tBF,0,c4,7f,"));
    }

    #[test]
    fn single_flip_in_modulus() {
        let mut corrupted = REFERENCE_MODULUS_HEX.to_string();
        // c4 -> c5
        corrupted.replace_range(0..2, "c5");
        let flips = bitflip_report(&corrupted).flips;
        assert_eq!(flips.len(), 1);
        assert_eq!(flips[0].to_string(), "\t\t\tBF,0,c4,c5,1,1");
    }

    #[test]
    fn memcpy_pattern() {
        let mut buffer: Vec<u8> = (0..MEMCPY_BUFLEN).map(|i| (i % 256) as u8).collect();
        buffer[0x101] = 0xfe;
        let report = memcpy_report(&hex::encode(&buffer));
        assert_eq!(report.prime, None);
        assert!(!report.to_string().contains("PRIME"));
        let flips = report.flips;
        assert_eq!(
            flips,
            vec![BitFlip {
                index: 0x101,
                original: 0x01,
                observed: 0xfe
            }]
        );
        assert_eq!(flips[0].count(), 8);
    }
}
