use std::fmt;

use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A bag timestamp: seconds and nanoseconds since the Unix epoch.
///
/// Ordering is by seconds, then nanoseconds. The nanosecond part is kept
/// normalized to `[0, 1e9)` by all constructors and arithmetic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BagTime {
    pub sec: u32,
    pub nsec: u32,
}

impl BagTime {
    pub const ZERO: BagTime = BagTime { sec: 0, nsec: 0 };

    pub fn new(sec: u32, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    /// Parses the 8-byte on-disk representation: `sec:u32 LE | nsec:u32 LE`.
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self {
            sec: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            nsec: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        let mut out = [0; 8];
        out[..4].copy_from_slice(&self.sec.to_le_bytes());
        out[4..].copy_from_slice(&self.nsec.to_le_bytes());
        out
    }

    pub fn as_secs_f64(self) -> f64 {
        self.sec as f64 + self.nsec as f64 * 1e-9
    }

    /// Adds a real-valued seconds offset, carrying fractional nanoseconds.
    ///
    /// The offset may be negative; Euclidean division keeps the resulting
    /// nanosecond part in `[0, 1e9)`. Seconds saturate at zero rather than
    /// wrapping below the epoch.
    pub fn add_secs(self, offset: f64) -> Self {
        let whole = offset.floor();
        let frac_nanos = ((offset - whole) * 1e9).floor() as i64;
        let total_nanos = self.nsec as i64 + frac_nanos;
        let carry = total_nanos.div_euclid(NANOS_PER_SEC);
        let sec = (self.sec as i64 + whole as i64 + carry).clamp(0, u32::MAX as i64);
        Self {
            sec: sec as u32,
            nsec: total_nanos.rem_euclid(NANOS_PER_SEC) as u32,
        }
    }
}

impl fmt::Display for BagTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}
