#![warn(missing_docs)]

use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

/// Position in the write-ahead log, an XLogRecPtr.
///
/// Larger values are later in the write-ahead history. `Lsn(0)` is never a
/// valid record position and is used as "no LSN".
#[derive(Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct Lsn(pub u64);

/// Returned when a string is not in `{hi:X}/{lo:X}` form.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid LSN, expected two hex numbers separated by '/'")]
pub struct LsnParseError;

impl Lsn {
    /// InvalidXLogRecPtr
    pub const INVALID: Lsn = Lsn(0);

    /// Anything but [`Lsn::INVALID`].
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for Lsn {
    fn from(n: u64) -> Self {
        Lsn(n)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> u64 {
        lsn.0
    }
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    /// Surrounding whitespace is ignored, as in the output of
    /// `pg_current_wal_lsn()` read from a file.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.trim().split_once('/').ok_or(LsnParseError)?;
        let half = |part: &str| u32::from_str_radix(part, 16).map_err(|_| LsnParseError);
        Ok(Lsn((u64::from(half(hi)?) << 32) | u64::from(half(lo)?)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, bytes: u64) -> Lsn {
        Lsn(self.0 + bytes)
    }
}

impl AddAssign<u64> for Lsn {
    fn add_assign(&mut self, bytes: u64) {
        self.0 += bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn, Lsn(0x16_B374_D848));
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!(format!("{:?}", Lsn(0x1_0000_000A)), "1/A");
        assert_eq!(" 0/16B3748\n".parse(), Ok(Lsn(0x16B3748)));
        assert_eq!("0/0".parse(), Ok(Lsn::INVALID));

        for bad in ["", "16", "16/", "/1", "1/2/3", "G/0", "100000000/0", "-1/0"] {
            assert_eq!(bad.parse::<Lsn>(), Err(LsnParseError), "{bad:?}");
        }
    }

    #[test]
    fn ordering_and_arithmetic() {
        assert!(Lsn(0x1_0000_0000) > Lsn(0xFFFF_FFFF));
        assert_eq!(Lsn(0x100) + 0x10, Lsn(0x110));

        let mut lsn = Lsn(0xFFFF_FFF0);
        lsn += 0x20;
        assert_eq!(lsn.to_string(), "1/10");

        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn(1).is_valid());
    }
}
