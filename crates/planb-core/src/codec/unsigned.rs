use serde::{Deserialize, Serialize};

use crate::error::{PlanBError, PlanBResult};

/// Big-endian unsigned integer stored in a configurable 1 to 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct UnsignedBytes {
    width: u8,
}

impl UnsignedBytes {
    pub const EIGHT: UnsignedBytes = UnsignedBytes { width: 8 };

    pub fn new(width: u8) -> PlanBResult<Self> {
        if !(1..=8).contains(&width) {
            return Err(PlanBError::InvalidConfig(format!(
                "unsigned width must be between 1 and 8 bytes, got {}",
                width
            )));
        }
        Ok(Self { width })
    }

    pub fn width(&self) -> usize {
        usize::from(self.width)
    }

    /// Largest value that fits.
    pub fn max_value(&self) -> u64 {
        if self.width == 8 {
            u64::MAX
        } else {
            (1u64 << (8 * u32::from(self.width))) - 1
        }
    }

    /// Append `value` to `buf`, failing if it does not fit.
    pub fn put(&self, buf: &mut Vec<u8>, value: u64) -> PlanBResult<()> {
        if value > self.max_value() {
            return Err(PlanBError::ValueOutOfRange {
                value: i128::from(value),
                width: self.width,
            });
        }
        buf.extend_from_slice(&value.to_be_bytes()[8 - self.width()..]);
        Ok(())
    }

    /// Append a signed value, rejecting negatives.
    pub fn put_signed(&self, buf: &mut Vec<u8>, value: i64) -> PlanBResult<()> {
        let unsigned = u64::try_from(value).map_err(|_| PlanBError::ValueOutOfRange {
            value: i128::from(value),
            width: self.width,
        })?;
        self.put(buf, unsigned)
    }

    /// Read a value from the first `width` bytes of `bytes`.
    pub fn get(&self, bytes: &[u8]) -> PlanBResult<u64> {
        let src = bytes.get(..self.width()).ok_or_else(|| {
            PlanBError::corrupt(
                "unsigned value",
                format!("expected {} bytes, found {}", self.width, bytes.len()),
            )
        })?;
        let mut raw = [0u8; 8];
        raw[8 - src.len()..].copy_from_slice(src);
        Ok(u64::from_be_bytes(raw))
    }
}

impl TryFrom<u8> for UnsignedBytes {
    type Error = PlanBError;

    fn try_from(width: u8) -> Result<Self, Self::Error> {
        UnsignedBytes::new(width)
    }
}

impl From<UnsignedBytes> for u8 {
    fn from(u: UnsignedBytes) -> u8 {
        u.width
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths() {
        for width in 1..=8u8 {
            let u = UnsignedBytes::new(width).unwrap();
            for value in [0, 1, u.max_value()] {
                let mut buf = Vec::new();
                u.put(&mut buf, value).unwrap();
                assert_eq!(buf.len(), usize::from(width));
                assert_eq!(u.get(&buf).unwrap(), value);
            }
        }
    }

    #[test]
    fn test_out_of_range() {
        let u = UnsignedBytes::new(2).unwrap();
        let mut buf = Vec::new();
        assert!(matches!(u.put(&mut buf, 65_536), Err(PlanBError::ValueOutOfRange { width: 2, .. })));
        assert!(u.put_signed(&mut buf, -1).is_err());
        assert!(buf.is_empty());
        assert!(UnsignedBytes::new(0).is_err());
        assert!(UnsignedBytes::new(9).is_err());
    }

    #[test]
    fn test_serde_rejects_bad_width() {
        assert_eq!(serde_json::to_string(&UnsignedBytes::EIGHT).unwrap(), "8");
        assert!(serde_json::from_str::<UnsignedBytes>("3").is_ok());
        assert!(serde_json::from_str::<UnsignedBytes>("12").is_err());
    }
}
