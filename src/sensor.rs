//! Decoding of the sensor word carried in the upper half of a tag's XPC.

/// Calibration slope applied to the 10-bit sensor field.
pub const SENSOR_SCALE: f32 = 0.15;
/// Raw reading that maps to zero.
pub const SENSOR_OFFSET: i32 = 128;

const FIELD_MASK: i32 = 0x3FF;
const SIGN_BIT: i32 = 0x200;

/// Validity bits of the status word. Only `00` and `11` carry a meaning,
/// `01` and `10` both read as `Unknown`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ErrorFlag {
    Valid,
    Invalid,
    Unknown,
}

impl ErrorFlag {
    fn from_bits(bits: u16) -> ErrorFlag {
        match bits & 0x3 {
            0b00 => ErrorFlag::Valid,
            0b11 => ErrorFlag::Invalid,
            _ => ErrorFlag::Unknown,
        }
    }

    /// Character written to the log: `1` valid, `0` invalid, `?` otherwise.
    pub fn as_char(self) -> char {
        match self {
            ErrorFlag::Valid => '1',
            ErrorFlag::Invalid => '0',
            ErrorFlag::Unknown => '?',
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct SensorWord {
    pub status_word: u16,
    pub error_flag: ErrorFlag,
    pub sensor_value: f32,
}

pub fn decode(xpc: u32) -> SensorWord {
    let status_word = (xpc >> 16) as u16;
    let error_flag = ErrorFlag::from_bits(status_word >> 10);

    let mut raw = i32::from(status_word) & FIELD_MASK;
    if raw & SIGN_BIT != 0 {
        raw |= !FIELD_MASK;
    }

    SensorWord {
        status_word,
        error_flag,
        sensor_value: (raw - SENSOR_OFFSET) as f32 * SENSOR_SCALE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_zero_word() {
        let w = decode(0x0000_0000);
        assert_eq!(w.status_word, 0);
        assert_eq!(w.error_flag, ErrorFlag::Valid);
        assert!(close(w.sensor_value, -19.2));
    }

    #[test]
    fn test_sign_extension() {
        let w = decode(0x0201_0000);
        assert_eq!(w.status_word, 0x0201);
        // 0x201 sign-extends to -511
        assert!(close(w.sensor_value, -95.85));

        // smallest field value
        let w = decode(0x0200_0000);
        assert!(close(w.sensor_value, (-512 - 128) as f32 * 0.15));

        // all ones in the field is -1
        let w = decode(0x03FF_0000);
        assert!(close(w.sensor_value, (-1 - 128) as f32 * 0.15));
    }

    #[test]
    fn test_positive_field() {
        // 0x1FF is the largest positive value
        let w = decode(0x01FF_1234);
        assert_eq!(w.status_word, 0x01FF);
        assert!(close(w.sensor_value, (511 - 128) as f32 * 0.15));
        assert!(close(decode(0x0080_0000).sensor_value, 0.0));
    }

    #[test]
    fn test_error_flag() {
        assert_eq!(decode(0x0000_FFFF).error_flag, ErrorFlag::Valid);
        assert_eq!(decode(0x0C00_0000).error_flag, ErrorFlag::Invalid);
        assert_eq!(decode(0x0400_0000).error_flag, ErrorFlag::Unknown);
        assert_eq!(decode(0x0800_0000).error_flag, ErrorFlag::Unknown);
        // bits above 11 do not take part
        assert_eq!(decode(0xF000_0000).error_flag, ErrorFlag::Valid);
        assert_eq!(decode(0xFC00_0000).error_flag, ErrorFlag::Invalid);
    }

    #[test]
    fn test_low_half_ignored() {
        assert_eq!(decode(0x1234_0000), decode(0x1234_FFFF));
    }

    #[test]
    fn test_deterministic() {
        for xpc in [0u32, 1, 0x8000_0000, 0xFFFF_FFFF, 0x0E01_0101].iter() {
            assert_eq!(decode(*xpc), decode(*xpc));
        }
    }

    #[test]
    fn test_flag_chars() {
        assert_eq!(ErrorFlag::Valid.as_char(), '1');
        assert_eq!(ErrorFlag::Invalid.as_char(), '0');
        assert_eq!(ErrorFlag::Unknown.as_char(), '?');
    }
}
