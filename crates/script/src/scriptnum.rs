//! Minimally-encoded script integers.
//!
//! Numbers on the stack are the shortest two's-complement little-endian
//! byte form with the sign carried in the high bit of the last byte.
//! Legacy arithmetic accepts operands of at most 4 bytes; when 64-bit
//! integers are active the limit is 8 bytes and `i64::MIN` stays
//! unrepresentable so negation can never overflow.

use crate::error::ScriptError;

/// Operand size limit for legacy 32-bit arithmetic.
pub const LEGACY_MAX_NUM_SIZE: usize = 4;
/// Operand size limit once 64-bit integers are active.
pub const WIDE_MAX_NUM_SIZE: usize = 8;

pub fn encode_script_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if let Some(last) = result.last_mut() {
        if (*last & 0x80) != 0 {
            result.push(if value < 0 { 0x80 } else { 0 });
        } else if value < 0 {
            *last |= 0x80;
        }
    }
    result
}

pub fn decode_script_num(
    data: &[u8],
    require_minimal: bool,
    max_size: usize,
) -> Result<i64, ScriptError> {
    if data.len() > max_size {
        return Err(ScriptError::InvalidNumberRange);
    }
    if require_minimal && !is_minimally_encoded(data) {
        return Err(ScriptError::MinimalData);
    }
    if data.is_empty() {
        return Ok(0);
    }

    let mut result: i64 = 0;
    for (i, byte) in data.iter().enumerate() {
        result |= ((*byte as i64) & 0xff) << (8 * i);
    }
    let last = *data.last().expect("non-empty");
    if (last & 0x80) != 0 {
        let mask = !(0x80i64 << (8 * (data.len() - 1)));
        result &= mask;
        result = result.wrapping_neg();
    }
    Ok(result)
}

/// True when `data` is the shortest encoding of its value.
pub fn is_minimally_encoded(data: &[u8]) -> bool {
    match data.last() {
        None => true,
        Some(last) => {
            if (last & 0x7f) != 0 {
                return true;
            }
            // A trailing 0x00/0x80 is only needed when the previous byte
            // would otherwise steal the sign bit.
            data.len() > 1 && (data[data.len() - 2] & 0x80) != 0
        }
    }
}

/// Checked arithmetic for script integers. `i64::MIN` is outside the
/// valid range, so every result must also exclude it.
pub fn checked_script_op(
    lhs: i64,
    rhs: i64,
    op: fn(i64, i64) -> Option<i64>,
) -> Result<i64, ScriptError> {
    match op(lhs, rhs) {
        Some(value) if value != i64::MIN => Ok(value),
        _ => Err(ScriptError::InvalidNumberRange),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_shortest_form() {
        assert_eq!(encode_script_num(0), Vec::<u8>::new());
        assert_eq!(encode_script_num(1), vec![0x01]);
        assert_eq!(encode_script_num(-1), vec![0x81]);
        assert_eq!(encode_script_num(127), vec![0x7f]);
        assert_eq!(encode_script_num(128), vec![0x80, 0x00]);
        assert_eq!(encode_script_num(-128), vec![0x80, 0x80]);
        assert_eq!(encode_script_num(0x1234), vec![0x34, 0x12]);
    }

    #[test]
    fn round_trips_across_the_range() {
        for value in [
            0i64,
            1,
            -1,
            127,
            128,
            -255,
            256,
            0x7fff_ffff,
            -0x7fff_ffff,
            i64::MAX,
            i64::MIN + 1,
        ] {
            let bytes = encode_script_num(value);
            let decoded = decode_script_num(&bytes, true, WIDE_MAX_NUM_SIZE).expect("decode");
            assert_eq!(decoded, value, "value {value}");
        }
    }

    #[test]
    fn rejects_non_minimal_when_required() {
        // 1 padded with a zero byte.
        let padded = vec![0x01, 0x00];
        assert_eq!(
            decode_script_num(&padded, true, WIDE_MAX_NUM_SIZE),
            Err(ScriptError::MinimalData)
        );
        assert_eq!(decode_script_num(&padded, false, WIDE_MAX_NUM_SIZE), Ok(1));
    }

    #[test]
    fn respects_operand_size_limit() {
        let five_bytes = vec![0x01, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(
            decode_script_num(&five_bytes, false, LEGACY_MAX_NUM_SIZE),
            Err(ScriptError::InvalidNumberRange)
        );
        assert!(decode_script_num(&five_bytes, false, WIDE_MAX_NUM_SIZE).is_ok());
    }

    #[test]
    fn checked_op_rejects_overflow() {
        assert_eq!(
            checked_script_op(i64::MAX, 1, i64::checked_add),
            Err(ScriptError::InvalidNumberRange)
        );
        assert_eq!(checked_script_op(2, 3, i64::checked_add), Ok(5));
        // -i64::MIN does not exist; the result must stay out of range.
        assert_eq!(
            checked_script_op(i64::MIN + 1, -1, i64::checked_add),
            Err(ScriptError::InvalidNumberRange)
        );
    }
}
