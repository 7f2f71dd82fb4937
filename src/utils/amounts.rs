/// Convert a raw on-chain token amount to human units.
///
/// Raw amounts arrive as decimal strings (`eth_getLogs` data words, Trongrid
/// `value` fields, SPL `amount` fields). Anything unparseable maps to zero so
/// a malformed provider response reads as "no deposit" rather than a crash.
pub(crate) fn raw_to_human(raw: &str, decimals: u32) -> f64 {
    let Ok(units) = raw.trim().parse::<u128>() else {
        return 0.0;
    };

    units as f64 / 10f64.powi(decimals as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_six_decimal_token() {
        assert_eq!(raw_to_human("1500000", 6), 1.5);
    }

    #[test]
    fn whole_units() {
        assert_eq!(raw_to_human("25000000", 6), 25.0);
    }

    #[test]
    fn garbage_is_zero() {
        assert_eq!(raw_to_human("0x16e360", 6), 0.0);
        assert_eq!(raw_to_human("", 6), 0.0);
        assert_eq!(raw_to_human("-5", 6), 0.0);
    }
}
