use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use thiserror::Error;

/// Money inside the pipeline is integer USD micro-units. Decimal appears
/// only at the API and database boundary.
pub type UsdMicros = i64;

pub const MICROS_PER_USD: i64 = 1_000_000;

/// Decimal scale of a micro-unit amount.
const MICROS_SCALE: u32 = 6;

#[derive(Debug, Error)]
pub enum MoneyError {
    #[error("amount {0} does not fit in 64-bit micro-units")]
    OutOfRange(Decimal),
    #[error("amount {0} carries more than {MICROS_SCALE} decimal places")]
    TooPrecise(Decimal),
}

pub fn micros_to_decimal(micros: UsdMicros) -> Decimal {
    Decimal::new(micros, MICROS_SCALE)
}

pub fn decimal_to_micros(value: Decimal) -> Result<UsdMicros, MoneyError> {
    let scaled = value
        .checked_mul(Decimal::from(MICROS_PER_USD))
        .ok_or(MoneyError::OutOfRange(value))?;
    if !scaled.fract().is_zero() {
        return Err(MoneyError::TooPrecise(value));
    }
    scaled.to_i64().ok_or(MoneyError::OutOfRange(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn decimal_round_trips_through_micros() {
        assert_eq!(decimal_to_micros(dec!(100.00)).unwrap(), 100_000_000);
        assert_eq!(decimal_to_micros(dec!(0.40)).unwrap(), 400_000);
        assert_eq!(decimal_to_micros(dec!(-1.5)).unwrap(), -1_500_000);
        assert_eq!(micros_to_decimal(400_000), dec!(0.40));
        assert_eq!(micros_to_decimal(98_800_000), dec!(98.80));
    }

    #[test]
    fn rejects_sub_micro_precision() {
        assert!(matches!(
            decimal_to_micros(dec!(0.0000001)),
            Err(MoneyError::TooPrecise(_))
        ));
    }

    #[test]
    fn rejects_overflowing_amounts() {
        let huge = Decimal::MAX;
        assert!(matches!(
            decimal_to_micros(huge),
            Err(MoneyError::OutOfRange(_))
        ));
    }
}
