use rust_decimal::{Decimal, RoundingStrategy};

use crate::engine::EngineError;
use crate::model::Ms;

const MS_PER_HOUR: i64 = 3_600_000;

/// Price of `[start, end)` at `hourly_rate`, rounded to cents half-up.
///
/// Multiplies before dividing so whole-cent results stay exact.
pub fn price(start: Ms, end: Ms, hourly_rate: Decimal) -> Result<Decimal, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidInterval { start, end });
    }
    let total = Decimal::from(end - start)
        .checked_mul(hourly_rate)
        .and_then(|v| v.checked_div(Decimal::from(MS_PER_HOUR)))
        .ok_or(EngineError::LimitExceeded("price overflow"))?;
    let mut total = total.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    total.rescale(2);
    Ok(total)
}
