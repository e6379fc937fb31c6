use chrono::{DateTime, Utc};
use num_bigint::BigUint;

/// Fixed subscription window the unused-portion credit is computed against.
#[derive(Debug, Clone)]
pub struct DiscountParams {
    pub period_millis: i64,
    pub grace_millis: i64,
    pub minimum: BigUint,
}

impl DiscountParams {
    pub fn new(period_days: i64, grace_secs: i64, minimum: BigUint) -> Self {
        Self {
            period_millis: period_days * 24 * 60 * 60 * 1000,
            grace_millis: grace_secs * 1000,
            minimum,
        }
    }
}

/// Amount due for a plan purchase, after the unused-portion discount.
///
/// `current` is the expiring plan's *current* price and its `activeUntil`,
/// when the key still holds one. The unused fraction is measured from
/// `now + grace` against the fixed window, clamped to `[0, 1]`; the discount
/// is `price × unusedMillis / periodMillis` in integer arithmetic, floored.
/// The result is floored at `minimum`, unless the target price itself is
/// already below the minimum, in which case it is charged unchanged.
pub fn amount_due(
    target_price: &BigUint,
    current: Option<(&BigUint, DateTime<Utc>)>,
    now: DateTime<Utc>,
    params: &DiscountParams,
) -> BigUint {
    if *target_price < params.minimum {
        return target_price.clone();
    }

    let discount = match current {
        None => BigUint::from(0u32),
        Some((current_price, active_until)) => {
            let grace_end = now + chrono::Duration::milliseconds(params.grace_millis);
            let unused_millis = (active_until - grace_end)
                .num_milliseconds()
                .clamp(0, params.period_millis);
            current_price * BigUint::from(unused_millis as u64)
                / BigUint::from(params.period_millis as u64)
        }
    };

    let due = target_price - discount.min(target_price.clone());
    due.max(params.minimum.clone())
}
