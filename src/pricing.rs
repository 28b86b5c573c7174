use crate::model::{HOUR_MS, Quote, Span};

const HOURS_PER_DAY: f64 = 24.0;

/// Price a span from hourly and daily rates.
///
/// Spans shorter than 24h are billed by the (fractional) hour. From 24h on,
/// each whole day is billed at `rate_day` and the leftover hours at
/// `rate_hour`. The day rate kicks in at exactly 24h and no earlier, even
/// when `rate_day` is cheaper than the equivalent hours.
pub fn price(rate_hour: f64, rate_day: f64, span: &Span) -> Quote {
    let duration_hours = span.duration_ms() as f64 / HOUR_MS as f64;
    let amount = if duration_hours >= HOURS_PER_DAY {
        let full_days = (duration_hours / HOURS_PER_DAY).floor();
        let remainder_hours = duration_hours - full_days * HOURS_PER_DAY;
        full_days * rate_day + remainder_hours * rate_hour
    } else {
        duration_hours * rate_hour
    };
    Quote {
        amount,
        duration_hours,
    }
}

/// Rate sanity check applied whenever rates enter the engine.
pub fn valid_rate(rate: f64) -> bool {
    rate.is_finite() && rate >= 0.0
}
