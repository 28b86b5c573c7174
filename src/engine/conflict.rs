use crate::limits::*;
use crate::model::*;

use super::EngineError;
use super::store::ResourceState;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Turn caller bounds into a span, enforcing `end > start` and the global limits.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end).ok_or(EngineError::InvalidRange { start, end })?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// Intervals on one resource never overlap, free or booked. Bookings consume
/// whole intervals, so this alone keeps active bookings disjoint.
pub(crate) fn check_no_overlap(rs: &ResourceState, span: &Span) -> Result<(), EngineError> {
    match rs.overlapping(span).next() {
        Some((_, existing)) => Err(EngineError::Overlapping(*existing)),
        None => Ok(()),
    }
}
