use crate::model::{IntervalId, Ms, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Resource,
    Interval,
    Booking,
    Subscription,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Entity::Resource => "resource",
            Entity::Interval => "interval",
            Entity::Booking => "booking",
            Entity::Subscription => "subscription",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Entity, u64),
    InvalidRange { start: Ms, end: Ms },
    InvalidRate,
    /// Lost the race: the interval is already booked.
    Conflict(IntervalId),
    /// New availability would overlap an existing interval.
    Overlapping(IntervalId),
    /// Interval is booked or referenced by a booking and cannot be withdrawn.
    InUse(IntervalId),
    Inactive(ResourceId),
    LimitExceeded(&'static str),
    /// Persistence failure. The transaction was not applied.
    WalError(String),
}

impl EngineError {
    /// Only storage failures are worth retrying verbatim. A `Conflict` means
    /// the caller must re-query availability instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(entity, id) => write!(f, "{entity} not found: {id}"),
            EngineError::InvalidRange { start, end } => {
                write!(f, "invalid range [{start}, {end})")
            }
            EngineError::InvalidRate => write!(f, "rates must be finite and non-negative"),
            EngineError::Conflict(id) => write!(f, "interval {id} is already booked"),
            EngineError::Overlapping(id) => write!(f, "overlaps existing interval {id}"),
            EngineError::InUse(id) => write!(f, "interval {id} is referenced by a booking"),
            EngineError::Inactive(id) => write!(f, "resource {id} is not active"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
