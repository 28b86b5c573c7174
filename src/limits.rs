use crate::model::Ms;

pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_INTERVALS_PER_RESOURCE: usize = 100_000;
pub const MAX_SUBSCRIPTIONS_PER_USER: usize = 1_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// Roughly ten years.
pub const MAX_SPAN_DURATION_MS: Ms = 10 * 366 * 24 * 3_600_000;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 256;
