//! Hard limits. Everything here is checked synchronously, before any lock
//! is taken or journal record written.

use crate::model::Ms;

/// Max occurrences a single recurrence pattern may generate (~10 years weekly).
pub const MAX_OCCURRENCES: u32 = 520;

/// Max calendar days the expander will scan before giving up on a pattern.
pub const MAX_EXPANSION_SCAN_DAYS: u32 = 3_700;

/// Max months the monthly cursors will step before giving up.
pub const MAX_EXPANSION_SCAN_MONTHS: u32 = 240;

pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_RESOURCE: usize = 50_000;
pub const MAX_BLACKOUTS_PER_RESOURCE: usize = 4_096;
pub const MAX_SERIES_PER_TENANT: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 1_024;
pub const MAX_REASON_LEN: usize = 1_024;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// 2000-01-01T00:00:00Z — nothing in this system predates the epoch range.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single appointment span may not exceed 24 hours.
pub const MAX_SPAN_DURATION_MS: Ms = 24 * 3_600_000;

/// Availability/blocked-range queries are capped to ~400 days.
pub const MAX_QUERY_WINDOW_MS: Ms = 400 * 86_400_000;
