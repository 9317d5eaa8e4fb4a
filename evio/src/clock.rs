// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Wall-clock time as the runtime sees it.

use crate::error::Millis;

/// Current time as milliseconds since 1970-01-01 UTC.
///
/// Every timestamp the runtime keeps (`now`, `last_activity`, timer issue
/// times, bandwidth periods) comes from this single source.
#[must_use]
pub fn time_current() -> Millis {
    // Negative timestamps (pre-epoch clocks) clamp to zero rather than wrap.
    chrono::Utc::now().timestamp_millis().max(0) as Millis
}
