//! Daily trigger arithmetic (UTC).

use chrono::{DateTime, Duration, NaiveTime, Utc};

fn on_day_of(reference: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    reference.date_naive().and_time(at).and_utc()
}

/// First trigger strictly after `now`.
pub fn next_after(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = on_day_of(now, at);
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

/// Most recent trigger at or before `now`.
pub fn previous_at_or_before(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = on_day_of(now, at);
    if today <= now {
        today
    } else {
        today - Duration::days(1)
    }
}

/// Whether a keyword missed a run and needs catching up.
///
/// A keyword that never ran is due only when `catch_up_never_run` is set.
pub fn is_due(
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    at: NaiveTime,
    period: Duration,
    catch_up_never_run: bool,
) -> bool {
    match last_run {
        None => catch_up_never_run,
        Some(last) => now >= last + period || previous_at_or_before(now, at) > last,
    }
}
