//! Wall-clock helpers. `FAKE_TIME` exists solely to make signing
//! reproducible in tests; it must be propagated unchanged into the `gpg`
//! invocation that does the actual signing.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, Utc};

/// Current time in whole seconds since the epoch, unless `FAKE_TIME` is set.
pub fn sig_time() -> i64 {
    if let Ok(fake) = std::env::var("FAKE_TIME") {
        if let Ok(v) = fake.parse::<i64>() {
            return v;
        }
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn to_utc(epoch_secs: i64) -> DateTime<Utc> {
    let naive = NaiveDateTime::from_timestamp_opt(epoch_secs, 0).unwrap_or_default();
    DateTime::from_naive_utc_and_offset(naive, Utc)
}

/// `2019-02-26 04:25:15 UTC`, as embedded in the branch-timestamp trailer.
pub fn iso_utc(epoch_secs: i64) -> String {
    to_utc(epoch_secs).format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// `2019-03-11 16:55:00 UTC`-style string from a filesystem mtime.
pub fn iso_utc_from_system_time(t: SystemTime) -> String {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    iso_utc(secs)
}

/// RFC 2822 date in UTC, as used in the `Date:` header of the SMTP request.
pub fn rfc2822_utc_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S +0000").to_string()
}
