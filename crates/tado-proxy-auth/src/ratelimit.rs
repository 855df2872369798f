//! Daily quota window and rate-limit header handling.
//!
//! The upstream quota resets at noon Europe/Berlin. Usage for a token is the
//! number of request logs created strictly after the most recent reset.

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Europe::Berlin;

/// Length of the quota window advertised by the upstream, in seconds.
pub const QUOTA_WINDOW_SECS: i64 = 86_400;

const RESET_HOUR: u32 = 12;

/// The most recent quota reset at or before `now`.
pub fn ratelimit_cutoff_at(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.with_timezone(&Berlin).date_naive();
    let cutoff = berlin_at(today, RESET_HOUR);
    if now < cutoff {
        today
            .checked_sub_days(Days::new(1))
            .map(|yesterday| berlin_at(yesterday, RESET_HOUR))
            .unwrap_or(cutoff)
    } else {
        cutoff
    }
}

/// The most recent quota reset.
pub fn ratelimit_cutoff() -> DateTime<Utc> {
    ratelimit_cutoff_at(Utc::now())
}

/// Start of the Berlin calendar day containing `now`.
pub fn berlin_midnight_at(now: DateTime<Utc>) -> DateTime<Utc> {
    berlin_at(now.with_timezone(&Berlin).date_naive(), 0)
}

fn berlin_at(date: NaiveDate, hour: u32) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN));
    Berlin
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Parse the daily quota from a `RateLimit-Policy` value such as
/// `"perday";q=20000;w=86400`.
pub fn parse_daily_quota(policy: &str) -> Option<i64> {
    let mut quota = None;
    let mut window = None;

    for param in policy.split(';').skip(1) {
        let Some((key, value)) = param.trim().split_once('=') else {
            continue;
        };
        match key.trim() {
            "q" => quota = value.trim().parse::<i64>().ok(),
            "w" => window = value.trim().parse::<i64>().ok(),
            _ => {}
        }
    }

    match (quota, window) {
        (Some(q), Some(QUOTA_WINDOW_SECS)) => Some(q),
        _ => None,
    }
}

/// Aggregate quota across a set of tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaTotals {
    pub used: i64,
    pub limit: i64,
}

impl QuotaTotals {
    pub fn add(&mut self, used: i64, limit: i64) {
        self.used += used;
        self.limit += limit;
    }

    /// Calls left once the current request is counted.
    pub fn remaining_after_request(&self) -> i64 {
        (self.limit - self.used - 1).max(0)
    }

    /// `RateLimit` header value.
    pub fn ratelimit_header(&self) -> String {
        format!("\"perday\";r={}", self.remaining_after_request())
    }

    /// `RateLimit-Policy` header value.
    pub fn policy_header(&self) -> String {
        format!("\"perday\";q={};w={}", self.limit, QUOTA_WINDOW_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_cutoff_before_noon_uses_yesterday() {
        // 09:00 Berlin (CET, UTC+1)
        let now = utc("2025-01-15T08:00:00Z");
        assert_eq!(ratelimit_cutoff_at(now), utc("2025-01-14T11:00:00Z"));
    }

    #[test]
    fn test_cutoff_after_noon_uses_today() {
        // 12:00 Berlin exactly and later (CEST, UTC+2)
        assert_eq!(
            ratelimit_cutoff_at(utc("2025-07-15T10:00:00Z")),
            utc("2025-07-15T10:00:00Z")
        );
        assert_eq!(
            ratelimit_cutoff_at(utc("2025-07-15T21:30:00Z")),
            utc("2025-07-15T10:00:00Z")
        );
    }

    #[test]
    fn test_cutoff_is_idempotent() {
        let now = utc("2025-03-30T05:00:00Z");
        let cutoff = ratelimit_cutoff_at(now);
        assert_eq!(ratelimit_cutoff_at(cutoff), cutoff);
    }

    #[test]
    fn test_cutoff_across_dst_change() {
        // Morning of the spring-forward day: yesterday's noon was still CET.
        assert_eq!(
            ratelimit_cutoff_at(utc("2025-03-30T08:00:00Z")),
            utc("2025-03-29T11:00:00Z")
        );
    }

    #[test]
    fn test_berlin_midnight() {
        assert_eq!(
            berlin_midnight_at(utc("2025-07-15T21:30:00Z")),
            utc("2025-07-14T22:00:00Z")
        );
        assert_eq!(
            berlin_midnight_at(utc("2025-07-15T22:30:00Z")),
            utc("2025-07-15T22:00:00Z")
        );
    }

    #[test]
    fn test_parse_daily_quota() {
        assert_eq!(parse_daily_quota("\"perday\";q=20000;w=86400"), Some(20000));
        assert_eq!(parse_daily_quota("\"perday\"; q=100 ; w=86400"), Some(100));
        assert_eq!(parse_daily_quota("\"perhour\";q=100;w=3600"), None);
        assert_eq!(parse_daily_quota("garbage"), None);
    }

    #[test]
    fn test_quota_headers() {
        let mut totals = QuotaTotals::default();
        totals.add(3, 10);
        totals.add(2, 10);
        assert_eq!(totals.ratelimit_header(), "\"perday\";r=14");
        assert_eq!(totals.policy_header(), "\"perday\";q=20;w=86400");

        let exhausted = QuotaTotals { used: 5, limit: 5 };
        assert_eq!(exhausted.remaining_after_request(), 0);
    }
}
