use chrono::{DateTime, TimeZone, Utc};

/// Parses an RFC 2822 `Date:` header value into UTC, `None` if it can't be
/// read as a date.
///
/// ```
/// # use tinysmtpd::time::header_date_to_utc;
/// let date_in = "Wed, 1 Dec 2021 12:01:03 +0000";
/// let date_out = "2021-12-01T12:01:03+00:00";
///
/// assert_eq!(
///     header_date_to_utc(date_in).unwrap().to_rfc3339(),
///     date_out,
///     "A valid date wasn't parsed properly"
/// );
/// ```
pub fn header_date_to_utc(date: &str) -> Option<DateTime<Utc>> {
    let epoch = mailparse::dateparse(date).ok()?;
    Utc.timestamp_opt(epoch, 0).single()
}
