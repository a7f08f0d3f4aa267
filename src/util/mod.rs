pub mod clock;
pub(crate) mod retry;
pub(crate) mod runnable;

/// Formats an instant the way `lastPerformed` is persisted (RFC 1123, GMT).
pub(crate) fn format_http_date(instant: &chrono::DateTime<chrono::Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parses an RFC 1123 timestamp; `None` for anything else.
pub(crate) fn parse_http_date(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|instant| instant.with_timezone(&chrono::Utc))
}
