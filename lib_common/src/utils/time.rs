use chrono::{SecondsFormat, Utc};

/// Current UTC time as an ISO-8601 string with millisecond precision.
/// Every outbound gateway message carries one of these.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Masks the password component of a `redis://` style URL so connection
/// strings can be logged safely.
pub fn redact_url_password(url: &str) -> String {
    if let Some(scheme_end) = url.find("://") {
        let rest = &url[scheme_end + 3..];
        if let Some(at) = rest.find('@') {
            if let Some(colon) = rest[..at].find(':') {
                return format!(
                    "{}{}:***{}",
                    &url[..scheme_end + 3],
                    &rest[..colon],
                    &rest[at..]
                );
            }
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_timestamp_shape() {
        let ts = now_iso8601();
        // e.g. 2025-03-14T09:26:53.589Z
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
        assert_eq!(ts.matches(':').count(), 2);
    }

    #[test]
    fn redacts_password() {
        assert_eq!(
            redact_url_password("redis://:hunter2@host:6379/"),
            "redis://:***@host:6379/"
        );
        assert_eq!(
            redact_url_password("redis://host:6379/"),
            "redis://host:6379/"
        );
    }
}
