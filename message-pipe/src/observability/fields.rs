//! Formatting helpers for structured log fields.

use crate::session::SessionId;
use std::time::Duration;

pub fn format_target(target: Option<&SessionId>) -> String {
    match target {
        Some(session_id) => session_id.to_string(),
        None => "-".to_string(),
    }
}

pub fn format_elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::{format_elapsed_ms, format_target};
    use crate::session::SessionId;
    use std::time::Duration;

    #[test]
    fn missing_target_renders_as_dash() {
        assert_eq!(format_target(None), "-");
        assert_eq!(format_target(Some(&SessionId::from("s-1"))), "s-1");
    }

    #[test]
    fn elapsed_is_whole_milliseconds() {
        assert_eq!(format_elapsed_ms(Duration::from_micros(1_500)), 1);
    }
}
