//! Line parser for the encoder's progress output.
//!
//! Two formats arrive on the same streams:
//! - stats lines on stderr, `\r`-terminated:
//!   `frame=  240 fps= 60 q=28.0 size=512kB time=00:00:08.00 bitrate=...`
//! - `-progress` key/value blocks: `out_time_ms=8000000`, `out_time=00:00:08.000000`,
//!   ending each block with `progress=continue` or, once, `progress=end`.
//!
//! The input header (`Duration: 00:00:30.00, start: ...`) gives the total
//! when the caller did not supply one.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

static TIME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)time=\s*(\d+:\d{2}:\d{2}(?:\.\d+)?)").expect("time regex")
});

static DURATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d+:\d{2}:\d{2}(?:\.\d+)?)").expect("duration regex")
});

/// What one encoder line tells us.
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderLine {
    /// Media time encoded so far.
    Time(Duration),
    /// Total media duration from the input header.
    TotalDuration(Duration),
    /// End of a `-progress` block with more to come.
    Continue,
    /// Final `-progress` block.
    End,
}

pub fn try_parse_line(line: &str) -> Option<EncoderLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some((key, value)) = line.split_once('=')
        && !key.contains(char::is_whitespace)
    {
        let value = value.trim();
        match key {
            "progress" => {
                return match value {
                    "end" => Some(EncoderLine::End),
                    "continue" => Some(EncoderLine::Continue),
                    _ => None,
                };
            }
            // Despite the name, microseconds.
            "out_time_ms" | "out_time_us" => {
                return value
                    .parse::<u64>()
                    .ok()
                    .map(|us| EncoderLine::Time(Duration::from_micros(us)));
            }
            "out_time" => return parse_timestamp(value).map(EncoderLine::Time),
            _ => {}
        }
    }

    if let Some(cap) = TIME_REGEX.captures(line) {
        return cap
            .get(1)
            .and_then(|m| parse_timestamp(m.as_str()))
            .map(EncoderLine::Time);
    }

    DURATION_REGEX
        .captures(line)
        .and_then(|cap| cap.get(1))
        .and_then(|m| parse_timestamp(m.as_str()))
        .map(EncoderLine::TotalDuration)
}

/// Parse `HH:MM:SS[.frac]`. `N/A` and malformed values yield `None`.
pub fn parse_timestamp(s: &str) -> Option<Duration> {
    let mut parts = s.trim().splitn(3, ':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    let whole = hours.checked_mul(3600)?.checked_add(minutes * 60)?;
    Duration::from_secs(whole).checked_add(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_line() {
        let line = "frame=  240 fps= 60 q=28.0 size=     512kB time=00:00:08.50 bitrate= 493.5kbits/s speed=2x";
        assert_eq!(
            try_parse_line(line),
            Some(EncoderLine::Time(Duration::from_millis(8500)))
        );
    }

    #[test]
    fn test_progress_block_keys() {
        assert_eq!(
            try_parse_line("out_time_ms=12000000"),
            Some(EncoderLine::Time(Duration::from_secs(12)))
        );
        assert_eq!(
            try_parse_line("out_time=00:01:02.500000"),
            Some(EncoderLine::Time(Duration::from_millis(62_500)))
        );
        assert_eq!(try_parse_line("progress=continue"), Some(EncoderLine::Continue));
        assert_eq!(try_parse_line("progress=end\n"), Some(EncoderLine::End));
        assert_eq!(try_parse_line("bitrate=493.5kbits/s"), None);
    }

    #[test]
    fn test_duration_header() {
        let line = "  Duration: 00:00:30.00, start: 0.000000, bitrate: 1411 kb/s";
        assert_eq!(
            try_parse_line(line),
            Some(EncoderLine::TotalDuration(Duration::from_secs(30)))
        );
    }

    #[test]
    fn test_unavailable_time_is_ignored() {
        assert_eq!(try_parse_line("out_time=N/A"), None);
        assert_eq!(try_parse_line("frame=0 time=N/A bitrate=N/A"), None);
        assert_eq!(try_parse_line(""), None);
        assert_eq!(try_parse_line("Press [q] to stop"), None);
    }

    #[test]
    fn test_parse_timestamp_bounds() {
        assert_eq!(parse_timestamp("01:00:00"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_timestamp("00:61:00"), None);
        assert_eq!(parse_timestamp("00:00"), None);
    }

    #[test]
    fn test_absurd_hours_do_not_overflow() {
        assert_eq!(parse_timestamp("18446744073709551615:00:00"), None);
        assert_eq!(
            try_parse_line("frame=1 time=9999999999999999999:00:00.00 bitrate=N/A"),
            None
        );
    }
}
