//! Normalization of raw provider output into tool responses.

use std::time::Duration;

use serde::Serialize;

use crate::provider::RawOutput;

/// Result of a command as handed back to the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// True if stdout or stderr was cut at the byte cap.
    pub truncated: bool,
}

impl CommandResult {
    /// Builds a result from provider output, applying `byte_cap` to each stream.
    #[must_use]
    pub fn from_raw(raw: RawOutput, byte_cap: usize, duration: Duration) -> Self {
        let (stdout, stdout_cut) = truncate_output(&raw.stdout, byte_cap);
        let (stderr, stderr_cut) = truncate_output(&raw.stderr, byte_cap);

        Self {
            exit_code: raw.exit_code,
            stdout,
            stderr,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            truncated: stdout_cut || stderr_cut,
        }
    }

    /// Returns `true` if the command exited successfully (exit code 0).
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Decodes `bytes` as (lossy) UTF-8, keeping at most `cap` bytes of input.
///
/// Returns the text and whether anything was dropped. Output of exactly `cap`
/// bytes is not truncated. A multi-byte character straddling the cap is
/// dropped whole.
#[must_use]
pub fn truncate_output(bytes: &[u8], cap: usize) -> (String, bool) {
    if bytes.len() <= cap {
        return (String::from_utf8_lossy(bytes).into_owned(), false);
    }

    let mut kept = bytes.get(..cap).unwrap_or(bytes);
    if let Err(e) = std::str::from_utf8(kept) {
        // error_len() is None only for an incomplete sequence at the very end.
        if e.error_len().is_none() {
            kept = kept.get(..e.valid_up_to()).unwrap_or(kept);
        }
    }

    (String::from_utf8_lossy(kept).into_owned(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_and_at_cap_not_truncated() {
        assert_eq!(truncate_output(b"hi\n", 10), ("hi\n".to_string(), false));
        assert_eq!(truncate_output(b"0123456789", 10), ("0123456789".to_string(), false));
        assert_eq!(truncate_output(b"", 0), (String::new(), false));
    }

    #[test]
    fn test_over_cap_truncated() {
        assert_eq!(truncate_output(b"0123456789A", 10), ("0123456789".to_string(), true));
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        // "é" is two bytes; a cap of 2 would split the second one.
        let (text, truncated) = truncate_output("aéb".as_bytes(), 2);
        assert!(truncated);
        assert_eq!(text, "a");
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let (text, truncated) = truncate_output(&[b'o', b'k', 0xff], 10);
        assert!(!truncated);
        assert_eq!(text, "ok\u{fffd}");
    }

    #[test]
    fn test_from_raw_flags_either_stream() {
        let raw = RawOutput {
            exit_code: 1,
            stdout: b"short".to_vec(),
            stderr: vec![b'x'; 20],
        };
        let result = CommandResult::from_raw(raw, 8, Duration::from_millis(1500));

        assert_eq!(result.stdout, "short");
        assert_eq!(result.stderr, "xxxxxxxx");
        assert!(result.truncated);
        assert_eq!(result.duration_ms, 1500);
        assert!(!result.success());
    }
}
