//! Extraction of the terminal `{"type":"result",...}` JSON record from a
//! persisted execution log blob (spec.md §4.7). Grounded on the teacher's
//! `stream_json.rs` NDJSON line parsing, adapted from a forward streaming
//! read to a backward scan over an already-persisted blob: the log can
//! interleave plain stdout lines with JSON lines, a timestamp prefix, or a
//! `stderr:`-style tag, so the scan walks from the last line upward
//! looking for the first line that yields a parseable result object.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::errors::ResultParseError;
use crate::models::{ConversationId, ConversationResult};

/// Matches an optional `[HH:MM:SS] ` timestamp prefix and an optional
/// `word: ` tag prefix, capturing the remaining `{...}` object.
static RESULT_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\[\d{2}:\d{2}:\d{2}\]\s*)?(?:\w+:\s*)?(\{.*\})\s*$").unwrap()
});

pub struct ResultParser;

impl ResultParser {
    /// Scans `blob` from the last line upward for the terminal result
    /// record and builds a [`ConversationResult`] from it. `type`/
    /// `subtype`/`is_error`/non-empty-`session_id` is the per-line
    /// acceptance predicate (spec.md §4.7): a JSON line that fails it is
    /// not a candidate at all, so the scan keeps walking past it rather
    /// than stopping there. The first line from the tail that passes is
    /// the result.
    pub fn parse(
        blob: &str,
        conversation_id: ConversationId,
    ) -> Result<ConversationResult, ResultParseError> {
        blob.lines()
            .rev()
            .find_map(|line| Self::as_result_record(line, conversation_id))
            .ok_or(ResultParseError::NotFound)
    }

    fn as_result_record(line: &str, conversation_id: ConversationId) -> Option<ConversationResult> {
        let raw = Self::extract_json_object(line)?;

        if raw.get("type").and_then(Value::as_str) != Some("result") {
            return None;
        }
        let subtype = raw.get("subtype").and_then(Value::as_str)?.to_string();
        let is_error = raw.get("is_error").and_then(Value::as_bool)?;
        let session_id = raw.get("session_id").and_then(Value::as_str)?;
        if session_id.is_empty() {
            return None;
        }

        let duration_ms = raw.get("duration_ms").and_then(Value::as_u64);
        let total_cost_usd = raw.get("total_cost_usd").and_then(Value::as_f64);

        Some(ConversationResult {
            conversation_id,
            result_type: "result".to_string(),
            subtype,
            is_error,
            session_id: session_id.to_string(),
            duration_ms,
            total_cost_usd,
            raw,
        })
    }

    /// Tries the regex first (handles timestamp/tag-prefixed lines), then
    /// falls back to a bare `{`...`}` check, per spec.md §4.7.
    fn extract_json_object(line: &str) -> Option<Value> {
        let line = line.trim();
        if let Some(caps) = RESULT_LINE_RE.captures(line) {
            if let Some(m) = caps.get(1) {
                if let Ok(v) = serde_json::from_str::<Value>(m.as_str()) {
                    return Some(v);
                }
            }
        }
        if line.starts_with('{') && line.ends_with('}') {
            if let Ok(v) = serde_json::from_str::<Value>(line) {
                return Some(v);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_line(is_error: bool) -> String {
        format!(
            r#"{{"type":"result","subtype":"success","is_error":{is_error},"session_id":"sess-1","duration_ms":1234,"total_cost_usd":0.05}}"#
        )
    }

    #[test]
    fn parses_bare_result_line() {
        let blob = format!("some stdout\nmore stdout\n{}\n", result_line(false));
        let result = ResultParser::parse(&blob, 7).unwrap();
        assert_eq!(result.conversation_id, 7);
        assert_eq!(result.result_type, "result");
        assert_eq!(result.subtype, "success");
        assert!(!result.is_error);
        assert_eq!(result.session_id, "sess-1");
        assert_eq!(result.duration_ms, Some(1234));
        assert_eq!(result.total_cost_usd, Some(0.05));
    }

    #[test]
    fn parses_timestamp_prefixed_line() {
        let blob = format!("[00:00:01] {}", result_line(false));
        let result = ResultParser::parse(&blob, 1).unwrap();
        assert_eq!(result.subtype, "success");
    }

    #[test]
    fn parses_tag_prefixed_line() {
        let blob = format!("stdout: {}", result_line(true));
        let result = ResultParser::parse(&blob, 1).unwrap();
        assert!(result.is_error);
    }

    #[test]
    fn scans_from_the_end_picking_the_last_result_record() {
        let first = r#"{"type":"result","subtype":"error_max_turns","is_error":true,"session_id":"old"}"#;
        let blob = format!("{}\nsome noise in between\n{}\n", first, result_line(false));
        let result = ResultParser::parse(&blob, 1).unwrap();
        assert_eq!(result.session_id, "sess-1");
    }

    #[test]
    fn non_result_json_lines_are_skipped() {
        let assistant_line = r#"{"type":"assistant","message":{"content":[]}}"#;
        let blob = format!("{}\n{}\n", assistant_line, result_line(false));
        let result = ResultParser::parse(&blob, 1).unwrap();
        assert_eq!(result.result_type, "result");
    }

    #[test]
    fn missing_result_record_is_not_found() {
        let blob = "just plain stdout\nwith no json at all\n";
        let err = ResultParser::parse(blob, 1).unwrap_err();
        assert!(matches!(err, ResultParseError::NotFound));
    }

    #[test]
    fn result_record_missing_required_field_is_skipped_not_erred() {
        let blob = r#"{"type":"result","subtype":"success"}"#;
        let err = ResultParser::parse(blob, 1).unwrap_err();
        assert!(matches!(err, ResultParseError::NotFound));
    }

    #[test]
    fn a_trailing_malformed_result_line_does_not_hide_the_genuine_one_above_it() {
        let trailing = r#"{"type":"result","subtype":"success"}"#; // missing is_error/session_id
        let blob = format!("{}\n{}\n", result_line(false), trailing);
        let result = ResultParser::parse(&blob, 1).unwrap();
        assert_eq!(result.session_id, "sess-1");
    }

    #[test]
    fn empty_session_id_is_rejected() {
        let blob = r#"{"type":"result","subtype":"success","is_error":false,"session_id":""}"#;
        let err = ResultParser::parse(blob, 1).unwrap_err();
        assert!(matches!(err, ResultParseError::NotFound));
    }

    #[test]
    fn empty_blob_is_not_found() {
        let err = ResultParser::parse("", 1).unwrap_err();
        assert!(matches!(err, ResultParseError::NotFound));
    }
}
