//! Progress frames and the worker stdout decoder.
//!
//! Workers report progress by printing lines of the form
//! `PROGRESS:{"progress": 40, "step": "fit", "status": "running"}` on
//! stdout. Everything else they print is the result candidate: after a
//! clean exit it must parse as exactly one JSON document.
//!
//! [`decode`] is a pure function over `(state, chunk)` so it can be tested
//! without spawning processes. Frames that straddle chunk boundaries are
//! reassembled because only whole lines are ever interpreted.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Sentinel token that marks a progress line.
pub const PROGRESS_SENTINEL: &str = "PROGRESS:";

/// Status token assumed when a frame omits one.
const DEFAULT_FRAME_STATUS: &str = "running";

/// A structured mid-execution status update emitted by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressFrame {
    /// Completion percentage, clamped to `0.0..=100.0`.
    pub progress: f64,
    /// Stage label (`stage` or `step` on the wire).
    pub stage: String,
    /// Status token reported by the worker, e.g. `running`.
    pub status: String,
    /// Optional free-text detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// When the worker emitted the frame (decode time if it sent none).
    pub timestamp: Timestamp,
}

impl ProgressFrame {
    pub fn new(progress: f64, stage: impl Into<String>) -> Self {
        Self {
            progress: progress.clamp(0.0, 100.0),
            stage: stage.into(),
            status: DEFAULT_FRAME_STATUS.to_string(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Frame as it appears after the sentinel. Kept lenient: only `progress`
/// is mandatory.
#[derive(Deserialize)]
struct WireFrame {
    progress: f64,
    #[serde(default, alias = "step")]
    stage: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
}

/// Carry-over between calls to [`decode`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecoderState {
    /// Bytes of the current line that have not seen a terminator yet.
    partial: Vec<u8>,
    /// All non-frame content seen so far, terminators included.
    output: String,
}

impl DecoderState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-frame content accumulated so far (excludes the unterminated tail).
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Length of the unterminated tail currently buffered.
    pub fn pending_len(&self) -> usize {
        self.partial.len()
    }

    /// Flush the unterminated tail and return the result candidate together
    /// with a final frame if the tail was itself a progress line.
    pub fn finish(mut self) -> (Option<ProgressFrame>, String) {
        if self.partial.is_empty() {
            return (None, self.output);
        }
        let tail = std::mem::take(&mut self.partial);
        let line = String::from_utf8_lossy(&tail);
        let frame = match classify_line(&line) {
            Line::Frame(frame) => Some(frame),
            Line::Noise => None,
            Line::Output => {
                self.output.push_str(&line);
                None
            }
        };
        (frame, self.output)
    }
}

/// Feed one stdout chunk through the decoder.
///
/// Returns the frames completed by this chunk and the state to pass to the
/// next call. Malformed JSON after the sentinel is dropped silently; all
/// other lines are appended verbatim to the result candidate.
pub fn decode(mut state: DecoderState, chunk: &[u8]) -> (Vec<ProgressFrame>, DecoderState) {
    let mut frames = Vec::new();
    let mut rest = chunk;

    while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
        let (head, tail) = rest.split_at(pos + 1);
        rest = tail;

        let line_bytes = if state.partial.is_empty() {
            head.to_vec()
        } else {
            let mut joined = std::mem::take(&mut state.partial);
            joined.extend_from_slice(head);
            joined
        };
        let line = String::from_utf8_lossy(&line_bytes);

        match classify_line(&line) {
            Line::Frame(frame) => frames.push(frame),
            Line::Noise => {}
            Line::Output => state.output.push_str(&line),
        }
    }

    state.partial.extend_from_slice(rest);
    (frames, state)
}

enum Line {
    Frame(ProgressFrame),
    Noise,
    Output,
}

fn classify_line(line: &str) -> Line {
    let Some(body) = line.strip_prefix(PROGRESS_SENTINEL) else {
        return Line::Output;
    };
    let body = body.trim_end_matches(['\n', '\r']);
    match serde_json::from_str::<WireFrame>(body) {
        Ok(wire) if wire.progress.is_finite() => Line::Frame(into_frame(wire)),
        Ok(_) => {
            tracing::debug!(line = body, "Discarding progress frame with non-finite value");
            Line::Noise
        }
        Err(e) => {
            tracing::debug!(error = %e, line = body, "Discarding malformed progress frame");
            Line::Noise
        }
    }
}

fn into_frame(wire: WireFrame) -> ProgressFrame {
    ProgressFrame {
        progress: wire.progress.clamp(0.0, 100.0),
        stage: wire.stage.unwrap_or_default(),
        status: wire
            .status
            .unwrap_or_else(|| DEFAULT_FRAME_STATUS.to_string()),
        details: wire.details,
        timestamp: wire
            .timestamp
            .as_ref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now),
    }
}

/// Accept RFC 3339 strings or (fractional) Unix epoch seconds.
fn parse_timestamp(value: &serde_json::Value) -> Option<Timestamp> {
    match value {
        serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let secs = n.as_f64()?;
            let millis = (secs * 1000.0) as i64;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
