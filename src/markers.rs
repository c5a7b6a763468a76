//! Marker payloads and their wire format.
//!
//! A marker is a named, categorized point or interval injected by application
//! code. The hot-path entry points live in the crate root (they gate on the
//! racy flags word and write straight to the core ring buffer); this module
//! owns the payload data model and its byte serialization inside marker
//! blocks. Times in payloads are milliseconds since the process start
//! reference, converted from `Instant`s at construction.

use std::time::Instant;

use crate::time::ms_since_start;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TracingKind {
    Event = 0,
    IntervalStart = 1,
    IntervalEnd = 2,
}

impl TracingKind {
    fn from_u8(value: u8) -> TracingKind {
        match value {
            1 => TracingKind::IntervalStart,
            2 => TracingKind::IntervalEnd,
            _ => TracingKind::Event,
        }
    }

    pub(crate) fn interval(self) -> Option<&'static str> {
        match self {
            TracingKind::Event => None,
            TracingKind::IntervalStart => Some("start"),
            TracingKind::IntervalEnd => Some("end"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum MarkerDetails {
    #[default]
    None,
    Text(String),
    Tracing {
        category: String,
        kind: TracingKind,
    },
}

/// Optional data attached to a marker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkerPayload {
    pub(crate) start_time: Option<f64>,
    pub(crate) end_time: Option<f64>,
    pub(crate) inner_window_id: Option<u64>,
    pub(crate) details: MarkerDetails,
    /// Frame locations of an attached backtrace, oldest first.
    pub(crate) cause: Option<Vec<String>>,
}

impl MarkerPayload {
    pub fn text(text: impl Into<String>) -> Self {
        MarkerPayload {
            details: MarkerDetails::Text(text.into()),
            ..Default::default()
        }
    }

    pub fn tracing(category: impl Into<String>, kind: TracingKind) -> Self {
        MarkerPayload {
            details: MarkerDetails::Tracing {
                category: category.into(),
                kind,
            },
            ..Default::default()
        }
    }

    pub fn with_start(mut self, start: Instant) -> Self {
        self.start_time = Some(ms_since_start(start));
        self
    }

    pub fn with_end(mut self, end: Instant) -> Self {
        self.end_time = Some(ms_since_start(end));
        self
    }

    pub fn with_interval(self, start: Instant, end: Instant) -> Self {
        self.with_start(start).with_end(end)
    }

    pub fn with_inner_window_id(mut self, id: u64) -> Self {
        self.inner_window_id = Some(id);
        self
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        encode_opt_f64(out, self.start_time);
        encode_opt_f64(out, self.end_time);
        match self.inner_window_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_le_bytes());
            }
            None => out.push(0),
        }
        match &self.details {
            MarkerDetails::None => out.push(0),
            MarkerDetails::Text(text) => {
                out.push(1);
                encode_str(out, text);
            }
            MarkerDetails::Tracing { category, kind } => {
                out.push(2);
                encode_str(out, category);
                out.push(*kind as u8);
            }
        }
        match &self.cause {
            Some(frames) => {
                out.push(1);
                out.extend_from_slice(&(frames.len() as u16).to_le_bytes());
                for frame in frames {
                    encode_str(out, frame);
                }
            }
            None => out.push(0),
        }
    }

    pub(crate) fn decode(bytes: &[u8], offset: &mut usize) -> Option<MarkerPayload> {
        let start_time = decode_opt_f64(bytes, offset)?;
        let end_time = decode_opt_f64(bytes, offset)?;
        let inner_window_id = match take(bytes, offset, 1)?[0] {
            0 => None,
            _ => Some(u64::from_le_bytes(take(bytes, offset, 8)?.try_into().ok()?)),
        };
        let details = match take(bytes, offset, 1)?[0] {
            1 => MarkerDetails::Text(decode_str(bytes, offset)?),
            2 => {
                let category = decode_str(bytes, offset)?;
                let kind = TracingKind::from_u8(take(bytes, offset, 1)?[0]);
                MarkerDetails::Tracing { category, kind }
            }
            _ => MarkerDetails::None,
        };
        let cause = match take(bytes, offset, 1)?[0] {
            0 => None,
            _ => {
                let count = u16::from_le_bytes(take(bytes, offset, 2)?.try_into().ok()?);
                let mut frames = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    frames.push(decode_str(bytes, offset)?);
                }
                Some(frames)
            }
        };
        Some(MarkerPayload {
            start_time,
            end_time,
            inner_window_id,
            details,
            cause,
        })
    }
}

fn encode_opt_f64(out: &mut Vec<u8>, value: Option<f64>) {
    match value {
        Some(v) => {
            out.push(1);
            out.extend_from_slice(&v.to_le_bytes());
        }
        None => out.push(0),
    }
}

fn decode_opt_f64(bytes: &[u8], offset: &mut usize) -> Option<Option<f64>> {
    match take(bytes, offset, 1)?[0] {
        0 => Some(None),
        _ => Some(Some(f64::from_le_bytes(
            take(bytes, offset, 8)?.try_into().ok()?,
        ))),
    }
}

fn encode_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&bytes[..len]);
}

fn decode_str(bytes: &[u8], offset: &mut usize) -> Option<String> {
    let len = u16::from_le_bytes(take(bytes, offset, 2)?.try_into().ok()?);
    let raw = take(bytes, offset, len as usize)?;
    Some(String::from_utf8_lossy(raw).into_owned())
}

pub(crate) fn take<'a>(bytes: &'a [u8], offset: &mut usize, n: usize) -> Option<&'a [u8]> {
    let end = offset.checked_add(n)?;
    if end > bytes.len() {
        return None;
    }
    let slice = &bytes[*offset..end];
    *offset = end;
    Some(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(payload: &MarkerPayload) -> MarkerPayload {
        let mut bytes = Vec::new();
        payload.encode_into(&mut bytes);
        let mut offset = 0;
        let decoded = MarkerPayload::decode(&bytes, &mut offset).unwrap();
        assert_eq!(offset, bytes.len());
        decoded
    }

    #[test]
    fn empty_payload() {
        assert_eq!(round_trip(&MarkerPayload::default()), MarkerPayload::default());
    }

    #[test]
    fn text_payload_with_times() {
        let payload = MarkerPayload {
            start_time: Some(1.5),
            end_time: Some(3.25),
            inner_window_id: Some(7),
            details: MarkerDetails::Text("loading index".into()),
            cause: None,
        };
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn tracing_payload_with_cause() {
        let payload = MarkerPayload {
            details: MarkerDetails::Tracing {
                category: "Navigation".into(),
                kind: TracingKind::IntervalStart,
            },
            cause: Some(vec!["request_loop".into(), "parse_headers".into()]),
            ..Default::default()
        };
        assert_eq!(round_trip(&payload), payload);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let mut bytes = Vec::new();
        MarkerPayload::text("hello").encode_into(&mut bytes);
        for cut in 0..bytes.len() {
            let mut offset = 0;
            assert!(MarkerPayload::decode(&bytes[..cut], &mut offset).is_none());
        }
    }
}
