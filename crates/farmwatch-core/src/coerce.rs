//! Ingestion boundary: raw JSONL lines to typed records.
//!
//! Issue and forum lines are strict (a bad line fails the whole file load).
//! Event lines are tolerant: every line yields an [`OpsEvent`], with
//! defaulted fields and a diagnostic when the line is malformed.

use crate::{
    Dep, ExecutionSpec, ForumMessage, IssueStatus, OpsEvent, Outcome, Record, RecordKind,
    WorkItem, DEFAULT_PRIORITY,
};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

pub const PARSE_ERROR_TYPE: &str = "parse_error";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoerceError {
    #[error("invalid json: {0}")]
    Json(String),
    #[error("expected a json object")]
    NotObject,
    #[error("missing or invalid field: {0}")]
    Field(&'static str),
    #[error("invalid utf-8: {0}")]
    Utf8(String),
}

/// Decodes one non-blank line of the given store.
pub fn decode_line(kind: RecordKind, line: &str, source: &str) -> Result<Record, CoerceError> {
    match kind {
        RecordKind::Issue => parse_object(line).and_then(coerce_work_item).map(Record::Issue),
        RecordKind::Message => parse_object(line)
            .and_then(coerce_forum_message)
            .map(Record::Message),
        RecordKind::Event => Ok(Record::Event(coerce_event_line(line, source))),
    }
}

/// Byte-level entry point: issue and forum lines must be UTF-8, event lines
/// with bad bytes become `parse_error` records.
pub fn decode_line_bytes(
    kind: RecordKind,
    line: &[u8],
    source: &str,
) -> Result<Record, CoerceError> {
    match std::str::from_utf8(line) {
        Ok(text) => decode_line(kind, text, source),
        Err(err) => match kind {
            RecordKind::Event => Ok(Record::Event(OpsEvent {
                v: 0,
                ts_ms: 0,
                event_type: PARSE_ERROR_TYPE.to_string(),
                source: source.to_string(),
                payload: Value::String(String::from_utf8_lossy(line).into_owned()),
                issue_id: None,
                run_id: None,
                diagnostic: Some(format!("invalid utf-8: {err}")),
            })),
            RecordKind::Issue | RecordKind::Message => Err(CoerceError::Utf8(err.to_string())),
        },
    }
}

fn parse_object(line: &str) -> Result<Map<String, Value>, CoerceError> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(CoerceError::NotObject),
        Err(err) => Err(CoerceError::Json(err.to_string())),
    }
}

pub fn coerce_work_item(mut map: Map<String, Value>) -> Result<WorkItem, CoerceError> {
    let id = match map.remove("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id,
        _ => return Err(CoerceError::Field("id")),
    };
    let title = take_string(&mut map, "title");
    let body = take_string(&mut map, "body");
    let status = match map.remove("status") {
        Some(Value::String(raw)) => IssueStatus::from(raw),
        _ => IssueStatus::Open,
    };
    let outcome = match map.remove("outcome") {
        Some(Value::String(raw)) if !raw.trim().is_empty() => Some(Outcome::from(raw)),
        _ => None,
    };
    let priority = map
        .remove("priority")
        .and_then(|value| value.as_u64())
        .and_then(|value| u32::try_from(value).ok())
        .unwrap_or(DEFAULT_PRIORITY);
    let deps = match map.remove("deps") {
        Some(Value::Array(entries)) => entries.iter().filter_map(coerce_dep).collect(),
        _ => Vec::new(),
    };
    let tags = match map.remove("tags") {
        Some(Value::Array(entries)) => {
            let mut seen = HashSet::new();
            entries
                .into_iter()
                .filter_map(|value| match value {
                    Value::String(tag) => Some(tag),
                    _ => None,
                })
                .filter(|tag| seen.insert(tag.clone()))
                .collect()
        }
        _ => Vec::new(),
    };
    let created_at = take_f64(&mut map, "created_at");
    let updated_at = take_f64(&mut map, "updated_at");
    let execution_spec = match map.remove("execution_spec") {
        Some(Value::Object(spec)) => Some(coerce_execution_spec(spec)),
        _ => None,
    };

    Ok(WorkItem {
        id,
        title,
        body,
        status,
        outcome,
        priority,
        deps,
        tags,
        created_at,
        updated_at,
        execution_spec,
        extra: map,
    })
}

fn coerce_dep(value: &Value) -> Option<Dep> {
    let kind = value.get("type")?.as_str()?;
    let target = value.get("target")?.as_str()?;
    Some(Dep {
        kind: kind.to_string(),
        target: target.to_string(),
    })
}

fn coerce_execution_spec(mut map: Map<String, Value>) -> ExecutionSpec {
    let mut optional = |key: &str| match map.remove(key) {
        Some(Value::String(value)) => Some(value),
        _ => None,
    };
    let role = optional("role");
    let cli = optional("cli");
    let model = optional("model");
    ExecutionSpec {
        role,
        cli,
        model,
        extra: map,
    }
}

pub fn coerce_forum_message(mut map: Map<String, Value>) -> Result<ForumMessage, CoerceError> {
    let topic = match map.remove("topic") {
        Some(Value::String(topic)) if !topic.trim().is_empty() => topic,
        _ => return Err(CoerceError::Field("topic")),
    };
    let id = match map.remove("id") {
        Some(Value::String(id)) => Some(id),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let author = take_string(&mut map, "author");
    let body = take_string(&mut map, "body");
    let created_at_ms = normalize_forum_timestamp(&mut map);
    Ok(ForumMessage {
        id,
        topic,
        author,
        body,
        created_at_ms,
        extra: map,
    })
}

/// `created_at_ms` (milliseconds) wins; otherwise `created_at` is seconds.
fn normalize_forum_timestamp(map: &mut Map<String, Value>) -> i64 {
    let millis = map.remove("created_at_ms").and_then(|value| value.as_f64());
    let seconds = map.remove("created_at").and_then(|value| value.as_f64());
    match (millis, seconds) {
        (Some(ms), _) => ms as i64,
        (None, Some(secs)) => (secs * 1000.0) as i64,
        (None, None) => 0,
    }
}

/// Never fails: malformed lines come back as records carrying a diagnostic.
pub fn coerce_event_line(line: &str, source: &str) -> OpsEvent {
    match serde_json::from_str::<Value>(line) {
        Ok(value) => coerce_event_value(value, source),
        Err(err) => OpsEvent {
            v: 0,
            ts_ms: 0,
            event_type: PARSE_ERROR_TYPE.to_string(),
            source: source.to_string(),
            payload: Value::String(line.to_string()),
            issue_id: None,
            run_id: None,
            diagnostic: Some(format!("json: {err}")),
        },
    }
}

pub fn coerce_event_value(value: Value, source: &str) -> OpsEvent {
    let mut invalid: Vec<&'static str> = Vec::new();
    let v = match value.get("v").and_then(Value::as_u64).map(u32::try_from) {
        Some(Ok(v)) => v,
        _ => {
            invalid.push("v");
            0
        }
    };
    let ts_ms = match value.get("ts_ms").and_then(Value::as_i64) {
        Some(ts) => ts,
        None => {
            invalid.push("ts_ms");
            0
        }
    };
    let event_type = match value.get("type").and_then(Value::as_str) {
        Some(kind) if !kind.is_empty() => kind.to_string(),
        _ => {
            invalid.push("type");
            PARSE_ERROR_TYPE.to_string()
        }
    };
    let source_label = match value.get("source").and_then(Value::as_str) {
        Some(label) if !label.is_empty() => label.to_string(),
        _ => {
            invalid.push("source");
            source.to_string()
        }
    };
    let payload = match value.get("payload") {
        Some(payload) => Some(payload.clone()),
        None => {
            invalid.push("payload");
            None
        }
    };
    let issue_id = value.get("issue_id").and_then(Value::as_str).map(str::to_string);
    let run_id = value.get("run_id").and_then(Value::as_str).map(str::to_string);

    let diagnostic = if invalid.is_empty() {
        None
    } else {
        Some(format!("missing or invalid fields: {}", invalid.join(", ")))
    };

    OpsEvent {
        v,
        ts_ms,
        event_type,
        source: source_label,
        payload: payload.unwrap_or(value),
        issue_id,
        run_id,
        diagnostic,
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> String {
    match map.remove(key) {
        Some(Value::String(value)) => value,
        _ => String::new(),
    }
}

fn take_f64(map: &mut Map<String, Value>, key: &str) -> f64 {
    map.remove(key)
        .and_then(|value| value.as_f64())
        .unwrap_or(0.0)
}
