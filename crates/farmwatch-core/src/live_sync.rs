//! Wire types for the dashboard push channel.
//!
//! Every frame is a JSON text message `{"event": <kind>, "data": <body>}`.
//! Heartbeats carry no `data`.

use crate::{IssueStatus, OpsEvent, Outcome};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Notification {
    Heartbeat,
    ItemCreated(ItemCreated),
    ItemUpdated(ItemUpdated),
    RunStep(RunStep),
    RunComplete(RunComplete),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemCreated {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemUpdated {
    pub id: String,
    pub status: IssueStatus,
    #[serde(default)]
    pub outcome: Option<Outcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunStep {
    pub run_id: String,
    pub status: String,
    pub step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunComplete {
    pub run_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
}

/// Which subtree filter a notification must pass before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    /// Always delivered.
    Global,
    /// Delivered when the item is inside the client's root subtree.
    Item(&'a str),
    /// Delivered when the owning issue is unknown or inside the subtree.
    Run(Option<&'a str>),
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Heartbeat => "heartbeat",
            Notification::ItemCreated(_) => "item-created",
            Notification::ItemUpdated(_) => "item-updated",
            Notification::RunStep(_) => "run-step",
            Notification::RunComplete(_) => "run-complete",
        }
    }

    /// The id whose relative order must be preserved on delivery.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Notification::Heartbeat => None,
            Notification::ItemCreated(body) => Some(&body.id),
            Notification::ItemUpdated(body) => Some(&body.id),
            Notification::RunStep(body) => Some(&body.run_id),
            Notification::RunComplete(body) => Some(&body.run_id),
        }
    }

    pub fn scope(&self) -> Scope<'_> {
        match self {
            Notification::Heartbeat => Scope::Global,
            Notification::ItemCreated(body) => Scope::Item(&body.id),
            Notification::ItemUpdated(body) => Scope::Item(&body.id),
            Notification::RunStep(body) => Scope::Run(body.issue_id.as_deref()),
            Notification::RunComplete(body) => Scope::Run(body.issue_id.as_deref()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_notification(
    notification: &Notification,
    max_frame_bytes: usize,
) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(notification).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_notification(text: &str, max_frame_bytes: usize) -> Result<Notification, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

const ITEM_CREATE_TYPES: &[&str] = &["issue.create"];
const ITEM_UPDATE_TYPES: &[&str] = &[
    "issue.update",
    "issue.status",
    "issue.close",
    "issue.claim",
    "issue.open",
];
const RUN_STEP_TYPES: &[&str] = &["dag.run.step", "run.step"];
const RUN_COMPLETE_TYPES: &[&str] = &["dag.run.end", "dag.run.complete", "run.complete"];

/// Maps one appended event to the notification it implies, if any.
///
/// `lookup` resolves the current status/outcome of an issue from the store;
/// the event payload is used when the issue is not (yet) visible.
pub fn notification_for_event<F>(event: &OpsEvent, lookup: F) -> Option<Notification>
where
    F: FnOnce(&str) -> Option<(IssueStatus, Option<Outcome>)>,
{
    if event.is_diagnostic() {
        return None;
    }
    let kind = event.event_type.as_str();
    if ITEM_CREATE_TYPES.contains(&kind) {
        let id = event_issue_id(event)?;
        return Some(Notification::ItemCreated(ItemCreated { id }));
    }
    if ITEM_UPDATE_TYPES.contains(&kind) {
        let id = event_issue_id(event)?;
        let (status, outcome) = lookup(&id).unwrap_or_else(|| {
            let status = event
                .payload_str("status")
                .map(|raw| IssueStatus::from(raw.to_string()))
                .unwrap_or_default();
            let outcome = event
                .payload_str("outcome")
                .map(|raw| Outcome::from(raw.to_string()));
            (status, outcome)
        });
        return Some(Notification::ItemUpdated(ItemUpdated {
            id,
            status,
            outcome,
        }));
    }
    if RUN_STEP_TYPES.contains(&kind) {
        let run_id = event.run_id.clone()?;
        let status = event.payload_str("status").unwrap_or("running").to_string();
        let step = event
            .payload
            .get("step")
            .and_then(|value| value.as_u64())
            .unwrap_or(0);
        return Some(Notification::RunStep(RunStep {
            run_id,
            status,
            step,
            issue_id: event.issue_id.clone(),
        }));
    }
    if RUN_COMPLETE_TYPES.contains(&kind) {
        let run_id = event.run_id.clone()?;
        let status = event.payload_str("status").unwrap_or("complete").to_string();
        return Some(Notification::RunComplete(RunComplete {
            run_id,
            status,
            issue_id: event.issue_id.clone(),
        }));
    }
    None
}

fn event_issue_id(event: &OpsEvent) -> Option<String> {
    event
        .issue_id
        .clone()
        .or_else(|| event.payload_str("id").map(str::to_string))
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn event(kind: &str, issue_id: Option<&str>, run_id: Option<&str>, payload: Value) -> OpsEvent {
        OpsEvent {
            v: 1,
            ts_ms: 1,
            event_type: kind.to_string(),
            source: "test".to_string(),
            payload,
            issue_id: issue_id.map(str::to_string),
            run_id: run_id.map(str::to_string),
            diagnostic: None,
        }
    }

    #[test]
    fn heartbeat_has_no_data_field() {
        let text = encode_notification(&Notification::Heartbeat, DEFAULT_MAX_FRAME_BYTES)
            .expect("encode");
        assert_eq!(text, r#"{"event":"heartbeat"}"#);
        let back = decode_notification(&text, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(back, Notification::Heartbeat);
    }

    #[test]
    fn item_updated_wire_shape() {
        let notification = Notification::ItemUpdated(ItemUpdated {
            id: "a1".to_string(),
            status: IssueStatus::Closed,
            outcome: Some(Outcome::Failure),
        });
        let value: Value = serde_json::from_str(
            &encode_notification(&notification, DEFAULT_MAX_FRAME_BYTES).expect("encode"),
        )
        .expect("json");
        assert_eq!(
            value,
            json!({"event": "item-updated", "data": {"id": "a1", "status": "closed", "outcome": "failure"}})
        );
        assert_eq!(notification.correlation_id(), Some("a1"));
        assert_eq!(notification.scope(), Scope::Item("a1"));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let notification = Notification::ItemCreated(ItemCreated {
            id: "x".repeat(100),
        });
        assert!(matches!(
            encode_notification(&notification, 32),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn update_events_prefer_store_state() {
        let source = event("issue.close", Some("a"), None, json!({"outcome": "success"}));
        let from_store = notification_for_event(&source, |_| {
            Some((IssueStatus::Closed, Some(Outcome::Expanded)))
        });
        assert_eq!(
            from_store,
            Some(Notification::ItemUpdated(ItemUpdated {
                id: "a".to_string(),
                status: IssueStatus::Closed,
                outcome: Some(Outcome::Expanded),
            }))
        );

        let from_payload = notification_for_event(
            &event("issue.status", Some("b"), None, json!({"status": "in_progress"})),
            |_| None,
        );
        assert_eq!(
            from_payload,
            Some(Notification::ItemUpdated(ItemUpdated {
                id: "b".to_string(),
                status: IssueStatus::InProgress,
                outcome: None,
            }))
        );
    }

    #[test]
    fn run_events_map_to_step_and_complete() {
        let step = notification_for_event(
            &event("dag.run.step", Some("a"), Some("r1"), json!({"status": "running", "step": 3})),
            |_| None,
        );
        assert_eq!(
            step,
            Some(Notification::RunStep(RunStep {
                run_id: "r1".to_string(),
                status: "running".to_string(),
                step: 3,
                issue_id: Some("a".to_string()),
            }))
        );
        let done = notification_for_event(
            &event("dag.run.end", None, Some("r1"), json!({"status": "failed"})),
            |_| None,
        );
        assert_eq!(
            done.as_ref().map(Notification::scope),
            Some(Scope::Run(None))
        );
        assert_eq!(done.as_ref().map(Notification::name), Some("run-complete"));
    }

    #[test]
    fn unrelated_and_malformed_events_are_ignored() {
        assert_eq!(
            notification_for_event(&event("system.tick", None, None, json!({})), |_| None),
            None
        );
        let mut broken = event("issue.create", Some("a"), None, json!({}));
        broken.diagnostic = Some("missing or invalid fields: v".to_string());
        assert_eq!(notification_for_event(&broken, |_| None), None);
        assert_eq!(
            notification_for_event(&event("run.step", None, None, json!({})), |_| None),
            None
        );
    }
}
