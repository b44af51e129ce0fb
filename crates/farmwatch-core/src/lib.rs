use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub mod coerce;
pub mod dashboard;
pub mod live_sync;

/// Directory under the store root that holds the record files.
pub const STORE_MARKER_DIR: &str = ".inshallah";
pub const ISSUES_FILE: &str = "issues.jsonl";
pub const FORUM_FILE: &str = "forum.jsonl";
pub const EVENTS_FILE: &str = "events.jsonl";

pub const PARENT_EDGE: &str = "parent";
pub const DEFAULT_PRIORITY: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IssueStatus {
    #[default]
    Open,
    InProgress,
    Closed,
    Other(String),
}

impl IssueStatus {
    pub fn as_str(&self) -> &str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Closed => "closed",
            IssueStatus::Other(raw) => raw.as_str(),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, IssueStatus::Closed)
    }
}

impl From<String> for IssueStatus {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "open" => IssueStatus::Open,
            "in_progress" | "in-progress" | "inprogress" => IssueStatus::InProgress,
            "closed" => IssueStatus::Closed,
            _ => IssueStatus::Other(value),
        }
    }
}

impl From<IssueStatus> for String {
    fn from(value: IssueStatus) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for IssueStatus {
    type Err = std::convert::Infallible;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(IssueStatus::from(input.to_string()))
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Outcome {
    Success,
    Failure,
    Expanded,
    Skipped,
    Other(String),
}

impl Outcome {
    pub fn as_str(&self) -> &str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Expanded => "expanded",
            Outcome::Skipped => "skipped",
            Outcome::Other(raw) => raw.as_str(),
        }
    }
}

impl From<String> for Outcome {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().as_str() {
            "success" => Outcome::Success,
            "failure" => Outcome::Failure,
            "expanded" => Outcome::Expanded,
            "skipped" => Outcome::Skipped,
            _ => Outcome::Other(value),
        }
    }
}

impl From<Outcome> for String {
    fn from(value: Outcome) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed dependency edge, e.g. `{"type": "parent", "target": "abc"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dep {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub body: String,
    pub status: IssueStatus,
    pub outcome: Option<Outcome>,
    pub priority: u32,
    pub deps: Vec<Dep>,
    pub tags: Vec<String>,
    pub created_at: f64,
    pub updated_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_spec: Option<ExecutionSpec>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkItem {
    /// Targets of every `parent` edge, in edge order.
    pub fn parent_ids(&self) -> impl Iterator<Item = &str> {
        self.deps
            .iter()
            .filter(|dep| dep.kind == PARENT_EDGE)
            .map(|dep| dep.target.as_str())
    }

    pub fn has_parent(&self, parent_id: &str) -> bool {
        self.parent_ids().any(|target| target == parent_id)
    }

    /// Recency key: update time, else creation time.
    pub fn touched_at(&self) -> f64 {
        if self.updated_at > 0.0 {
            self.updated_at
        } else {
            self.created_at
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|value| value == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForumMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub topic: String,
    pub author: String,
    pub body: String,
    /// Creation time normalized to epoch milliseconds.
    pub created_at_ms: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpsEvent {
    pub v: u32,
    pub ts_ms: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl OpsEvent {
    pub fn is_diagnostic(&self) -> bool {
        self.diagnostic.is_some()
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Issue,
    Message,
    Event,
}

impl RecordKind {
    pub fn file_name(self) -> &'static str {
        match self {
            RecordKind::Issue => ISSUES_FILE,
            RecordKind::Message => FORUM_FILE,
            RecordKind::Event => EVENTS_FILE,
        }
    }
}

/// One decoded line of any of the three stores.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Issue(WorkItem),
    Message(ForumMessage),
    Event(OpsEvent),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Issue(_) => RecordKind::Issue,
            Record::Message(_) => RecordKind::Message,
            Record::Event(_) => RecordKind::Event,
        }
    }
}

/// Typed view over [`Record`] used by per-file decoders.
pub trait StoredRecord: Sized {
    const KIND: RecordKind;

    fn from_record(record: Record) -> Option<Self>;

    /// Post-processing over a freshly decoded file, in file order.
    fn finalize(records: Vec<Self>) -> Vec<Self> {
        records
    }
}

impl StoredRecord for WorkItem {
    const KIND: RecordKind = RecordKind::Issue;

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Issue(item) => Some(item),
            _ => None,
        }
    }

    /// Last write wins: a later line for the same id replaces the earlier one
    /// and takes its position in file order.
    fn finalize(records: Vec<Self>) -> Vec<Self> {
        let mut last_index = std::collections::HashMap::with_capacity(records.len());
        for (idx, item) in records.iter().enumerate() {
            last_index.insert(item.id.clone(), idx);
        }
        if last_index.len() == records.len() {
            return records;
        }
        records
            .into_iter()
            .enumerate()
            .filter(|(idx, item)| last_index.get(&item.id) == Some(idx))
            .map(|(_, item)| item)
            .collect()
    }
}

impl StoredRecord for ForumMessage {
    const KIND: RecordKind = RecordKind::Message;

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Message(message) => Some(message),
            _ => None,
        }
    }
}

impl StoredRecord for OpsEvent {
    const KIND: RecordKind = RecordKind::Event;

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Event(event) => Some(event),
            _ => None,
        }
    }
}
