use crate::cache::{FileCache, MissingPolicy};
use crate::root::StorePaths;
use crate::StoreError;
use farmwatch_core::{ForumMessage, IssueStatus, OpsEvent, WorkItem};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_TOPIC_LIMIT: usize = 500;
pub const DEFAULT_MESSAGE_LIMIT: usize = 200;
pub const DEFAULT_EVENT_LIMIT: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueFilter {
    pub status: Option<IssueStatus>,
    pub tag: Option<String>,
    /// Restrict to this item and its transitive children.
    pub root: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub issue_id: Option<String>,
    pub run_id: Option<String>,
    pub event_type: Option<String>,
    pub limit: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            issue_id: None,
            run_id: None,
            event_type: None,
            limit: DEFAULT_EVENT_LIMIT,
        }
    }
}

impl EventQuery {
    pub fn matches(&self, event: &OpsEvent) -> bool {
        fn eq(want: &Option<String>, have: Option<&str>) -> bool {
            match want {
                Some(want) => have == Some(want.as_str()),
                None => true,
            }
        }
        eq(&self.issue_id, event.issue_id.as_deref())
            && eq(&self.run_id, event.run_id.as_deref())
            && eq(&self.event_type, Some(event.event_type.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IssueCounts {
    pub total: usize,
    pub open: usize,
    pub in_progress: usize,
    pub closed: usize,
    pub other: usize,
    pub outcomes: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicSummary {
    pub topic: String,
    pub messages: usize,
    pub last_activity_ms: i64,
}

/// Read-only view over the three record files of one store root.
///
/// Each call re-validates the file it touches; two calls may observe
/// different generations if the writer appends in between.
pub struct Store {
    paths: StorePaths,
    issues: FileCache<WorkItem>,
    forum: FileCache<ForumMessage>,
    events: FileCache<OpsEvent>,
}

impl Store {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let paths = StorePaths::new(root);
        Self {
            issues: FileCache::new(&paths.issues, MissingPolicy::Fail),
            forum: FileCache::new(&paths.forum, MissingPolicy::Fail),
            events: FileCache::new(&paths.events, MissingPolicy::Empty),
            paths,
        }
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Every work item, most recently touched first.
    pub fn list_issues(&self) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.issues.load()?;
        let mut list = items.to_vec();
        sort_by_recency(&mut list);
        Ok(list)
    }

    pub fn list_issues_filtered(&self, filter: &IssueFilter) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.issues.load()?;
        let subtree = filter
            .root
            .as_deref()
            .map(|root| collect_subtree(&items, root));

        let mut list: Vec<WorkItem> = items
            .iter()
            .filter(|item| {
                filter
                    .status
                    .as_ref()
                    .map_or(true, |status| &item.status == status)
            })
            .filter(|item| filter.tag.as_deref().map_or(true, |tag| item.has_tag(tag)))
            .filter(|item| {
                subtree
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&item.id))
            })
            .cloned()
            .collect();
        sort_by_recency(&mut list);
        Ok(list)
    }

    pub fn get_issue(&self, id: &str) -> Result<Option<WorkItem>, StoreError> {
        let items = self.issues.load()?;
        Ok(items.iter().find(|item| item.id == id).cloned())
    }

    pub fn children(&self, id: &str) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.issues.load()?;
        let mut list: Vec<WorkItem> = items
            .iter()
            .filter(|item| item.has_parent(id))
            .cloned()
            .collect();
        sort_by_recency(&mut list);
        Ok(list)
    }

    /// `root` plus every item reachable from it through child edges.
    pub fn subtree_ids(&self, root: &str) -> Result<HashSet<String>, StoreError> {
        let items = self.issues.load()?;
        Ok(collect_subtree(&items, root))
    }

    pub fn issue_counts(&self) -> Result<IssueCounts, StoreError> {
        let items = self.issues.load()?;
        let mut counts = IssueCounts {
            total: items.len(),
            ..IssueCounts::default()
        };
        for item in items.iter() {
            match item.status {
                IssueStatus::Open => counts.open += 1,
                IssueStatus::InProgress => counts.in_progress += 1,
                IssueStatus::Closed => counts.closed += 1,
                IssueStatus::Other(_) => counts.other += 1,
            }
            if let Some(outcome) = &item.outcome {
                *counts.outcomes.entry(outcome.to_string()).or_default() += 1;
            }
        }
        Ok(counts)
    }

    pub fn list_topics(
        &self,
        prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TopicSummary>, StoreError> {
        let messages = self.forum.load()?;
        let mut topics: HashMap<&str, TopicSummary> = HashMap::new();
        for message in messages.iter() {
            if let Some(prefix) = prefix {
                if !message.topic.starts_with(prefix) {
                    continue;
                }
            }
            let entry = topics
                .entry(message.topic.as_str())
                .or_insert_with(|| TopicSummary {
                    topic: message.topic.clone(),
                    messages: 0,
                    last_activity_ms: message.created_at_ms,
                });
            entry.messages += 1;
            entry.last_activity_ms = entry.last_activity_ms.max(message.created_at_ms);
        }

        let mut list: Vec<TopicSummary> = topics.into_values().collect();
        list.sort_by(|a, b| {
            b.last_activity_ms
                .cmp(&a.last_activity_ms)
                .then_with(|| a.topic.cmp(&b.topic))
        });
        list.truncate(limit);
        Ok(list)
    }

    /// Messages of one topic, newest first; equal timestamps keep file order.
    pub fn list_messages(&self, topic: &str, limit: usize) -> Result<Vec<ForumMessage>, StoreError> {
        let messages = self.forum.load()?;
        let mut list: Vec<ForumMessage> = messages
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        list.truncate(limit);
        Ok(list)
    }

    /// Conjunctive filter, then the last `limit` matches in file order.
    pub fn query_events(&self, query: &EventQuery) -> Result<Vec<OpsEvent>, StoreError> {
        let events = self.events.load()?;
        let mut matched: Vec<OpsEvent> = events
            .iter()
            .filter(|event| query.matches(event))
            .cloned()
            .collect();
        let start = matched.len().saturating_sub(query.limit);
        Ok(matched.split_off(start))
    }

    pub fn event_count(&self) -> Result<usize, StoreError> {
        Ok(self.events.load()?.len())
    }

    /// Events recorded after the first `cursor` ones, with the new cursor.
    ///
    /// A file holding fewer records than `cursor` was truncated or replaced;
    /// reading restarts from the beginning.
    pub fn events_since(&self, cursor: usize) -> Result<(Vec<OpsEvent>, usize), StoreError> {
        let events = self.events.load()?;
        let start = if cursor > events.len() {
            debug!(
                event = "events_cursor_reset",
                cursor,
                records = events.len()
            );
            0
        } else {
            cursor
        };
        Ok((events[start..].to_vec(), events.len()))
    }
}

fn sort_by_recency(items: &mut [WorkItem]) {
    items.sort_by(|a, b| b.touched_at().total_cmp(&a.touched_at()));
}

fn collect_subtree(items: &[WorkItem], root: &str) -> HashSet<String> {
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for item in items {
        for parent in item.parent_ids() {
            children.entry(parent).or_default().push(item.id.as_str());
        }
    }

    let mut seen = HashSet::new();
    seen.insert(root.to_string());
    let mut queue = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        for child in children.get(current).into_iter().flatten() {
            if seen.insert((*child).to_string()) {
                queue.push_back(*child);
            }
        }
    }
    seen
}
