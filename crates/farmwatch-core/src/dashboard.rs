//! Dashboard session state and incremental tree patching.
//!
//! The session owns everything the dashboard used to keep in globals
//! (focused node, visible node order, palette flag). Rendering goes through
//! [`TreeView`] so the rules can run against a real DOM or a test double.

use crate::live_sync::Notification;
use crate::{IssueStatus, Outcome};

// The monitor's dashboard script repeats these; its tests compare them.
pub const MAX_PARENT_HOPS: usize = 100;
pub const BREADCRUMB_SEPARATOR: &str = " / ";
pub const ID_FALLBACK_CHARS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMarker {
    Open,
    Active,
    Success,
    Failure,
    Expanded,
    Skipped,
}

impl StatusMarker {
    pub fn css_class(self) -> &'static str {
        match self {
            StatusMarker::Open => "status-open",
            StatusMarker::Active => "status-active",
            StatusMarker::Success => "status-success",
            StatusMarker::Failure => "status-failure",
            StatusMarker::Expanded => "status-expanded",
            StatusMarker::Skipped => "status-skipped",
        }
    }
}

pub fn status_marker(status: &IssueStatus, outcome: Option<&Outcome>) -> StatusMarker {
    match (status, outcome) {
        (IssueStatus::Closed, Some(Outcome::Failure)) => StatusMarker::Failure,
        (IssueStatus::Closed, Some(Outcome::Expanded)) => StatusMarker::Expanded,
        (IssueStatus::Closed, Some(Outcome::Skipped)) => StatusMarker::Skipped,
        (IssueStatus::Closed, _) => StatusMarker::Success,
        (IssueStatus::InProgress, _) => StatusMarker::Active,
        _ => StatusMarker::Open,
    }
}

/// Rendering surface the session patches. Ids are work-item ids.
pub trait TreeView {
    fn contains(&self, id: &str) -> bool;
    fn set_marker(&mut self, id: &str, marker: StatusMarker);
    fn parent_of(&self, id: &str) -> Option<String>;
    fn title_of(&self, id: &str) -> Option<String>;
    /// Ids of nodes that currently have a layout box, in document order.
    fn laid_out_ids(&self) -> Vec<String>;
    /// Replaces the highlighted set.
    fn set_highlight(&mut self, ids: &[String]);
    fn breadcrumb(&self) -> String;
    fn set_breadcrumb(&mut self, text: &str);
}

/// What the host has to fetch after a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEffect {
    None,
    /// Re-fetch and re-render the detail panel for this item.
    RefreshDetail(String),
    /// Re-fetch the id list (new nodes appeared).
    RefreshIds,
    /// Re-poll aggregate counters (heartbeat driven).
    RefreshCounters,
    RefreshRun(String),
    /// Connection (re)established: everything may be stale.
    RefreshAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusOutcome {
    Focused { depth: usize },
    CycleSuspected { hops: usize },
    Unknown,
}

#[derive(Debug, Clone)]
pub struct DashboardSession {
    focused: Option<String>,
    visible: Vec<String>,
    palette_open: bool,
    initial_breadcrumb: String,
    draft: Option<String>,
    action_error: Option<String>,
}

impl DashboardSession {
    pub fn new(view: &impl TreeView) -> Self {
        Self {
            focused: None,
            visible: view.laid_out_ids(),
            palette_open: false,
            initial_breadcrumb: view.breadcrumb(),
            draft: None,
            action_error: None,
        }
    }

    pub fn focused(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    pub fn visible(&self) -> &[String] {
        &self.visible
    }

    pub fn palette_open(&self) -> bool {
        self.palette_open
    }

    pub fn draft(&self) -> Option<&str> {
        self.draft.as_deref()
    }

    pub fn action_error(&self) -> Option<&str> {
        self.action_error.as_deref()
    }

    pub fn on_connect(&self) -> SyncEffect {
        SyncEffect::RefreshAll
    }

    pub fn apply(&mut self, view: &mut impl TreeView, notification: &Notification) -> SyncEffect {
        match notification {
            Notification::Heartbeat => SyncEffect::RefreshCounters,
            Notification::ItemCreated(_) => SyncEffect::RefreshIds,
            Notification::ItemUpdated(update) => {
                if !view.contains(&update.id) {
                    return SyncEffect::RefreshIds;
                }
                view.set_marker(
                    &update.id,
                    status_marker(&update.status, update.outcome.as_ref()),
                );
                if self.focused.as_deref() == Some(update.id.as_str()) {
                    SyncEffect::RefreshDetail(update.id.clone())
                } else {
                    SyncEffect::None
                }
            }
            Notification::RunStep(step) => SyncEffect::RefreshRun(step.run_id.clone()),
            Notification::RunComplete(done) => SyncEffect::RefreshRun(done.run_id.clone()),
        }
    }

    pub fn focus(&mut self, view: &mut impl TreeView, id: &str) -> FocusOutcome {
        if !view.contains(id) {
            return FocusOutcome::Unknown;
        }
        self.focused = Some(id.to_string());

        let chain = match ancestor_chain(&*view, id) {
            Ok(chain) => chain,
            Err(hops) => {
                let only = vec![id.to_string()];
                view.set_highlight(&only);
                let label = node_label(&*view, id);
                view.set_breadcrumb(&label);
                return FocusOutcome::CycleSuspected { hops };
            }
        };

        view.set_highlight(&chain);
        let crumbs: Vec<String> = chain.iter().rev().map(|node| node_label(&*view, node)).collect();
        view.set_breadcrumb(&crumbs.join(BREADCRUMB_SEPARATOR));
        FocusOutcome::Focused {
            depth: chain.len() - 1,
        }
    }

    pub fn clear_focus(&mut self, view: &mut impl TreeView) {
        self.focused = None;
        view.set_highlight(&[]);
        view.set_breadcrumb(&self.initial_breadcrumb);
    }

    pub fn refresh_visible(&mut self, view: &impl TreeView) {
        self.visible = view.laid_out_ids();
    }

    /// Moves focus within the laid-out nodes, clamped to the list bounds.
    pub fn move_focus(&mut self, view: &mut impl TreeView, delta: isize) -> Option<String> {
        if self.palette_open || self.visible.is_empty() {
            return None;
        }
        let last = self.visible.len() as isize - 1;
        let current = self
            .focused
            .as_ref()
            .and_then(|id| self.visible.iter().position(|node| node == id));
        let next = match current {
            Some(idx) => (idx as isize + delta).clamp(0, last),
            None if delta < 0 => last,
            None => 0,
        };
        let target = self.visible[next as usize].clone();
        self.focus(view, &target);
        Some(target)
    }

    pub fn toggle_palette(&mut self) -> bool {
        self.palette_open = !self.palette_open;
        self.palette_open
    }

    pub fn close_palette(&mut self) {
        self.palette_open = false;
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = Some(text.into());
    }

    /// Rejected edit: keep the draft so the user can retry.
    pub fn report_action_failure(&mut self, message: impl Into<String>) {
        self.action_error = Some(message.into());
    }

    pub fn action_succeeded(&mut self) {
        self.draft = None;
        self.action_error = None;
    }
}

/// `[id, parent, grandparent, ...]`, or `Err(hops)` when a cycle is suspected.
fn ancestor_chain(view: &impl TreeView, id: &str) -> Result<Vec<String>, usize> {
    let mut chain = vec![id.to_string()];
    let mut current = id.to_string();
    while let Some(parent) = view.parent_of(&current) {
        if chain.len() > MAX_PARENT_HOPS || chain.contains(&parent) {
            return Err(chain.len());
        }
        chain.push(parent.clone());
        current = parent;
    }
    Ok(chain)
}

fn node_label(view: &impl TreeView, id: &str) -> String {
    view.title_of(id)
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| id.chars().take(ID_FALLBACK_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_sync::{ItemCreated, ItemUpdated, RunStep};
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeNode {
        parent: Option<String>,
        title: Option<String>,
        marker: Option<StatusMarker>,
        laid_out: bool,
    }

    #[derive(Default)]
    struct FakeTree {
        order: Vec<String>,
        nodes: HashMap<String, FakeNode>,
        highlighted: Vec<String>,
        breadcrumb: String,
    }

    impl FakeTree {
        fn add(&mut self, id: &str, parent: Option<&str>, title: Option<&str>) {
            self.order.push(id.to_string());
            self.nodes.insert(
                id.to_string(),
                FakeNode {
                    parent: parent.map(str::to_string),
                    title: title.map(str::to_string),
                    marker: Some(StatusMarker::Open),
                    laid_out: true,
                },
            );
        }

        fn marker(&self, id: &str) -> Option<StatusMarker> {
            self.nodes.get(id).and_then(|node| node.marker)
        }
    }

    impl TreeView for FakeTree {
        fn contains(&self, id: &str) -> bool {
            self.nodes.contains_key(id)
        }

        fn set_marker(&mut self, id: &str, marker: StatusMarker) {
            if let Some(node) = self.nodes.get_mut(id) {
                node.marker = Some(marker);
            }
        }

        fn parent_of(&self, id: &str) -> Option<String> {
            self.nodes.get(id).and_then(|node| node.parent.clone())
        }

        fn title_of(&self, id: &str) -> Option<String> {
            self.nodes.get(id).and_then(|node| node.title.clone())
        }

        fn laid_out_ids(&self) -> Vec<String> {
            self.order
                .iter()
                .filter(|id| self.nodes.get(*id).is_some_and(|node| node.laid_out))
                .cloned()
                .collect()
        }

        fn set_highlight(&mut self, ids: &[String]) {
            self.highlighted = ids.to_vec();
        }

        fn breadcrumb(&self) -> String {
            self.breadcrumb.clone()
        }

        fn set_breadcrumb(&mut self, text: &str) {
            self.breadcrumb = text.to_string();
        }
    }

    fn sample_tree() -> FakeTree {
        let mut tree = FakeTree {
            breadcrumb: "all issues".to_string(),
            ..FakeTree::default()
        };
        tree.add("root", None, Some("Root epic"));
        tree.add("child-1", Some("root"), Some("Child one"));
        tree.add("grandchild-abcdef123", Some("child-1"), None);
        tree.add("child-2", Some("root"), Some("Child two"));
        tree
    }

    fn updated(id: &str, status: IssueStatus, outcome: Option<Outcome>) -> Notification {
        Notification::ItemUpdated(ItemUpdated {
            id: id.to_string(),
            status,
            outcome,
        })
    }

    #[test]
    fn marker_mapping_covers_every_state() {
        let closed = IssueStatus::Closed;
        assert_eq!(status_marker(&closed, Some(&Outcome::Failure)), StatusMarker::Failure);
        assert_eq!(status_marker(&closed, Some(&Outcome::Expanded)), StatusMarker::Expanded);
        assert_eq!(status_marker(&closed, Some(&Outcome::Skipped)), StatusMarker::Skipped);
        assert_eq!(status_marker(&closed, Some(&Outcome::Success)), StatusMarker::Success);
        assert_eq!(status_marker(&closed, None), StatusMarker::Success);
        assert_eq!(
            status_marker(&IssueStatus::InProgress, Some(&Outcome::Failure)),
            StatusMarker::Active
        );
        assert_eq!(status_marker(&IssueStatus::Open, None), StatusMarker::Open);
        assert_eq!(
            status_marker(&IssueStatus::Other("blocked".to_string()), None),
            StatusMarker::Open
        );
    }

    #[test]
    fn update_patches_only_the_named_node() {
        let mut tree = sample_tree();
        let mut session = DashboardSession::new(&tree);

        let effect = session.apply(
            &mut tree,
            &updated("child-1", IssueStatus::Closed, Some(Outcome::Failure)),
        );
        assert_eq!(effect, SyncEffect::None);
        assert_eq!(tree.marker("child-1"), Some(StatusMarker::Failure));
        for other in ["root", "grandchild-abcdef123", "child-2"] {
            assert_eq!(tree.marker(other), Some(StatusMarker::Open), "{other}");
        }
    }

    #[test]
    fn update_of_focused_node_requests_detail_refresh() {
        let mut tree = sample_tree();
        let mut session = DashboardSession::new(&tree);
        session.focus(&mut tree, "child-2");

        let effect = session.apply(&mut tree, &updated("child-2", IssueStatus::InProgress, None));
        assert_eq!(effect, SyncEffect::RefreshDetail("child-2".to_string()));
        assert_eq!(tree.marker("child-2"), Some(StatusMarker::Active));
    }

    #[test]
    fn unknown_nodes_and_push_kinds_map_to_refresh_triggers() {
        let mut tree = sample_tree();
        let mut session = DashboardSession::new(&tree);
        assert_eq!(
            session.apply(&mut tree, &updated("missing", IssueStatus::Open, None)),
            SyncEffect::RefreshIds
        );
        assert_eq!(
            session.apply(
                &mut tree,
                &Notification::ItemCreated(ItemCreated {
                    id: "new".to_string()
                })
            ),
            SyncEffect::RefreshIds
        );
        assert_eq!(
            session.apply(&mut tree, &Notification::Heartbeat),
            SyncEffect::RefreshCounters
        );
        assert_eq!(
            session.apply(
                &mut tree,
                &Notification::RunStep(RunStep {
                    run_id: "r1".to_string(),
                    status: "running".to_string(),
                    step: 2,
                    issue_id: None,
                })
            ),
            SyncEffect::RefreshRun("r1".to_string())
        );
        assert_eq!(session.on_connect(), SyncEffect::RefreshAll);
    }

    #[test]
    fn focus_highlights_ancestors_and_builds_breadcrumb() {
        let mut tree = sample_tree();
        let mut session = DashboardSession::new(&tree);

        let outcome = session.focus(&mut tree, "grandchild-abcdef123");
        assert_eq!(outcome, FocusOutcome::Focused { depth: 2 });
        assert_eq!(
            tree.highlighted,
            vec![
                "grandchild-abcdef123".to_string(),
                "child-1".to_string(),
                "root".to_string()
            ]
        );
        assert_eq!(tree.breadcrumb, "Root epic / Child one / grandchi");

        session.clear_focus(&mut tree);
        assert_eq!(session.focused(), None);
        assert!(tree.highlighted.is_empty());
        assert_eq!(tree.breadcrumb, "all issues");
    }

    #[test]
    fn parent_cycles_are_reported_not_followed() {
        let mut tree = sample_tree();
        tree.add("loop-a", Some("loop-b"), Some("A"));
        tree.add("loop-b", Some("loop-a"), Some("B"));
        let mut session = DashboardSession::new(&tree);

        let outcome = session.focus(&mut tree, "loop-a");
        assert!(matches!(outcome, FocusOutcome::CycleSuspected { .. }));
        assert_eq!(tree.highlighted, vec!["loop-a".to_string()]);
        assert_eq!(tree.breadcrumb, "A");
        assert_eq!(session.focused(), Some("loop-a"));
    }

    #[test]
    fn deep_chains_stop_at_the_hop_cap() {
        let mut tree = FakeTree::default();
        tree.add("n0", None, None);
        for idx in 1..=(MAX_PARENT_HOPS + 5) {
            let parent = format!("n{}", idx - 1);
            tree.add(&format!("n{idx}"), Some(&parent), None);
        }
        let mut session = DashboardSession::new(&tree);
        let leaf = format!("n{}", MAX_PARENT_HOPS + 5);
        assert!(matches!(
            session.focus(&mut tree, &leaf),
            FocusOutcome::CycleSuspected { .. }
        ));
        assert_eq!(
            session.focus(&mut tree, "n50"),
            FocusOutcome::Focused { depth: 50 }
        );
    }

    #[test]
    fn keyboard_movement_is_clamped_to_laid_out_nodes() {
        let mut tree = sample_tree();
        if let Some(node) = tree.nodes.get_mut("grandchild-abcdef123") {
            node.laid_out = false;
        }
        let mut session = DashboardSession::new(&tree);
        assert_eq!(session.visible().len(), 3);

        assert_eq!(session.move_focus(&mut tree, 1).as_deref(), Some("root"));
        assert_eq!(session.move_focus(&mut tree, 1).as_deref(), Some("child-1"));
        assert_eq!(session.move_focus(&mut tree, 5).as_deref(), Some("child-2"));
        assert_eq!(session.move_focus(&mut tree, 1).as_deref(), Some("child-2"));
        assert_eq!(session.move_focus(&mut tree, -10).as_deref(), Some("root"));

        session.toggle_palette();
        assert_eq!(session.move_focus(&mut tree, 1), None);
        session.close_palette();
        assert!(!session.palette_open());
    }

    #[test]
    fn failed_actions_keep_the_draft() {
        let tree = sample_tree();
        let mut session = DashboardSession::new(&tree);
        session.set_draft("retitle to X");
        session.report_action_failure("transition rejected");
        assert_eq!(session.draft(), Some("retitle to X"));
        assert_eq!(session.action_error(), Some("transition rejected"));

        session.action_succeeded();
        assert_eq!(session.draft(), None);
        assert_eq!(session.action_error(), None);
    }
}
