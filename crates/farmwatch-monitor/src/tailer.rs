use crate::hub::LiveHub;
use farmwatch_core::live_sync::{notification_for_event, Notification};
use farmwatch_store::{Store, StoreError};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Wakes on filesystem changes in `dir`; `None` when no watcher could be set up.
fn setup_watcher(dir: &Path) -> Option<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let (tx, rx) = mpsc::channel(1);
    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.try_send(());
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(event = "watcher_unavailable", error = %err);
            return None;
        }
    };
    if let Err(err) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        warn!(event = "watcher_unavailable", dir = %dir.display(), error = %err);
        return None;
    }
    Some((watcher, rx))
}

/// Notifications implied by events appended after `cursor`, in file order.
pub fn drain_new_events(
    store: &Store,
    cursor: usize,
) -> Result<(Vec<Notification>, usize), StoreError> {
    let (events, next) = store.events_since(cursor)?;
    let mut notifications = Vec::new();
    for event in &events {
        let lookup = |id: &str| match store.get_issue(id) {
            Ok(Some(item)) => Some((item.status, item.outcome)),
            Ok(None) => None,
            Err(err) => {
                debug!(event = "status_lookup_failed", issue_id = %id, error = %err);
                None
            }
        };
        if let Some(notification) = notification_for_event(event, lookup) {
            notifications.push(notification);
        }
    }
    Ok((notifications, next))
}

/// Follows the events file and pushes derived notifications through `hub`.
///
/// Starts at the current end of the file: history is served by the HTTP API.
pub async fn run_tailer(store: Arc<Store>, hub: Arc<LiveHub>, poll_interval: Duration) {
    let start = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || store.event_count()).await
    };
    let mut cursor = match start {
        Ok(Ok(count)) => count,
        Ok(Err(err)) => {
            warn!(event = "tailer_start", error = %err);
            0
        }
        Err(err) => {
            warn!(event = "tailer_start", error = %err);
            0
        }
    };

    let watched = setup_watcher(&store.paths().store_dir);
    let (_watcher, mut wake_rx) = match watched {
        Some((watcher, rx)) => (Some(watcher), Some(rx)),
        None => (None, None),
    };
    info!(
        event = "tailer_start",
        cursor,
        watching = wake_rx.is_some(),
        poll_ms = poll_interval.as_millis() as u64
    );

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let mut watcher_closed = false;
        match wake_rx.as_mut() {
            Some(rx) => {
                tokio::select! {
                    woke = rx.recv() => watcher_closed = woke.is_none(),
                    _ = ticker.tick() => {}
                }
            }
            None => {
                ticker.tick().await;
            }
        }
        if watcher_closed {
            warn!(event = "watcher_closed");
            wake_rx = None;
        }

        let drained = {
            let store = Arc::clone(&store);
            tokio::task::spawn_blocking(move || drain_new_events(&store, cursor)).await
        };
        match drained {
            Ok(Ok((notifications, next))) => {
                if next != cursor {
                    debug!(
                        event = "tailer_advance",
                        from = cursor,
                        to = next,
                        notifications = notifications.len()
                    );
                }
                cursor = next;
                for notification in &notifications {
                    hub.broadcast(notification).await;
                }
            }
            Ok(Err(err)) => warn!(event = "tailer_read_failed", error = %err),
            Err(err) => warn!(event = "tailer_join_failed", error = %err),
        }
    }
}
