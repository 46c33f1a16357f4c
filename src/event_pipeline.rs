//! Queue, debounce, and coalesce filesystem and remote-rescan events before
//! the reconciler dispatches them. Grounded in `event/event_handler.py`'s
//! `QueuedEvent`/`_coalesce_events`/`_enqueue_event`/`_dispatch_events` and
//! `event/icloud_event.py`'s `iCloudFolderModifiedEvent`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::filters::FilterSet;
use crate::path_map::is_self_or_descendant;

pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_DEBOUNCE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    FileCreated(String),
    FileModified(String),
    FileMoved { src: String, dst: String },
    FileDeleted(String),
    FolderCreated(String),
    FolderModified(String),
    FolderMoved { src: String, dst: String },
    FolderDeleted(String),
    /// Internal: enqueued by the reconciler after a successful write, to
    /// prompt a targeted rescan of the affected remote folder.
    RemoteFolderModified(String),
}

impl Event {
    pub fn src_path(&self) -> &str {
        match self {
            Event::FileCreated(p)
            | Event::FileModified(p)
            | Event::FileDeleted(p)
            | Event::FolderCreated(p)
            | Event::FolderModified(p)
            | Event::FolderDeleted(p)
            | Event::RemoteFolderModified(p) => p,
            Event::FileMoved { src, .. } | Event::FolderMoved { src, .. } => src,
        }
    }

    pub fn dest_path(&self) -> Option<&str> {
        match self {
            Event::FileMoved { dst, .. } | Event::FolderMoved { dst, .. } => Some(dst),
            _ => None,
        }
    }

    fn is_delete(&self) -> bool {
        matches!(self, Event::FileDeleted(_) | Event::FolderDeleted(_))
    }

    fn is_move(&self) -> bool {
        matches!(self, Event::FileMoved { .. } | Event::FolderMoved { .. })
    }

    fn is_create(&self) -> bool {
        matches!(self, Event::FileCreated(_) | Event::FolderCreated(_))
    }

    fn is_folder_deleted(&self) -> bool {
        matches!(self, Event::FolderDeleted(_))
    }

    fn is_folder_moved(&self) -> bool {
        matches!(self, Event::FolderMoved { .. })
    }
}

#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub timestamp: Instant,
    pub event: Event,
}

/// Queue fed by watcher callbacks and by the reconciler's own
/// `RemoteFolderModified` follow-ups; drained by the single reconciler
/// loop. Paths the reconciler is about to mutate locally are added to the
/// suppressed set before the mutation so the watcher's own echo is
/// dropped on arrival rather than round-tripped as a spurious event.
pub struct EventPipeline {
    sender: mpsc::UnboundedSender<QueuedEvent>,
    receiver: Mutex<mpsc::UnboundedReceiver<QueuedEvent>>,
    suppressed: StdMutex<HashSet<String>>,
    debounce_period: Duration,
}

impl EventPipeline {
    pub fn new(debounce_period: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            suppressed: StdMutex::new(HashSet::new()),
            debounce_period,
        }
    }

    pub fn handle(&self) -> EventHandle {
        EventHandle { sender: self.sender.clone() }
    }

    pub fn suppress(&self, path: impl Into<String>) {
        self.suppressed.lock().unwrap().insert(path.into());
    }

    pub fn clear_suppressed(&self) {
        self.suppressed.lock().unwrap().clear();
    }

    fn is_suppressed(&self, path: &str) -> bool {
        self.suppressed.lock().unwrap().contains(path)
    }

    /// Pushes directly, bypassing the suppressed-path check; used by the
    /// reconciler for its own `RemoteFolderModified` follow-ups, which are
    /// never subject to suppression.
    pub fn enqueue_internal(&self, event: Event) {
        let _ = self.sender.send(QueuedEvent { timestamp: Instant::now(), event });
    }

    /// Blocks up to `POLL_TIMEOUT` per poll, accumulating events, and
    /// returns once the queue has gone quiet (no new arrivals) for
    /// `debounce_period`. Returns an empty vector if nothing ever arrived.
    pub async fn drain(&self) -> Vec<QueuedEvent> {
        let mut collected = Vec::new();
        let mut quiet_since: Option<Instant> = None;
        let mut receiver = self.receiver.lock().await;
        loop {
            match timeout(POLL_TIMEOUT, receiver.recv()).await {
                Ok(Some(qe)) => {
                    collected.push(qe);
                    quiet_since = None;
                }
                Ok(None) => break, // sender dropped: shutting down
                Err(_) => {
                    if collected.is_empty() {
                        continue;
                    }
                    let since = quiet_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.debounce_period {
                        break;
                    }
                }
            }
        }
        collected
    }
}

/// Cloneable sender handle used by watcher callbacks; applies the
/// suppressed-path and ignored-path drop rules before enqueueing.
#[derive(Clone)]
pub struct EventHandle {
    sender: mpsc::UnboundedSender<QueuedEvent>,
}

impl EventHandle {
    pub fn push(&self, event: Event, suppressed: &EventPipeline, filters: &FilterSet) {
        let src = event.src_path();
        if suppressed.is_suppressed(src) || filters.ignore(src) {
            return;
        }
        if let Some(dest) = event.dest_path() {
            if suppressed.is_suppressed(dest) || filters.ignore(dest) {
                return;
            }
        }
        let _ = self.sender.send(QueuedEvent { timestamp: Instant::now(), event });
    }
}

/// Coalesces per `src_path`, preserving first-seen insertion order across
/// distinct paths and global timestamp order within the output.
pub fn coalesce(events: Vec<QueuedEvent>) -> Vec<QueuedEvent> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<QueuedEvent>> = HashMap::new();
    for qe in events {
        let key = qe.event.src_path().to_string();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(qe);
    }

    let mut result = Vec::with_capacity(order.len());
    for key in order {
        let group = groups.remove(&key).expect("key was just inserted");
        let chosen = if let Some(last_delete) = group.iter().rev().find(|qe| qe.event.is_delete()) {
            last_delete.clone()
        } else if let Some(last_move) = group.iter().rev().find(|qe| qe.event.is_move()) {
            last_move.clone()
        } else if group[0].event.is_create() {
            group[0].clone()
        } else {
            group.last().expect("group is never empty").clone()
        };
        result.push(chosen);
    }

    result.sort_by_key(|qe| qe.timestamp);
    result
}

/// After coalescing, drops events nested under a folder-level event of the
/// same kind, in two passes (`FolderDeleted` then `FolderMoved`), so a
/// deleted or moved subtree doesn't also emit events for its contents.
pub fn conflate_folder_scope(events: Vec<QueuedEvent>) -> Vec<QueuedEvent> {
    let pass1 = conflate_pass(events, |e| e.is_folder_deleted());
    conflate_pass(pass1, |e| e.is_folder_moved())
}

fn conflate_pass(events: Vec<QueuedEvent>, is_kind: impl Fn(&Event) -> bool) -> Vec<QueuedEvent> {
    let folder_srcs: Vec<String> = events
        .iter()
        .filter(|qe| is_kind(&qe.event))
        .map(|qe| qe.event.src_path().to_string())
        .collect();

    events
        .into_iter()
        .filter(|qe| {
            let src = qe.event.src_path();
            if is_kind(&qe.event) {
                !folder_srcs.iter().any(|other| other != src && is_self_or_descendant(other, src))
            } else {
                !folder_srcs.iter().any(|folder_src| is_self_or_descendant(folder_src, src))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qe(event: Event) -> QueuedEvent {
        QueuedEvent { timestamp: Instant::now(), event }
    }

    #[test]
    fn coalesce_prefers_delete_over_everything() {
        let events = vec![
            qe(Event::FileCreated("a.txt".into())),
            qe(Event::FileModified("a.txt".into())),
            qe(Event::FileDeleted("a.txt".into())),
        ];
        let result = coalesce(events);
        assert_eq!(result.len(), 1);
        assert!(result[0].event.is_delete());
    }

    #[test]
    fn coalesce_prefers_move_over_trailing_modify() {
        let events = vec![
            qe(Event::FileMoved { src: "a.txt".into(), dst: "b.txt".into() }),
            qe(Event::FileModified("a.txt".into())),
        ];
        let result = coalesce(events);
        assert_eq!(result.len(), 1);
        assert!(result[0].event.is_move());
    }

    #[test]
    fn coalesce_keeps_first_create_over_later_modifies() {
        let events = vec![
            qe(Event::FileCreated("a.txt".into())),
            qe(Event::FileModified("a.txt".into())),
            qe(Event::FileModified("a.txt".into())),
        ];
        let result = coalesce(events);
        assert_eq!(result.len(), 1);
        assert!(result[0].event.is_create());
    }

    #[test]
    fn coalesce_is_idempotent() {
        let events = vec![
            qe(Event::FileCreated("a.txt".into())),
            qe(Event::FileModified("b.txt".into())),
            qe(Event::FileDeleted("c.txt".into())),
        ];
        let once = coalesce(events);
        let twice = coalesce(once.clone());
        let once_paths: Vec<&str> = once.iter().map(|qe| qe.event.src_path()).collect();
        let twice_paths: Vec<&str> = twice.iter().map(|qe| qe.event.src_path()).collect();
        assert_eq!(once_paths, twice_paths);
    }

    #[test]
    fn folder_scope_conflation_drops_nested_file_events_under_a_deleted_folder() {
        let events = vec![
            qe(Event::FolderDeleted("a".into())),
            qe(Event::FileDeleted("a/b.txt".into())),
            qe(Event::FileDeleted("z.txt".into())),
        ];
        let result = conflate_folder_scope(events);
        let paths: Vec<&str> = result.iter().map(|qe| qe.event.src_path()).collect();
        assert_eq!(paths, vec!["a", "z.txt"]);
    }

    #[test]
    fn folder_scope_conflation_drops_nested_folder_deletes() {
        let events = vec![
            qe(Event::FolderDeleted("a".into())),
            qe(Event::FolderDeleted("a/b".into())),
        ];
        let result = conflate_folder_scope(events);
        let paths: Vec<&str> = result.iter().map(|qe| qe.event.src_path()).collect();
        assert_eq!(paths, vec!["a"]);
    }

    #[tokio::test]
    async fn enqueue_and_drain_round_trips_an_event() {
        let pipeline = EventPipeline::new(Duration::from_millis(50));
        let handle = pipeline.handle();
        let filters = FilterSet::empty();
        handle.push(Event::FileCreated("a.txt".into()), &pipeline, &filters);
        let drained = pipeline.drain().await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].event.src_path(), "a.txt");
    }

    #[tokio::test]
    async fn suppressed_path_is_dropped_at_enqueue_time() {
        let pipeline = EventPipeline::new(Duration::from_millis(50));
        let handle = pipeline.handle();
        let filters = FilterSet::empty();
        pipeline.suppress("a.txt");
        handle.push(Event::FileCreated("a.txt".into()), &pipeline, &filters);
        handle.push(Event::FileCreated("b.txt".into()), &pipeline, &filters);
        let drained = pipeline.drain().await;
        let paths: Vec<&str> = drained.iter().map(|qe| qe.event.src_path()).collect();
        assert_eq!(paths, vec!["b.txt"]);
    }

    #[tokio::test]
    async fn ignored_path_is_dropped_at_enqueue_time() {
        let pipeline = EventPipeline::new(Duration::from_millis(50));
        let handle = pipeline.handle();
        let filters = FilterSet::new(&[r".*\.tmp$".to_string()], &[]).unwrap();
        handle.push(Event::FileCreated("a.tmp".into()), &pipeline, &filters);
        handle.push(Event::FileCreated("b.txt".into()), &pipeline, &filters);
        let drained = pipeline.drain().await;
        let paths: Vec<&str> = drained.iter().map(|qe| qe.event.src_path()).collect();
        assert_eq!(paths, vec!["b.txt"]);
    }
}
