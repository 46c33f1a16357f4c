//! Ties together [`LocalTree`], [`RemoteTree`], and [`EventPipeline`]:
//! initial sync, per-event dispatch, and refresh application. Grounded in
//! `event/event_handler.py`'s `run`/`_dispatch_events`/`_apply_icloud_refresh`/
//! `_sync_local_to_icloud`/`_sync_icloud`/`_sync_common`/`_delete_local_file`.
//!
//! The reconciler decides *what* to do; it hands the actual remote I/O off
//! as [`WriterJob`]/[`ReaderJob`] descriptors for the scheduler's pools to
//! run, except for rename/move, which it executes inline (synchronously
//! with respect to the calling task) to preserve burst ordering, matching
//! the source's direct `node.rename()`/delete-then-create handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::action_result::{ActionKind, ActionResult, DEFAULT_RETRIES};
use crate::event_pipeline::{coalesce, conflate_folder_scope, Event, EventPipeline, QueuedEvent};
use crate::local_tree::LocalTree;
use crate::node_record::NodeRecord;
use crate::path_map::ROOT;
use crate::remote_tree::{RemoteTree, TreeSide};

#[derive(Debug, Clone)]
pub enum WriterJob {
    Upload { path: String, retries: u32 },
    Delete { path: String, is_folder: bool, retries: u32 },
    Mkdir { path: String, retries: u32 },
}

#[derive(Debug, Clone)]
pub enum ReaderJob {
    Download { path: String, retries: u32 },
    ProcessFolder { side: TreeSide, path: String, recursive: bool },
}

/// What handling one event (or one step of the initial/refresh sync)
/// produces: either a job for one of the scheduler's pools, or an
/// already-completed result for a rename/move executed inline.
#[derive(Debug)]
pub enum Dispatch {
    Writer(WriterJob),
    Reader(ReaderJob),
    Done(ActionResult),
}

pub struct Reconciler {
    pub local: LocalTree,
    pub remote: Arc<RemoteTree>,
    pub pipeline: Arc<EventPipeline>,
    /// Set while a refresh is being applied; periodic jobs check this
    /// before starting new work, standing in for the source's reentrant
    /// refresh lock since our refresh application runs on the single
    /// reconciler task rather than a second thread racing it.
    applying_refresh: AtomicBool,
    /// Directory for the unconditional before/after state dumps written on
    /// every refresh-apply cycle; `None` disables them (tests).
    pub debug_dump_dir: Option<std::path::PathBuf>,
}

impl Reconciler {
    pub fn new(local: LocalTree, remote: Arc<RemoteTree>, pipeline: Arc<EventPipeline>) -> Self {
        Self {
            local,
            remote,
            pipeline,
            applying_refresh: AtomicBool::new(false),
            debug_dump_dir: None,
        }
    }

    pub fn with_debug_dump_dir(mut self, dir: std::path::PathBuf) -> Self {
        self.debug_dump_dir = Some(dir);
        self
    }

    fn dump_keys(&self, name: &str, keys: &[String]) {
        let Some(dir) = &self.debug_dump_dir else { return };
        let path = dir.join(format!("icloudds_{name}.log"));
        let contents = keys.join("\n");
        let _ = std::fs::write(path, contents);
    }

    pub fn is_applying_refresh(&self) -> bool {
        self.applying_refresh.load(Ordering::Acquire)
    }

    /// Phases 1-4 of the initial sync: upload locals missing remotely,
    /// download/mkdir remotes missing locally, resolve paths present on
    /// both sides by comparing rounded mtimes, and drop local files whose
    /// remote counterpart lives in the trash.
    pub fn initial_sync(&self) -> Vec<Dispatch> {
        let mut dispatch = Vec::new();

        let local_keys: std::collections::BTreeSet<String> = self.local.map.keys().into_iter().collect();
        let remote_keys: std::collections::BTreeSet<String> = self.remote.root.keys().into_iter().collect();

        for path in local_keys.difference(&remote_keys) {
            if path == ROOT {
                continue;
            }
            match self.local.map.get(path) {
                Some(NodeRecord::LocalFolder { .. }) => {
                    dispatch.push(Dispatch::Writer(WriterJob::Mkdir { path: path.clone(), retries: DEFAULT_RETRIES }));
                }
                Some(NodeRecord::LocalFile { size, .. }) if size > 0 => {
                    dispatch.push(Dispatch::Writer(WriterJob::Upload { path: path.clone(), retries: DEFAULT_RETRIES }));
                }
                _ => {}
            }
        }

        for path in remote_keys.difference(&local_keys) {
            if path == ROOT {
                continue;
            }
            match self.remote.root.get(path) {
                Some(NodeRecord::RemoteFolder { .. }) => {
                    let absolute = self.local.root_path().join(path);
                    if !absolute.exists() {
                        let _ = std::fs::create_dir_all(&absolute);
                    }
                }
                Some(NodeRecord::RemoteFile { .. }) => {
                    self.pipeline.suppress(path.clone());
                    dispatch.push(Dispatch::Reader(ReaderJob::Download { path: path.clone(), retries: DEFAULT_RETRIES }));
                }
                _ => {}
            }
        }

        for path in local_keys.intersection(&remote_keys) {
            if path == ROOT {
                continue;
            }
            let (local_rec, remote_rec) = match (self.local.map.get(path), self.remote.root.get(path)) {
                (Some(l), Some(r)) => (l, r),
                _ => continue,
            };
            if local_rec.is_folder() && remote_rec.is_folder() {
                continue;
            }
            match (local_rec.mtime(), remote_rec.mtime()) {
                (Some(lm), Some(rm)) if lm > rm && local_rec.size() > 0 => {
                    dispatch.push(Dispatch::Writer(WriterJob::Upload { path: path.clone(), retries: DEFAULT_RETRIES }));
                }
                (Some(lm), Some(rm)) if lm < rm => {
                    self.pipeline.suppress(path.clone());
                    dispatch.push(Dispatch::Reader(ReaderJob::Download { path: path.clone(), retries: DEFAULT_RETRIES }));
                }
                _ => {}
            }
        }

        for (trash_path, trash_record) in self.remote.trash.items() {
            if trash_path == ROOT {
                continue;
            }
            if let Some(restore_path) = trash_record.restore_path() {
                self.delete_local_file(restore_path);
            }
        }

        dispatch
    }

    /// Removes `path` from the local filesystem and tree, suppressing the
    /// watcher echo first.
    fn delete_local_file(&self, path: &str) {
        self.pipeline.suppress(path.to_string());
        let Some(record) = self.local.map.get(path) else { return };
        let absolute = self.local.root_path().join(path);
        if record.is_folder() {
            let _ = std::fs::remove_dir_all(&absolute);
        } else if absolute.is_file() {
            let _ = std::fs::remove_file(&absolute);
        }
        self.local.map.pop(path);
    }

    /// Per-event handling per the dispatch table. Rename/move are executed
    /// inline (awaited here) to preserve burst ordering; everything else
    /// returns a job for the scheduler's pools, or nothing.
    pub async fn handle_event(&self, event: &Event) -> Option<Dispatch> {
        match event {
            Event::FileCreated(path) | Event::FileModified(path) => self.handle_file_modified(path),
            Event::FolderCreated(path) => self.handle_folder_created(path),
            Event::FolderModified(_) => None, // should have been filtered upstream
            Event::FileDeleted(path) => self.handle_deleted(path, false),
            Event::FolderDeleted(path) => self.handle_deleted(path, true),
            Event::FileMoved { src, dst } => Some(self.handle_moved(src, dst, false).await),
            Event::FolderMoved { src, dst } => Some(self.handle_moved(src, dst, true).await),
            Event::RemoteFolderModified(path) => {
                Some(Dispatch::Reader(ReaderJob::ProcessFolder { side: TreeSide::Root, path: path.clone(), recursive: false }))
            }
        }
    }

    /// Coalesces and folder-scope-conflates a batch drained from the
    /// pipeline, then dispatches each surviving event in order.
    pub async fn dispatch_events(&self, collected: Vec<QueuedEvent>) -> Vec<Dispatch> {
        if collected.is_empty() {
            return Vec::new();
        }
        let events = conflate_folder_scope(coalesce(collected));
        let mut dispatch = Vec::with_capacity(events.len());
        for qe in events {
            if let Some(d) = self.handle_event(&qe.event).await {
                dispatch.push(d);
            }
        }
        dispatch
    }

    fn parent_of(path: &str) -> String {
        match std::path::Path::new(path).parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_string_lossy().into_owned(),
            _ => ROOT.to_string(),
        }
    }

    fn handle_file_modified(&self, path: &str) -> Option<Dispatch> {
        let Some(local_record) = self.local.add(path) else { return None };
        let parent_path = Self::parent_of(path);
        if !self.remote.root.contains(&parent_path) {
            return Some(Dispatch::Writer(WriterJob::Mkdir { path: parent_path, retries: DEFAULT_RETRIES }));
        }
        if self.remote.root.contains(path) {
            return None;
        }
        if local_record.size() > 0 {
            return Some(Dispatch::Writer(WriterJob::Upload { path: path.to_string(), retries: DEFAULT_RETRIES }));
        }
        None
    }

    fn handle_folder_created(&self, path: &str) -> Option<Dispatch> {
        self.local.add(path);
        let parent_path = Self::parent_of(path);
        if !self.remote.root.contains(path) || !self.remote.root.contains(&parent_path) {
            return Some(Dispatch::Writer(WriterJob::Mkdir { path: path.to_string(), retries: DEFAULT_RETRIES }));
        }
        None
    }

    fn handle_deleted(&self, path: &str, is_folder: bool) -> Option<Dispatch> {
        let absolute = self.local.root_path().join(path);
        if absolute.exists() {
            // reappeared between the event firing and us processing it
            self.local.add(path);
            return None;
        }
        if is_folder {
            self.local.prune(path, true);
        } else {
            self.local.pop(path);
        }
        let parent_path = Self::parent_of(path);
        if self.remote.root.contains(path) && self.remote.root.contains(&parent_path) {
            return Some(Dispatch::Writer(WriterJob::Delete { path: path.to_string(), is_folder, retries: DEFAULT_RETRIES }));
        }
        None
    }

    async fn handle_moved(&self, src: &str, dst: &str, is_folder: bool) -> Dispatch {
        self.local.re_key(src, dst);
        if self.remote.root.contains(dst) && is_folder {
            return Dispatch::Done(ActionResult::nil());
        }
        let src_parent = Self::parent_of(src);
        let dst_parent = Self::parent_of(dst);
        if src_parent == dst_parent {
            let result = self.remote.rename(src.to_string(), dst.to_string(), DEFAULT_RETRIES).await;
            if result.success {
                self.pipeline.enqueue_internal(Event::RemoteFolderModified(src_parent));
            }
            Dispatch::Done(result)
        } else {
            let result = self.remote.move_node(src.to_string(), dst.to_string(), DEFAULT_RETRIES).await;
            if result.success {
                self.pipeline.enqueue_internal(Event::RemoteFolderModified(src_parent));
                self.pipeline.enqueue_internal(Event::RemoteFolderModified(dst_parent));
            }
            Dispatch::Done(result)
        }
    }

    /// Applies a freshly-built `RemoteTree` as the new live tree: renames
    /// first (folders before files, shallow paths before deep ones), then
    /// sync-as-if-local in both directions, then deletes paths dropped
    /// from the refresh. Caller guarantees no in-flight work and an empty
    /// event queue before invoking this.
    pub async fn apply_refresh(&mut self, refreshed: Arc<RemoteTree>) -> anyhow::Result<(u64, u64, u64, u64)> {
        self.applying_refresh.store(true, Ordering::Release);
        self.dump_keys("local_before", &self.local.map.keys());
        self.dump_keys("icloud_before", &self.remote.root.keys());
        self.dump_keys("refresh_before", &refreshed.root.keys());
        let result = self.apply_refresh_inner(refreshed).await;
        self.dump_keys("local_after", &self.local.map.keys());
        self.dump_keys("icloud_after", &self.remote.root.keys());
        self.dump_keys("refresh_after", &self.remote.root.keys());
        self.applying_refresh.store(false, Ordering::Release);
        result
    }

    async fn apply_refresh_inner(&mut self, refreshed: Arc<RemoteTree>) -> anyhow::Result<(u64, u64, u64, u64)> {
        let live_ids = self.remote.docwsids();
        let refreshed_ids = refreshed.docwsids();

        let mut renames: Vec<(String, String)> = Vec::new();
        for (stable_id, old_path) in &live_ids {
            if let Some(new_path) = refreshed_ids.get(stable_id) {
                if new_path != old_path {
                    renames.push((old_path.clone(), new_path.clone()));
                }
            }
        }
        renames.sort_by_key(|(_, new_path)| new_path.matches('/').count());

        for (old_path, new_path) in &renames {
            self.pipeline.suppress(new_path.clone());
            let local_path = self.local.root_path().join(new_path);
            if let Some(parent) = local_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let old_absolute = self.local.root_path().join(old_path);
            if old_absolute.exists() {
                let _ = std::fs::rename(&old_absolute, &local_path);
            }
            self.local.re_key(old_path, new_path);
        }

        let mut uploaded = 0u64;
        let mut downloaded = 0u64;
        let mut folders_created = 0u64;

        let live_keys: std::collections::BTreeSet<String> = self.remote.root.keys().into_iter().collect();
        let refreshed_keys: std::collections::BTreeSet<String> = refreshed.root.keys().into_iter().collect();

        for path in refreshed_keys.difference(&live_keys) {
            if path == ROOT || self.local.map.contains(path) {
                continue;
            }
            match refreshed.root.get(path) {
                Some(NodeRecord::RemoteFolder { .. }) => {
                    let absolute = self.local.root_path().join(path);
                    let _ = std::fs::create_dir_all(&absolute);
                    self.local.add(path);
                    folders_created += 1;
                }
                Some(NodeRecord::RemoteFile { .. }) => {
                    self.pipeline.suppress(path.clone());
                    if self.remote.download(path.clone(), DEFAULT_RETRIES).await.success {
                        self.local.add(path);
                        downloaded += 1;
                    }
                }
                _ => {}
            }
        }

        for path in refreshed_keys.intersection(&live_keys) {
            if path == ROOT {
                continue;
            }
            let local_rec = match self.local.map.get(path) {
                Some(r) => r,
                None => continue,
            };
            let remote_rec = match refreshed.root.get(path) {
                Some(r) => r,
                None => continue,
            };
            if local_rec.is_folder() && remote_rec.is_folder() {
                continue;
            }
            match (local_rec.mtime(), remote_rec.mtime()) {
                (Some(lm), Some(rm)) if lm > rm && local_rec.size() > 0 => {
                    if self.remote.upload(path.clone(), DEFAULT_RETRIES).await.success {
                        uploaded += 1;
                    }
                }
                (Some(lm), Some(rm)) if lm < rm => {
                    self.pipeline.suppress(path.clone());
                    if self.remote.download(path.clone(), DEFAULT_RETRIES).await.success {
                        downloaded += 1;
                    }
                }
                _ => {}
            }
        }

        let deleted: Vec<String> = live_keys.difference(&refreshed_keys).cloned().collect();
        for path in &deleted {
            self.delete_local_file(path);
        }

        for (trash_path, trash_record) in refreshed.trash.items() {
            if trash_path == ROOT {
                continue;
            }
            if let Some(restore_path) = trash_record.restore_path() {
                self.delete_local_file(restore_path);
            }
        }

        self.remote = refreshed;
        Ok((uploaded, downloaded, deleted.len() as u64, folders_created))
    }

    /// Per §4.7: a successful Upload/Rename/Move gets its affected
    /// parent(s) requeued as a `RemoteFolderModified` rescan hint. Called
    /// by the scheduler once a writer-pool job completes; retry
    /// resubmission is handled directly off `result.retry`, since each
    /// `ActionResult` already carries a self-contained retry closure.
    pub fn on_writer_job_completed(&self, result: &ActionResult) {
        if !result.success {
            return;
        }
        if matches!(result.kind, ActionKind::Upload | ActionKind::Rename | ActionKind::Move) {
            self.pipeline.enqueue_internal(Event::RemoteFolderModified(Self::parent_of(&result.path)));
            if let Some(dest) = &result.dest_path {
                self.pipeline.enqueue_internal(Event::RemoteFolderModified(Self::parent_of(dest)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_root_level_path_is_root() {
        assert_eq!(Reconciler::parent_of("a.txt"), ROOT);
    }

    #[test]
    fn parent_of_nested_path_strips_basename() {
        assert_eq!(Reconciler::parent_of("a/b/c.txt"), "a/b");
    }

    fn test_remote_tree() -> Arc<RemoteTree> {
        use crate::auth::{Credentials, NonInteractiveAuthenticator};
        use crate::drive_api::HttpDriveApi;
        use crate::filters::FilterSet;
        Arc::new(RemoteTree::new(
            Arc::new(HttpDriveApi::new("http://127.0.0.1:1")),
            Arc::new(NonInteractiveAuthenticator),
            Credentials { username: "a".into(), password: None, cookie_directory: "/tmp".into() },
            Arc::new(FilterSet::empty()),
            crate::node_record::RoundingFamily::Truncates,
            1,
            std::env::temp_dir(),
        ))
    }

    #[tokio::test]
    async fn on_writer_job_completed_enqueues_a_remote_folder_modified_event() {
        let pipeline = Arc::new(EventPipeline::new(std::time::Duration::from_millis(20)));
        let remote = test_remote_tree();
        let local = LocalTree::new(std::env::temp_dir(), crate::node_record::RoundingFamily::Truncates);
        let reconciler = Reconciler::new(local, remote, pipeline.clone());
        let result = ActionResult::ok(ActionKind::Upload, "a/b.txt");
        reconciler.on_writer_job_completed(&result);
        let drained = pipeline.drain().await;
        assert_eq!(drained.len(), 1);
        assert!(matches!(&drained[0].event, Event::RemoteFolderModified(p) if p == "a"));
    }

    fn test_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("icloudds-reconciler-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn remote_file_record(size: u64, mtime: chrono::DateTime<chrono::Utc>) -> NodeRecord {
        NodeRecord::RemoteFile {
            name: "n".into(),
            size,
            mtime,
            ctime: mtime,
            stable_id: "s".into(),
            handle: crate::node_record::RemoteHandle("s".into()),
            restore_path: None,
        }
    }

    // S1/S3-style: a local-only file uploads, a remote-only file downloads
    // (and suppresses its own watcher echo).
    #[test]
    fn initial_sync_uploads_local_only_and_downloads_remote_only() {
        let dir = test_dir("upload-download");
        std::fs::write(dir.join("local_only.txt"), b"hello").unwrap();

        let local = LocalTree::new(&dir, crate::node_record::RoundingFamily::Truncates);
        let filters = crate::filters::FilterSet::empty();
        local.refresh(&filters);

        let remote = test_remote_tree();
        remote.root.put("remote_only.bin", remote_file_record(4, chrono::Utc::now()));

        let pipeline = Arc::new(EventPipeline::new(std::time::Duration::from_millis(20)));
        let reconciler = Reconciler::new(local, remote, pipeline.clone());
        let dispatches = reconciler.initial_sync();

        assert!(dispatches.iter().any(
            |d| matches!(d, Dispatch::Writer(WriterJob::Upload { path, .. }) if path == "local_only.txt")
        ));
        assert!(dispatches.iter().any(
            |d| matches!(d, Dispatch::Reader(ReaderJob::Download { path, .. }) if path == "remote_only.bin")
        ));

        std::fs::remove_dir_all(&dir).ok();
    }

    // Property 1 (§8): for a path present on both sides with diverging
    // mtimes, the newer side wins.
    #[test]
    fn initial_sync_resolves_present_on_both_sides_by_newer_mtime() {
        let dir = test_dir("newer-wins");
        std::fs::write(dir.join("both.txt"), b"local-body").unwrap();

        let local = LocalTree::new(&dir, crate::node_record::RoundingFamily::Truncates);
        let filters = crate::filters::FilterSet::empty();
        local.refresh(&filters);
        let local_mtime = match local.map.get("both.txt") {
            Some(NodeRecord::LocalFile { mtime, .. }) => mtime,
            other => panic!("expected a local file record, got {other:?}"),
        };

        let remote = test_remote_tree();
        let older = local_mtime - chrono::Duration::seconds(60);
        remote.root.put("both.txt", remote_file_record(10, older));

        let pipeline = Arc::new(EventPipeline::new(std::time::Duration::from_millis(20)));
        let reconciler = Reconciler::new(local, remote, pipeline.clone());
        let dispatches = reconciler.initial_sync();

        assert!(dispatches.iter().any(
            |d| matches!(d, Dispatch::Writer(WriterJob::Upload { path, .. }) if path == "both.txt")
        ));

        std::fs::remove_dir_all(&dir).ok();
    }
}
