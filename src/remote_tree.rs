//! Authenticates, fetches the remote node tree (root + trash)
//! concurrently, and exposes the mutating operations the reconciler
//! drives. Grounded in `model/icloud_tree.py`'s `iCloudTree`, adapted to
//! the [`DriveApi`] trait boundary instead of a concrete `pyicloud`
//! dependency.

use std::path::Path as StdPath;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::TryStreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

use crate::action_result::{ActionKind, ActionResult};
use crate::auth::{Authenticator, Credentials};
use crate::drive_api::{DriveApi, DriveError, RemoteEntry};
use crate::filters::FilterSet;
use crate::node_record::{round_to_whole_seconds, NodeRecord, RemoteHandle, RoundingFamily};
use crate::path_map::{PathMap, ROOT};

pub const DOWNLOAD_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSide {
    Root,
    Trash,
}

pub struct RemoteTree {
    drive: Arc<dyn DriveApi>,
    authenticator: Arc<dyn Authenticator>,
    credentials: Credentials,
    authenticated: AtomicBool,
    /// Edge-triggered pause signal: set on auth failure, tested by
    /// periodic jobs before they probe or refresh.
    pub jobs_disabled: Arc<AtomicBool>,
    pub root: PathMap<NodeRecord>,
    pub trash: PathMap<NodeRecord>,
    filters: Arc<FilterSet>,
    rounding: RoundingFamily,
    max_workers: usize,
    local_root: std::path::PathBuf,
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == ROOT {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn entry_to_record(entry: &RemoteEntry) -> NodeRecord {
    if entry.is_folder {
        NodeRecord::RemoteFolder {
            name: entry.name.clone(),
            stable_id: entry.stable_id.clone(),
            file_count: entry.file_count,
            direct_children_count: entry.direct_children_count,
            number_of_items: entry.number_of_items,
            handle: entry.handle.clone(),
        }
    } else {
        NodeRecord::RemoteFile {
            name: entry.name.clone(),
            size: entry.size,
            mtime: entry.mtime,
            ctime: entry.ctime,
            stable_id: entry.stable_id.clone(),
            handle: entry.handle.clone(),
            restore_path: entry.restore_path.clone(),
        }
    }
}

impl RemoteTree {
    pub fn new(
        drive: Arc<dyn DriveApi>,
        authenticator: Arc<dyn Authenticator>,
        credentials: Credentials,
        filters: Arc<FilterSet>,
        rounding: RoundingFamily,
        max_workers: usize,
        local_root: std::path::PathBuf,
    ) -> Self {
        Self {
            drive,
            authenticator,
            credentials,
            authenticated: AtomicBool::new(false),
            jobs_disabled: Arc::new(AtomicBool::new(false)),
            root: PathMap::new(),
            trash: PathMap::new(),
            filters,
            rounding,
            max_workers: max_workers.max(1),
            local_root,
        }
    }

    fn side_map(&self, side: TreeSide) -> &PathMap<NodeRecord> {
        match side {
            TreeSide::Root => &self.root,
            TreeSide::Trash => &self.trash,
        }
    }

    async fn ensure_authenticated(&self) -> Result<(), DriveError> {
        if self.authenticated.load(Ordering::Acquire) {
            return Ok(());
        }
        self.authenticator
            .authenticate(&self.credentials)
            .await
            .map_err(DriveError::Other)?;
        self.drive.authenticate().await?;
        self.authenticated.store(true, Ordering::Release);
        Ok(())
    }

    fn handle_error(&self, err: &DriveError) {
        match err {
            DriveError::Auth(_) => {
                self.authenticated.store(false, Ordering::Release);
                self.jobs_disabled.store(true, Ordering::Release);
            }
            DriveError::NotFound(_) => {}
            DriveError::Other(_) => {}
        }
    }

    /// Authenticate lazily, clear both trees, and concurrently walk both
    /// subtrees via a bounded worker farm. Returns a `Refresh`
    /// `ActionResult`: success iff the walk was consistent.
    pub async fn refresh(self: &Arc<Self>) -> ActionResult {
        if let Err(e) = self.ensure_authenticated().await {
            self.handle_error(&e);
            return ActionResult::failed(ActionKind::Refresh, ROOT, e.to_string(), 0, None);
        }

        self.root.clear();
        self.trash.clear();

        let root_handle = match self.drive.root_handle().await {
            Ok(h) => h,
            Err(e) => {
                self.handle_error(&e);
                return ActionResult::failed(ActionKind::Refresh, ROOT, e.to_string(), 0, None);
            }
        };
        let trash_handle = match self.drive.trash_handle().await {
            Ok(h) => h,
            Err(e) => {
                self.handle_error(&e);
                return ActionResult::failed(ActionKind::Refresh, ROOT, e.to_string(), 0, None);
            }
        };

        let root_counters = self.drive.root_counters().await.unwrap_or_default();
        let trash_counters = self.drive.trash_counters().await.unwrap_or_default();

        self.root.put(
            ROOT,
            NodeRecord::RemoteFolder {
                name: ROOT.to_string(),
                stable_id: root_handle.0.clone(),
                file_count: root_counters.file_count,
                direct_children_count: 0,
                number_of_items: root_counters.number_of_items,
                handle: root_handle.clone(),
            },
        );
        self.trash.put(
            ROOT,
            NodeRecord::RemoteFolder {
                name: ROOT.to_string(),
                stable_id: trash_handle.0.clone(),
                file_count: trash_counters.file_count,
                direct_children_count: 0,
                number_of_items: trash_counters.number_of_items,
                handle: trash_handle.clone(),
            },
        );

        let sem = Arc::new(Semaphore::new(self.max_workers));
        let root_walk = self.clone().walk_recursive(TreeSide::Root, ROOT.to_string(), root_handle, sem.clone());
        let trash_walk = self.clone().walk_recursive(TreeSide::Trash, ROOT.to_string(), trash_handle, sem);
        let (root_result, trash_result) = tokio::join!(root_walk, trash_walk);

        if let Some(e) = root_result.as_ref().err().or(trash_result.as_ref().err()) {
            self.handle_error(e);
            return ActionResult::failed(ActionKind::Refresh, ROOT, e.to_string(), 0, None);
        }

        let counted = count_files(&self.root) + count_files(&self.trash);
        let expected = root_counters.file_count + trash_counters.file_count;
        if counted != expected {
            return ActionResult::failed(
                ActionKind::Refresh,
                ROOT,
                format!("inconsistent refresh: counted {counted} expected {expected}"),
                0,
                None,
            );
        }
        ActionResult::ok(ActionKind::Refresh, ROOT)
    }

    fn walk_recursive(
        self: Arc<Self>,
        side: TreeSide,
        path: String,
        handle: RemoteHandle,
        sem: Arc<Semaphore>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), DriveError>> + Send>> {
        Box::pin(async move {
            let permit = sem.clone().acquire_owned().await.ok();
            let children = self.drive.fetch_children(&handle).await?;
            // Release the permit before recursing: holding it across the
            // child walks below would let a subtree deeper than the
            // semaphore's capacity deadlock, with every level blocked on
            // children that can never acquire a permit held by an ancestor.
            drop(permit);
            let mut subfolders = Vec::new();
            for child in &children {
                let rel = join_path(&path, &child.name);
                if self.filters.ignore(&rel) {
                    continue;
                }
                self.side_map(side).put(rel.clone(), entry_to_record(child));
                if child.is_folder {
                    subfolders.push((rel, child.handle.clone()));
                }
            }
            let mut tasks = Vec::new();
            for (rel, child_handle) in subfolders {
                let fut = self.clone().walk_recursive(side, rel, child_handle, sem.clone());
                tasks.push(tokio::spawn(fut));
            }
            for task in tasks {
                task.await.map_err(|e| DriveError::Other(anyhow::anyhow!(e)))??;
            }
            Ok(())
        })
    }

    /// Non-recursive (or recursive) rescan of a single already-known
    /// folder, used both by the initial walk and by
    /// `RemoteFolderModified` rescans.
    pub async fn process_folder(self: &Arc<Self>, side: TreeSide, path: &str, recursive: bool) -> ActionResult {
        let record = match self.side_map(side).get(path) {
            Some(r) => r,
            None => return ActionResult::nil(),
        };
        let handle = match record.handle() {
            Some(h) => h.clone(),
            None => return ActionResult::nil(),
        };
        if recursive {
            let sem = Arc::new(Semaphore::new(self.max_workers));
            match self.clone().walk_recursive(side, path.to_string(), handle, sem).await {
                Ok(()) => ActionResult::ok(ActionKind::Refresh, path),
                Err(e) => {
                    self.handle_error(&e);
                    ActionResult::failed(ActionKind::Refresh, path, e.to_string(), 0, None)
                }
            }
        } else {
            match self.drive.fetch_children(&handle).await {
                Ok(children) => {
                    for child in &children {
                        let rel = join_path(path, &child.name);
                        if self.filters.ignore(&rel) {
                            continue;
                        }
                        self.side_map(side).put(rel, entry_to_record(child));
                    }
                    ActionResult::ok(ActionKind::Refresh, path)
                }
                Err(e) => {
                    self.handle_error(&e);
                    ActionResult::failed(ActionKind::Refresh, path, e.to_string(), 0, None)
                }
            }
        }
    }

    /// Deletes any existing remote entry at `path` (best-effort), then
    /// streams local bytes to the parent folder with local mtime/ctime.
    pub async fn upload(self: &Arc<Self>, path: String, retries: u32) -> ActionResult {
        let local_path = self.local_root.join(&path);
        let data = match tokio::fs::read(&local_path).await {
            Ok(d) => d,
            Err(e) => return ActionResult::failed(ActionKind::Upload, path, e.to_string(), 0, None),
        };
        let metadata = match tokio::fs::metadata(&local_path).await {
            Ok(m) => m,
            Err(e) => return ActionResult::failed(ActionKind::Upload, path, e.to_string(), 0, None),
        };
        let mtime = metadata.modified().map(chrono::DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
        let mtime = round_to_whole_seconds(mtime, self.rounding);
        let ctime = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(chrono::DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let ctime = round_to_whole_seconds(ctime, self.rounding);

        if let Some(existing) = self.root.get(&path) {
            if let Some(handle) = existing.handle() {
                let _ = self.drive.delete(handle).await;
            }
        }

        let parent_path = parent_of(&path);
        let parent_handle = match self.root.get(&parent_path).and_then(|r| r.handle().cloned()) {
            Some(h) => h,
            None => return ActionResult::failed(ActionKind::Upload, path, "parent folder not found remotely", 0, None),
        };
        let name = StdPath::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());

        match self.drive.upload(&parent_handle, &name, data, mtime, ctime).await {
            Ok(entry) => {
                self.root.put(path.clone(), entry_to_record(&entry));
                ActionResult::ok(ActionKind::Upload, path)
            }
            Err(e) => {
                self.handle_error(&e);
                let retry = retry_closure(retries, self.clone(), {
                    let path = path.clone();
                    move |tree| Box::pin(async move { tree.upload(path, retries.saturating_sub(1)).await })
                });
                ActionResult::failed(ActionKind::Upload, path, e.to_string(), retries, retry)
            }
        }
    }

    /// Ensures the parent directory exists locally, streams the remote
    /// file in `DOWNLOAD_CHUNK_SIZE` chunks, fsyncs, and sets the local
    /// mtime to the remote mtime.
    pub async fn download(self: &Arc<Self>, path: String, retries: u32) -> ActionResult {
        let record = match self.root.get(&path) {
            Some(r) => r,
            None => return ActionResult::nil(),
        };
        let handle = match record.handle() {
            Some(h) => h.clone(),
            None => return ActionResult::nil(),
        };
        let local_path = self.local_root.join(&path);
        if let Some(parent) = local_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ActionResult::failed(ActionKind::Download, path, e.to_string(), 0, None);
            }
        }

        let stream = match self.drive.download_stream(&handle).await {
            Ok(s) => s,
            Err(e) => {
                self.handle_error(&e);
                let retry = retry_closure(retries, self.clone(), {
                    let path = path.clone();
                    move |tree| Box::pin(async move { tree.download(path, retries.saturating_sub(1)).await })
                });
                return ActionResult::failed(ActionKind::Download, path, e.to_string(), retries, retry);
            }
        };

        if let Err(e) = write_stream_chunked(&local_path, stream).await {
            return ActionResult::failed(ActionKind::Download, path, e.to_string(), retries, None);
        }

        if let NodeRecord::RemoteFile { mtime, .. } = &record {
            let file_time = filetime::FileTime::from_system_time(std::time::SystemTime::from(*mtime));
            let _ = filetime::set_file_mtime(&local_path, file_time);
        }

        ActionResult::ok(ActionKind::Download, path)
    }

    pub async fn delete(self: &Arc<Self>, path: String, is_folder: bool, retries: u32) -> ActionResult {
        let record = match self.root.get(&path) {
            Some(r) => r,
            None => return ActionResult::nil(),
        };
        let handle = match record.handle() {
            Some(h) => h.clone(),
            None => return ActionResult::nil(),
        };
        match self.drive.delete(&handle).await {
            Ok(()) => {
                if is_folder {
                    self.root.prune(&path, true);
                } else {
                    self.root.pop(&path);
                }
                ActionResult::ok(ActionKind::Delete, path)
            }
            Err(e) => {
                self.handle_error(&e);
                let retry = retry_closure(retries, self.clone(), {
                    let path = path.clone();
                    move |tree| Box::pin(async move { tree.delete(path, is_folder, retries.saturating_sub(1)).await })
                });
                ActionResult::failed(ActionKind::Delete, path, e.to_string(), retries, retry)
            }
        }
    }

    pub async fn rename(self: &Arc<Self>, old: String, new: String, retries: u32) -> ActionResult {
        let record = match self.root.get(&old) {
            Some(r) => r,
            None => return ActionResult::nil(),
        };
        let handle = match record.handle() {
            Some(h) => h.clone(),
            None => return ActionResult::nil(),
        };
        let new_name = StdPath::new(&new)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| new.clone());
        match self.drive.rename(&handle, &new_name).await {
            Ok(()) => {
                self.root.re_key(&old, &new);
                ActionResult::ok_with_dest(ActionKind::Rename, old, new)
            }
            Err(e) => {
                self.handle_error(&e);
                let retry = retry_closure(retries, self.clone(), {
                    let old = old.clone();
                    let new = new.clone();
                    move |tree| Box::pin(async move { tree.rename(old, new, retries.saturating_sub(1)).await })
                });
                ActionResult::failed(ActionKind::Rename, old, e.to_string(), retries, retry)
            }
        }
    }

    pub async fn move_node(self: &Arc<Self>, old: String, new: String, retries: u32) -> ActionResult {
        let record = match self.root.get(&old) {
            Some(r) => r,
            None => return ActionResult::nil(),
        };
        let handle = match record.handle() {
            Some(h) => h.clone(),
            None => return ActionResult::nil(),
        };
        let new_parent_path = parent_of(&new);
        let new_parent_handle = match self.root.get(&new_parent_path).and_then(|r| r.handle().cloned()) {
            Some(h) => h,
            None => return ActionResult::failed(ActionKind::Move, old, "destination parent not found remotely", 0, None),
        };
        match self.drive.move_to(&handle, &new_parent_handle).await {
            Ok(()) => {
                if let Some(value) = self.root.pop(&old) {
                    self.root.put(new.clone(), value);
                }
                ActionResult::ok_with_dest(ActionKind::Move, old, new)
            }
            Err(e) => {
                self.handle_error(&e);
                let retry = retry_closure(retries, self.clone(), {
                    let old = old.clone();
                    let new = new.clone();
                    move |tree| Box::pin(async move { tree.move_node(old, new, retries.saturating_sub(1)).await })
                });
                ActionResult::failed(ActionKind::Move, old, e.to_string(), retries, retry)
            }
        }
    }

    /// Recursively creates any missing ancestors, rescanning each created
    /// level so its `RemoteFolder` record is materialized. Idempotent.
    pub async fn mkdir(self: &Arc<Self>, path: String, retries: u32) -> ActionResult {
        if self.root.contains(&path) {
            return ActionResult::nil();
        }
        let components: Vec<&str> = path.split('/').collect();
        let mut current = ROOT.to_string();
        for component in components {
            let next = join_path(&current, component);
            if !self.root.contains(&next) {
                let parent_handle = match self.root.get(&current).and_then(|r| r.handle().cloned()) {
                    Some(h) => h,
                    None => return ActionResult::failed(ActionKind::Mkdir, path, "parent not found remotely", 0, None),
                };
                match self.drive.mkdir(&parent_handle, component).await {
                    Ok(entry) => {
                        self.root.put(next.clone(), entry_to_record(&entry));
                    }
                    Err(e) => {
                        self.handle_error(&e);
                        let retry = retry_closure(retries, self.clone(), {
                            let path = path.clone();
                            move |tree| Box::pin(async move { tree.mkdir(path, retries.saturating_sub(1)).await })
                        });
                        return ActionResult::failed(ActionKind::Mkdir, path, e.to_string(), retries, retry);
                    }
                }
            }
            current = next;
        }
        ActionResult::ok(ActionKind::Mkdir, path)
    }

    /// Cheap probe: true iff freshly fetched counters differ from the
    /// live tree's cached ones.
    pub async fn is_dirty(&self) -> bool {
        let root_record = self.root.get(ROOT);
        let trash_record = self.trash.get(ROOT);
        let (root_fc, trash_items) = match (root_record, trash_record) {
            (
                Some(NodeRecord::RemoteFolder { file_count, .. }),
                Some(NodeRecord::RemoteFolder { number_of_items, .. }),
            ) => (file_count, number_of_items),
            _ => return false,
        };
        let fresh_root = self.drive.root_counters().await.unwrap_or_default();
        let fresh_trash = self.drive.trash_counters().await.unwrap_or_default();
        fresh_root.file_count != root_fc || fresh_trash.number_of_items != trash_items
    }

    /// Mapping stable_id → path over the root map, used for rename
    /// detection across a refresh.
    pub fn docwsids(&self) -> std::collections::HashMap<String, String> {
        self.root
            .items()
            .into_iter()
            .filter_map(|(path, record)| record.stable_id().map(|id| (id.to_string(), path)))
            .collect()
    }

}

/// Builds a retry closure bound to this `RemoteTree` instance via `Arc`
/// clone, so the reconciler can resubmit the same op to its original
/// pool without needing to thread the tree through `ActionResult` itself.
fn retry_closure<F>(retries: u32, tree: Arc<RemoteTree>, f: F) -> Option<crate::action_result::RetryClosure>
where
    F: FnOnce(Arc<RemoteTree>) -> crate::action_result::RetryFuture + Send + 'static,
{
    if retries == 0 {
        return None;
    }
    Some(Box::new(move || f(tree)))
}

fn parent_of(path: &str) -> String {
    match StdPath::new(path).parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_string_lossy().into_owned(),
        _ => ROOT.to_string(),
    }
}

fn count_files(map: &PathMap<NodeRecord>) -> u64 {
    map.items()
        .into_iter()
        .filter(|(_, record)| !record.is_folder())
        .count() as u64
}

async fn write_stream_chunked(
    path: &std::path::Path,
    mut stream: crate::drive_api::ByteStream,
) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut buffer: Vec<u8> = Vec::with_capacity(DOWNLOAD_CHUNK_SIZE);
    while let Some(chunk) = stream.try_next().await? {
        buffer.extend_from_slice(&chunk);
        while buffer.len() >= DOWNLOAD_CHUNK_SIZE {
            let rest = buffer.split_off(DOWNLOAD_CHUNK_SIZE);
            file.write_all(&buffer).await?;
            buffer = rest;
        }
    }
    if !buffer.is_empty() {
        file.write_all(&buffer).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_root_level_path_is_root() {
        assert_eq!(parent_of("a.txt"), ROOT);
    }

    #[test]
    fn parent_of_nested_path_strips_basename() {
        assert_eq!(parent_of("a/b/c.txt"), "a/b");
    }

    #[test]
    fn count_files_ignores_folders() {
        let m: PathMap<NodeRecord> = PathMap::new();
        m.put(ROOT, NodeRecord::RemoteFolder {
            name: ROOT.to_string(),
            stable_id: "root".into(),
            file_count: 0,
            direct_children_count: 0,
            number_of_items: 0,
            handle: RemoteHandle("root".into()),
        });
        m.put("a.txt", NodeRecord::RemoteFile {
            name: "a.txt".into(),
            size: 1,
            mtime: Utc::now(),
            ctime: Utc::now(),
            stable_id: "1".into(),
            handle: RemoteHandle("1".into()),
            restore_path: None,
        });
        assert_eq!(count_files(&m), 1);
    }
}
