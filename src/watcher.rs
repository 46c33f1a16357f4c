//! Translates native filesystem notifications into [`crate::event_pipeline::Event`]
//! values and pushes them onto the pipeline. Grounded in
//! `event/observer.py`'s watchdog `FileSystemEventHandler` subclass, which
//! maps `on_created`/`on_modified`/`on_moved`/`on_deleted` callbacks
//! (already carrying an `is_directory` flag from watchdog's own snapshot)
//! onto the engine's event enum; `notify` gives us raw create/modify/
//! remove/rename-from/rename-to kinds instead, so this module tracks just
//! enough state (the set of paths last seen as directories, and a pending
//! rename-from path) to recover the same distinction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcherTrait};

use crate::event_pipeline::{Event, EventHandle, EventPipeline};
use crate::filters::FilterSet;

fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Live handle owning the underlying OS watch; dropping it stops delivery.
pub struct WatcherHandle {
    _inner: RecommendedWatcher,
    stopped: Arc<AtomicBool>,
}

impl WatcherHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

struct Translator {
    root: PathBuf,
    known_dirs: StdMutex<HashSet<String>>,
    pending_rename_from: StdMutex<Option<String>>,
    handle: EventHandle,
    pipeline: Arc<EventPipeline>,
    filters: Arc<FilterSet>,
    stopped: Arc<AtomicBool>,
}

impl Translator {
    fn rel(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let posix = to_posix(rel);
        if posix.is_empty() {
            None
        } else {
            Some(posix)
        }
    }

    fn record_dir(&self, rel: &str) {
        self.known_dirs.lock().unwrap().insert(rel.to_string());
    }

    fn forget_dir(&self, rel: &str) -> bool {
        self.known_dirs.lock().unwrap().remove(rel)
    }

    fn is_known_dir(&self, rel: &str) -> bool {
        self.known_dirs.lock().unwrap().contains(rel)
    }

    fn emit(&self, event: Event) {
        self.handle.push(event, &self.pipeline, &self.filters);
    }

    fn handle_raw(&self, event: NotifyEvent) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        match event.kind {
            EventKind::Create(kind) => {
                for path in &event.paths {
                    let Some(rel) = self.rel(path) else { continue };
                    let is_dir = match kind {
                        CreateKind::Folder => true,
                        CreateKind::File => false,
                        _ => path.is_dir(),
                    };
                    if is_dir {
                        self.record_dir(&rel);
                        self.emit(Event::FolderCreated(rel));
                    } else {
                        self.emit(Event::FileCreated(rel));
                    }
                }
            }
            EventKind::Modify(ModifyKind::Data(_)) => {
                for path in &event.paths {
                    let Some(rel) = self.rel(path) else { continue };
                    if !self.is_known_dir(&rel) {
                        self.emit(Event::FileModified(rel));
                    }
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let [from, to] = event.paths.as_slice() {
                    self.emit_move(from, to);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                if let Some(rel) = event.paths.first().and_then(|p| self.rel(p)) {
                    *self.pending_rename_from.lock().unwrap() = Some(rel);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                let from = self.pending_rename_from.lock().unwrap().take();
                match (from, event.paths.first()) {
                    (Some(src), Some(to_path)) => {
                        if let Some(dst) = self.rel(to_path) {
                            self.emit_renamed(src, dst, to_path);
                        }
                    }
                    (None, Some(to_path)) => {
                        // No paired From event arrived: treat as a plain create.
                        if let Some(rel) = self.rel(to_path) {
                            if to_path.is_dir() {
                                self.record_dir(&rel);
                                self.emit(Event::FolderCreated(rel));
                            } else {
                                self.emit(Event::FileCreated(rel));
                            }
                        }
                    }
                    _ => {}
                }
            }
            EventKind::Remove(kind) => {
                for path in &event.paths {
                    let Some(rel) = self.rel(path) else { continue };
                    let is_dir = match kind {
                        RemoveKind::Folder => true,
                        RemoveKind::File => false,
                        _ => self.is_known_dir(&rel),
                    };
                    if is_dir {
                        self.forget_dir(&rel);
                        self.emit(Event::FolderDeleted(rel));
                    } else {
                        self.emit(Event::FileDeleted(rel));
                    }
                }
            }
            _ => {}
        }
    }

    fn emit_move(&self, from: &Path, to: &Path) {
        let (Some(src), Some(dst)) = (self.rel(from), self.rel(to)) else { return };
        self.emit_renamed(src, dst, to);
    }

    fn emit_renamed(&self, src: String, dst: String, to_path: &Path) {
        let was_dir = self.forget_dir(&src) || to_path.is_dir();
        if was_dir {
            self.record_dir(&dst);
            self.emit(Event::FolderMoved { src, dst });
        } else {
            self.emit(Event::FileMoved { src, dst });
        }
    }
}

/// Starts a recursive `notify` watch on `root`, feeding translated events
/// into `pipeline` via `handle`. The returned [`WatcherHandle`] must be
/// kept alive for the duration of the watch.
pub fn watch(
    root: impl Into<PathBuf>,
    handle: EventHandle,
    pipeline: Arc<EventPipeline>,
    filters: Arc<FilterSet>,
) -> Result<WatcherHandle> {
    let root = root.into();
    let stopped = Arc::new(AtomicBool::new(false));
    let translator = Arc::new(Translator {
        root: root.clone(),
        known_dirs: StdMutex::new(HashSet::new()),
        pending_rename_from: StdMutex::new(None),
        handle,
        pipeline,
        filters,
        stopped: stopped.clone(),
    });

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<NotifyEvent>| {
            if let Ok(event) = res {
                translator.handle_raw(event);
            }
        },
        notify::Config::default(),
    )
    .context("constructing native filesystem watcher")?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("watching {}", root.display()))?;

    Ok(WatcherHandle { _inner: watcher, stopped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("icloudds-watcher-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn file_create_is_translated_and_delivered() {
        let dir = temp_dir("create");
        let pipeline = Arc::new(EventPipeline::new(Duration::from_millis(100)));
        let filters = Arc::new(FilterSet::empty());
        let handle = pipeline.handle();
        let _watcher = watch(&dir, handle, pipeline.clone(), filters).expect("watch starts");

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.join("hello.txt"), b"hi").unwrap();

        let drained = tokio::time::timeout(Duration::from_secs(5), pipeline.drain())
            .await
            .expect("events arrive before timeout");
        assert!(drained.iter().any(|qe| matches!(&qe.event, Event::FileCreated(p) if p == "hello.txt")
            || matches!(&qe.event, Event::FileModified(p) if p == "hello.txt")));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn translator_distinguishes_known_directories_from_files_on_remove() {
        let dir = temp_dir("dirs");
        let pipeline = Arc::new(EventPipeline::new(Duration::from_millis(50)));
        let filters = Arc::new(FilterSet::empty());
        let translator = Translator {
            root: dir.clone(),
            known_dirs: StdMutex::new(HashSet::new()),
            pending_rename_from: StdMutex::new(None),
            handle: pipeline.handle(),
            pipeline,
            filters,
            stopped: Arc::new(AtomicBool::new(false)),
        };
        translator.record_dir("sub");
        assert!(translator.is_known_dir("sub"));
        assert!(translator.forget_dir("sub"));
        assert!(!translator.is_known_dir("sub"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
