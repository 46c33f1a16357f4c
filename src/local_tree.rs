//! Scans the local subtree and maintains a [`PathMap`] of [`NodeRecord`]s.
//! Grounded in `model/local_tree.py`'s `refresh`/`add`/`_add_children`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::filters::FilterSet;
use crate::node_record::{round_to_whole_seconds, NodeRecord, RoundingFamily};
use crate::path_map::{PathMap, ROOT};

pub struct LocalTree {
    root_path: PathBuf,
    rounding: RoundingFamily,
    pub map: PathMap<NodeRecord>,
}

fn system_time_to_utc(t: std::time::SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

impl LocalTree {
    pub fn new(root_path: impl Into<PathBuf>, rounding: RoundingFamily) -> Self {
        Self {
            root_path: root_path.into(),
            rounding,
            map: PathMap::new(),
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn record_for(&self, metadata: &std::fs::Metadata, name: String) -> NodeRecord {
        let mtime = metadata.modified().map(system_time_to_utc).unwrap_or_else(Utc::now);
        let ctime = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(system_time_to_utc)
            .unwrap_or_else(|_| Utc::now());
        NodeRecord::LocalFile {
            name,
            size: metadata.len(),
            mtime: round_to_whole_seconds(mtime, self.rounding),
            ctime: round_to_whole_seconds(ctime, self.rounding),
        }
    }

    /// Clears the map, inserts the root folder, then walks the directory
    /// tree, applying the filter at each entry and following symlinks.
    pub fn refresh(&self, filters: &FilterSet) {
        self.map.clear();
        self.map.put(ROOT, NodeRecord::LocalFolder { name: ROOT.to_string() });

        let walker = WalkDir::new(&self.root_path).follow_links(true).min_depth(1);
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue, // permission error or similar: skip, matching the source's PermissionError swallow
            };
            let rel = match entry.path().strip_prefix(&self.root_path) {
                Ok(r) => to_posix(r),
                Err(_) => continue,
            };
            if rel.is_empty() {
                continue;
            }
            if filters.ignore(&rel) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().is_dir() {
                self.map.put(rel, NodeRecord::LocalFolder { name });
            } else if entry.file_type().is_file() {
                let metadata = match entry.metadata() {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                self.map.put(rel, self.record_for(&metadata, name));
            }
        }
    }

    /// Back-fills missing ancestor folder records, then stats and inserts
    /// the record at `path`. Returns `None` if the path is neither a file
    /// nor a directory (a race with deletion).
    pub fn add(&self, path: &str) -> Option<NodeRecord> {
        if let Some(parent) = Path::new(path).parent() {
            let mut folder_path = ROOT.to_string();
            for component in parent.components() {
                let name = component.as_os_str().to_string_lossy().into_owned();
                folder_path = if folder_path == ROOT {
                    name.clone()
                } else {
                    format!("{folder_path}/{name}")
                };
                if !self.map.contains(&folder_path) {
                    self.map.put(folder_path.clone(), NodeRecord::LocalFolder { name });
                }
            }
        }

        let absolute = self.root_path.join(path);
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());

        if absolute.is_file() {
            let metadata = std::fs::metadata(&absolute).ok()?;
            let record = self.record_for(&metadata, name);
            self.map.put(path, record.clone());
            Some(record)
        } else if absolute.is_dir() {
            let record = NodeRecord::LocalFolder { name };
            self.map.put(path, record.clone());
            Some(record)
        } else {
            None
        }
    }

    pub fn pop(&self, path: &str) -> Option<NodeRecord> {
        self.map.pop(path)
    }

    pub fn prune(&self, path: &str, inclusive: bool) -> Vec<String> {
        self.map.prune(path, inclusive)
    }

    pub fn re_key(&self, old: &str, new: &str) {
        self.map.re_key(old, new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("icloudds-localtree-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn refresh_populates_files_and_folders_skipping_ignored() {
        let dir = temp_dir("refresh");
        std::fs::create_dir_all(dir.join("a")).unwrap();
        std::fs::write(dir.join("a/b.txt"), b"hello").unwrap();
        std::fs::write(dir.join("a/.DS_Store"), b"junk").unwrap();

        let tree = LocalTree::new(&dir, RoundingFamily::Truncates);
        let filters = FilterSet::empty();
        tree.refresh(&filters);

        assert!(tree.map.contains("."));
        assert!(tree.map.contains("a"));
        assert!(tree.map.contains("a/b.txt"));
        assert!(!tree.map.contains("a/.DS_Store"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn add_backfills_missing_parent_folders() {
        let dir = temp_dir("add");
        std::fs::create_dir_all(dir.join("x/y")).unwrap();
        std::fs::write(dir.join("x/y/z.txt"), b"content").unwrap();

        let tree = LocalTree::new(&dir, RoundingFamily::Truncates);
        let record = tree.add("x/y/z.txt").expect("file exists");
        assert!(matches!(record, NodeRecord::LocalFile { size: 7, .. }));
        assert!(tree.map.contains("x"));
        assert!(tree.map.contains("x/y"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn add_returns_none_for_a_path_that_no_longer_exists() {
        let dir = temp_dir("race");
        let tree = LocalTree::new(&dir, RoundingFamily::Truncates);
        assert!(tree.add("nope.txt").is_none());
        std::fs::remove_dir_all(&dir).ok();
    }
}
