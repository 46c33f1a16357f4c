//! Tagged node records stored in a [`crate::path_map::PathMap`].

use chrono::{DateTime, Utc};

/// One entry of a synchronized tree: either side of the sync, file or folder.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeRecord {
    LocalFile {
        name: String,
        size: u64,
        mtime: DateTime<Utc>,
        ctime: DateTime<Utc>,
    },
    LocalFolder {
        name: String,
    },
    RemoteFile {
        name: String,
        size: u64,
        mtime: DateTime<Utc>,
        ctime: DateTime<Utc>,
        stable_id: String,
        handle: RemoteHandle,
        /// Set only for entries fetched from the trash side: the path the
        /// item would restore to, used to match it back to a local file.
        restore_path: Option<String>,
    },
    RemoteFolder {
        name: String,
        stable_id: String,
        file_count: u64,
        direct_children_count: u64,
        number_of_items: u64,
        handle: RemoteHandle,
    },
}

/// Opaque reference to a remote node, passed back to [`crate::drive_api::DriveApi`]
/// calls that need to address it. The core never interprets its contents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteHandle(pub String);

impl NodeRecord {
    pub fn name(&self) -> &str {
        match self {
            NodeRecord::LocalFile { name, .. }
            | NodeRecord::LocalFolder { name }
            | NodeRecord::RemoteFile { name, .. }
            | NodeRecord::RemoteFolder { name, .. } => name,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, NodeRecord::LocalFolder { .. } | NodeRecord::RemoteFolder { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, NodeRecord::RemoteFile { .. } | NodeRecord::RemoteFolder { .. })
    }

    pub fn size(&self) -> u64 {
        match self {
            NodeRecord::LocalFile { size, .. } | NodeRecord::RemoteFile { size, .. } => *size,
            _ => 0,
        }
    }

    pub fn mtime(&self) -> Option<DateTime<Utc>> {
        match self {
            NodeRecord::LocalFile { mtime, .. } | NodeRecord::RemoteFile { mtime, .. } => Some(*mtime),
            _ => None,
        }
    }

    /// Restore path of a trashed remote file, if known.
    pub fn restore_path(&self) -> Option<&str> {
        match self {
            NodeRecord::RemoteFile { restore_path, .. } => restore_path.as_deref(),
            _ => None,
        }
    }

    pub fn stable_id(&self) -> Option<&str> {
        match self {
            NodeRecord::RemoteFile { stable_id, .. } | NodeRecord::RemoteFolder { stable_id, .. } => {
                Some(stable_id)
            }
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<&RemoteHandle> {
        match self {
            NodeRecord::RemoteFile { handle, .. } | NodeRecord::RemoteFolder { handle, .. } => Some(handle),
            _ => None,
        }
    }
}

/// Whether this OS rounds sub-second mtimes up (Linux) or truncates them
/// (Darwin and everything else), matching how the remote service stores
/// whole-second timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingFamily {
    RoundsUp,
    Truncates,
}

pub fn rounding_family() -> RoundingFamily {
    if cfg!(target_os = "linux") {
        RoundingFamily::RoundsUp
    } else {
        RoundingFamily::Truncates
    }
}

/// Round a timestamp to whole seconds per [`rounding_family`], so that a
/// local mtime and the remote's whole-second mtime compare equal for
/// unchanged content.
pub fn round_to_whole_seconds(t: DateTime<Utc>, family: RoundingFamily) -> DateTime<Utc> {
    use chrono::Timelike;
    let truncated = t.date_naive().and_hms_opt(t.hour(), t.minute(), t.second()).unwrap();
    let truncated = DateTime::<Utc>::from_naive_utc_and_offset(truncated, Utc);
    match family {
        RoundingFamily::Truncates => truncated,
        RoundingFamily::RoundsUp => {
            if t.timestamp_subsec_nanos() >= 500_000_000 {
                truncated + chrono::Duration::seconds(1)
            } else {
                truncated
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn truncates_on_darwin_family() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::milliseconds(900);
        let rounded = round_to_whole_seconds(t, RoundingFamily::Truncates);
        assert_eq!(rounded, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn rounds_up_past_half_second_on_linux_family() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::milliseconds(600);
        let rounded = round_to_whole_seconds(t, RoundingFamily::RoundsUp);
        assert_eq!(rounded, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap());
    }

    #[test]
    fn does_not_round_up_below_half_second_on_linux_family() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::milliseconds(400);
        let rounded = round_to_whole_seconds(t, RoundingFamily::RoundsUp);
        assert_eq!(rounded, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }
}
