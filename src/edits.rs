//! File-edit mirroring: watch directories for changes made by forwarded
//! requests and turn them into `FIL`/`LST` pseudo-traffic.
//!
//! The dispatcher snapshots watched paths before a recorded request and
//! diffs afterwards. Added or changed files are copied into the record-side
//! edit directory and journalled; replay copies them back out.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::warn;

use crate::traffic::{TrafficItem, TrafficTag};

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileState {
    modified: Option<SystemTime>,
    size: u64,
}

#[derive(Debug, Default)]
pub struct EditTracker {
    watched: Vec<PathBuf>,
    record_dir: Option<PathBuf>,
    replay_dir: Option<PathBuf>,
    ignored: Vec<String>,
    snapshot: BTreeMap<PathBuf, FileState>,
}

impl EditTracker {
    pub fn new(record_dir: Option<PathBuf>, replay_dir: Option<PathBuf>, ignored: Vec<String>) -> Self {
        Self {
            record_dir,
            replay_dir,
            ignored,
            ..Self::default()
        }
    }

    pub fn is_active(&self) -> bool {
        !self.watched.is_empty() && (self.record_dir.is_some() || self.replay_dir.is_some())
    }

    pub fn record_dir(&self) -> Option<&Path> {
        self.record_dir.as_deref()
    }

    pub fn watch(&mut self, path: PathBuf) {
        if !self.watched.contains(&path) {
            self.watched.push(path);
        }
    }

    /// Capture the current state of every watched path.
    pub fn snapshot(&mut self) {
        self.snapshot = self.scan();
    }

    /// Diff against the last snapshot: one `FIL` item per added or changed
    /// file (payload copied into the record directory), one per deletion.
    pub fn diff_since_snapshot(&mut self) -> Vec<TrafficItem> {
        let current = self.scan();
        let mut items = Vec::new();
        for (path, state) in &current {
            if self.snapshot.get(path) != Some(state) {
                if let Some(item) = self.capture_file(path) {
                    items.push(item);
                }
            }
        }
        for path in self.snapshot.keys() {
            if !current.contains_key(path) {
                items.push(TrafficItem::outgoing(
                    TrafficTag::Fil,
                    format!("deleted {}", path.display()),
                ));
            }
        }
        self.snapshot = current;
        items
    }

    fn capture_file(&self, path: &Path) -> Option<TrafficItem> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                warn!("Could not capture edited file {}: {e}", path.display());
                return None;
            }
        };
        if let Some(record_dir) = &self.record_dir {
            let stored = record_dir.join(stored_name(path));
            if let Err(e) = std::fs::write(&stored, &data) {
                warn!("Could not store edit copy {}: {e}", stored.display());
            }
        }
        Some(TrafficItem::outgoing(TrafficTag::Fil, path.display().to_string()).with_data(data))
    }

    /// Recreate a journalled edit during replay.
    pub fn apply_edit(&self, item: &TrafficItem) {
        if let Some(deleted) = item.text.strip_prefix("deleted ") {
            if let Err(e) = std::fs::remove_file(deleted) {
                warn!("Could not replay deletion of {deleted}: {e}");
            }
            return;
        }
        let target = PathBuf::from(&item.text);
        let data = match &item.data {
            Some(data) => data.clone(),
            None => {
                let Some(replay_dir) = &self.replay_dir else {
                    return;
                };
                match std::fs::read(replay_dir.join(stored_name(&target))) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("No stored edit copy for {}: {e}", target.display());
                        return;
                    }
                }
            }
        };
        if let Some(parent) = target.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&target, data) {
            warn!("Could not replay edit of {}: {e}", target.display());
        }
    }

    fn scan(&self) -> BTreeMap<PathBuf, FileState> {
        let mut state = BTreeMap::new();
        for root in &self.watched {
            self.scan_path(root, &mut state);
        }
        state
    }

    fn scan_path(&self, path: &Path, state: &mut BTreeMap<PathBuf, FileState>) {
        if self.is_ignored(path) {
            return;
        }
        let Ok(metadata) = std::fs::metadata(path) else {
            return;
        };
        if metadata.is_dir() {
            let Ok(entries) = std::fs::read_dir(path) else {
                return;
            };
            for entry in entries.flatten() {
                self.scan_path(&entry.path(), state);
            }
        } else {
            state.insert(
                path.to_path_buf(),
                FileState {
                    modified: metadata.modified().ok(),
                    size: metadata.len(),
                },
            );
        }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.ignored.iter().any(|pattern| name == pattern)
    }
}

/// Flat name for the stored copy of an edited file.
fn stored_name(path: &Path) -> String {
    path.display().to_string().replace(['/', '\\'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_and_changed_files_become_fil_items() {
        let dir = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let mut tracker =
            EditTracker::new(Some(store.path().to_path_buf()), None, vec!["ignored.log".into()]);
        tracker.watch(dir.path().to_path_buf());

        std::fs::write(dir.path().join("a.txt"), "one").unwrap();
        std::fs::write(dir.path().join("ignored.log"), "noise").unwrap();
        tracker.snapshot();

        std::fs::write(dir.path().join("a.txt"), "two bytes longer").unwrap();
        std::fs::write(dir.path().join("b.txt"), "new").unwrap();
        let items = tracker.diff_since_snapshot();

        let mut texts: Vec<&str> = items.iter().map(|i| i.text.as_str()).collect();
        texts.sort_unstable();
        assert_eq!(texts.len(), 2);
        assert!(texts[0].ends_with("a.txt"));
        assert!(texts[1].ends_with("b.txt"));
        assert!(items.iter().all(|i| i.tag == TrafficTag::Fil && i.data.is_some()));
        // copies stored for replay
        assert_eq!(std::fs::read_dir(store.path()).unwrap().count(), 2);
    }

    #[test]
    fn deletions_are_reported_and_replayable() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = EditTracker::new(None, None, Vec::new());
        tracker.watch(dir.path().to_path_buf());

        let victim = dir.path().join("doomed.txt");
        std::fs::write(&victim, "bye").unwrap();
        tracker.snapshot();
        std::fs::remove_file(&victim).unwrap();

        let items = tracker.diff_since_snapshot();
        assert_eq!(items.len(), 1);
        assert!(items[0].text.starts_with("deleted "));

        // replaying the deletion against a recreated file removes it again
        std::fs::write(&victim, "back").unwrap();
        tracker.apply_edit(&items[0]);
        assert!(!victim.exists());
    }

    #[test]
    fn edits_with_inline_data_replay_to_their_target() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = EditTracker::new(None, None, Vec::new());
        let target = dir.path().join("out/result.txt");
        let item = TrafficItem::outgoing(TrafficTag::Fil, target.display().to_string())
            .with_data(b"payload".to_vec());
        tracker.apply_edit(&item);
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
    }
}
