//! Per-record completion tracking.
//!
//! Every record dispatched for download owns one group in a [`GroupArena`].
//! Object tasks report their row into the group slot matching the object's
//! catalog position; the task that resolves the last outstanding object gets
//! the completed rows back and is the only one to flush them.

use crate::sink::partial_path;
use crate::types::MetadataRow;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::sync::OnceCell;

/// Index of a group inside its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GroupId(usize);

/// A record's output directory, created at most once no matter how many
/// object tasks ask for it concurrently.
#[derive(Debug)]
pub(crate) struct RecordDir {
    path: PathBuf,
    created: OnceCell<()>,
}

impl RecordDir {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            created: OnceCell::new(),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the directory on first call; later calls wait for or reuse
    /// that result. A failed creation is retried by the next caller.
    pub(crate) async fn ensure(&self) -> io::Result<&Path> {
        self.created
            .get_or_try_init(|| tokio::fs::create_dir_all(&self.path))
            .await?;
        Ok(&self.path)
    }

    /// Hidden partial file for `target`, placed beside the record directory so
    /// an unfinished transfer never creates it.
    pub(crate) fn staging_path(&self, target: &Path) -> PathBuf {
        let dir_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        partial_path(&self.path.with_file_name(format!("{}.{}", dir_name, file_name)))
    }

}

#[derive(Debug)]
struct Slots {
    rows: Vec<Option<MetadataRow>>,
    remaining: usize,
}

#[derive(Debug)]
pub(crate) struct RecordGroup {
    pub(crate) record_id: String,
    pub(crate) dir: RecordDir,
    slots: Mutex<Slots>,
}

/// Fixed set of record groups for one run.
#[derive(Debug, Default)]
pub(crate) struct GroupArena {
    groups: Vec<RecordGroup>,
}

impl GroupArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a record expecting `objects` results.
    pub(crate) fn add(&mut self, record_id: &str, dir: PathBuf, objects: usize) -> GroupId {
        self.groups.push(RecordGroup {
            record_id: record_id.to_string(),
            dir: RecordDir::new(dir),
            slots: Mutex::new(Slots {
                rows: vec![None; objects],
                remaining: objects,
            }),
        });
        GroupId(self.groups.len() - 1)
    }

    pub(crate) fn get(&self, id: GroupId) -> &RecordGroup {
        &self.groups[id.0]
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.len()
    }

    /// Stores the row of object `index` of group `id`.
    ///
    /// Returns every row of the group, in catalog order, to exactly one
    /// caller: the one completing the group. A second report for the same
    /// slot is ignored.
    pub(crate) fn complete(
        &self,
        id: GroupId,
        index: usize,
        row: MetadataRow,
    ) -> Option<Vec<MetadataRow>> {
        let group = self.get(id);
        let mut slots = group.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.rows.get_mut(index) {
            Some(slot @ None) => *slot = Some(row),
            _ => return None,
        }
        slots.remaining -= 1;
        if slots.remaining > 0 {
            return None;
        }
        Some(slots.rows.iter_mut().filter_map(Option::take).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DownloadStatus;
    use std::sync::Arc;

    fn row(name: &str) -> MetadataRow {
        MetadataRow {
            object_filename: name.to_string(),
            source_url: format!("https://s3/{}", name),
            record_id: "r".to_string(),
            download_timestamp: "2024-01-01T00:00:00Z".to_string(),
            byte_size: 1,
            status: DownloadStatus::Succeeded,
            cause: None,
        }
    }

    #[test]
    fn test_group_completes_once_in_catalog_order() {
        let mut arena = GroupArena::new();
        let id = arena.add("r", PathBuf::from("/tmp/r"), 3);

        assert!(arena.complete(id, 2, row("c")).is_none());
        assert!(arena.complete(id, 0, row("a")).is_none());
        // Duplicate report does not count towards completion.
        assert!(arena.complete(id, 0, row("a")).is_none());
        let rows = arena.complete(id, 1, row("b")).unwrap();

        let names: Vec<_> = rows.iter().map(|r| r.object_filename.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(arena.complete(id, 1, row("b")).is_none());
    }

    #[test]
    fn test_groups_are_independent() {
        let mut arena = GroupArena::new();
        let a = arena.add("a", PathBuf::from("/tmp/a"), 2);
        let b = arena.add("b", PathBuf::from("/tmp/b"), 1);

        assert!(arena.complete(a, 0, row("a0")).is_none());
        assert_eq!(arena.complete(b, 0, row("b0")).unwrap().len(), 1);
        assert_eq!(arena.complete(a, 1, row("a1")).unwrap().len(), 2);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_staging_path_sits_beside_record_dir() {
        let dir = RecordDir::new(PathBuf::from("/out/output_1/7_map"));
        assert_eq!(
            dir.staging_path(&dir.path().join("scan.jpg")),
            PathBuf::from("/out/output_1/.7_map.scan.jpg.part")
        );
    }

    #[tokio::test]
    async fn test_record_dir_created_once_under_contention() {
        let root = tempfile::tempdir().unwrap();
        let dir = Arc::new(RecordDir::new(root.path().join("nested").join("rec")));
        assert!(!dir.path().exists());

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let dir = Arc::clone(&dir);
            tasks.spawn(async move { dir.ensure().await.map(Path::to_path_buf) });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        assert!(dir.path().is_dir());
        assert!(dir.path().is_dir());
    }
}
