//! Filesystem-backed population ledger.
//!
//! The shared output root is the only coordination substrate between nodes.
//! Every candidate owns one file per artifact category, and the number of
//! terminal records (successes plus failures) is the population size.
//!
//! Layout:
//!
//! ```text
//! root/
//!   xml/<id>.xml                 definition
//!   unimal_init/<id>.json        init state
//!   models/<id>.pt               trained model
//!   metadata/<id>.json           success record
//!   error_metadata/<id>.json     failure record
//!   images/<id>.jpg
//!   videos/<id>.mp4
//!   .claims/<id>                 terminal record claim
//!   init_setup_done              setup sentinel
//!   <node>_<pid>                 worker crash marker
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::schema::{CandidateId, ErrorMetadata, Metadata};

/// Name of the sentinel written once population setup has finished.
pub const SETUP_SENTINEL: &str = "init_setup_done";

/// Hidden folder holding one claim file per candidate with a terminal record.
pub const CLAIMS_DIR: &str = ".claims";

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Artifact categories kept per candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Candidate definition handed to the evaluator.
    Definition,
    /// Representation the mutation operator starts from.
    InitState,
    /// Trained model produced by the evaluator.
    Model,
    /// Success record.
    Metadata,
    /// Failure record.
    ErrorMetadata,
    /// Rendered image.
    Image,
    /// Rendered video.
    Video,
}

impl ArtifactKind {
    /// Every category, in layout order.
    pub const ALL: [ArtifactKind; 7] = [
        ArtifactKind::Definition,
        ArtifactKind::InitState,
        ArtifactKind::Model,
        ArtifactKind::Metadata,
        ArtifactKind::ErrorMetadata,
        ArtifactKind::Image,
        ArtifactKind::Video,
    ];

    /// Subfolder of the output root.
    pub fn folder(self) -> &'static str {
        match self {
            ArtifactKind::Definition => "xml",
            ArtifactKind::InitState => "unimal_init",
            ArtifactKind::Model => "models",
            ArtifactKind::Metadata => "metadata",
            ArtifactKind::ErrorMetadata => "error_metadata",
            ArtifactKind::Image => "images",
            ArtifactKind::Video => "videos",
        }
    }

    /// File extension.
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Definition => "xml",
            ArtifactKind::InitState => "json",
            ArtifactKind::Model => "pt",
            ArtifactKind::Metadata => "json",
            ArtifactKind::ErrorMetadata => "json",
            ArtifactKind::Image => "jpg",
            ArtifactKind::Video => "mp4",
        }
    }
}

/// Ordering applied by [`PopulationStore::list_ids`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    /// File name order.
    Name,
    /// Oldest first, ties broken by id creation order.
    ModifiedTime,
}

/// A terminal record and its position in population order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedOutcome {
    pub id: CandidateId,
    pub rank: usize,
    /// `true` for Metadata, `false` for ErrorMetadata.
    pub success: bool,
}

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed record {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Candidate {id} already has a terminal record")]
    WriteConflict { id: CandidateId },
}

/// A visible file in one category folder.
struct Entry {
    stem: String,
    path: PathBuf,
}

/// Handle on the shared output root.
#[derive(Debug, Clone)]
pub struct PopulationStore {
    root: PathBuf,
}

impl PopulationStore {
    /// Create a store rooted at `root`. Nothing is touched on disk.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and every category folder.
    pub fn ensure_layout(&self) -> Result<(), StoreError> {
        for kind in ArtifactKind::ALL {
            let folder = self.folder(kind);
            fs::create_dir_all(&folder).map_err(io_error(&folder))?;
        }
        Ok(())
    }

    /// Folder holding one category.
    pub fn folder(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.folder())
    }

    /// Path of one artifact.
    pub fn path(&self, id: &CandidateId, kind: ArtifactKind) -> PathBuf {
        self.folder(kind)
            .join(format!("{}.{}", id, kind.extension()))
    }

    pub fn exists(&self, id: &CandidateId, kind: ArtifactKind) -> bool {
        self.path(id, kind).is_file()
    }

    /// Whether the candidate has reached a terminal outcome.
    pub fn is_evaluated(&self, id: &CandidateId) -> bool {
        self.exists(id, ArtifactKind::Metadata) || self.exists(id, ArtifactKind::ErrorMetadata)
    }

    /// Ids present in a category, optionally filtered by a file-name pattern.
    ///
    /// Files whose stem is not a candidate id are skipped.
    pub fn list_ids(
        &self,
        kind: ArtifactKind,
        pattern: Option<&Regex>,
        sort_by: SortBy,
    ) -> Result<Vec<CandidateId>, StoreError> {
        let mut entries: Vec<Entry> = self
            .entries(kind)?
            .into_iter()
            .filter(|entry| {
                pattern.is_none_or(|re| {
                    entry
                        .path
                        .file_name()
                        .is_some_and(|name| re.is_match(&name.to_string_lossy()))
                })
            })
            .collect();

        match sort_by {
            SortBy::Name => entries.sort_by(|a, b| a.stem.cmp(&b.stem)),
            SortBy::ModifiedTime => {
                let mut timed = Vec::with_capacity(entries.len());
                for entry in entries {
                    timed.push((modified_time(&entry.path)?, entry));
                }
                timed.sort_by(|(ta, a), (tb, b)| {
                    ta.cmp(tb).then_with(|| creation_then_name(a, b))
                });
                entries = timed.into_iter().map(|(_, entry)| entry).collect();
            }
        }

        Ok(entries
            .into_iter()
            .filter_map(|entry| parse_stem(&entry))
            .collect())
    }

    /// Population size: successes plus failures.
    pub fn size(&self) -> Result<usize, StoreError> {
        Ok(self.entries(ArtifactKind::Metadata)?.len()
            + self.entries(ArtifactKind::ErrorMetadata)?.len())
    }

    /// Record a successful evaluation.
    pub fn write_metadata(&self, metadata: &Metadata) -> Result<PathBuf, StoreError> {
        self.write_terminal(
            &metadata.id,
            ArtifactKind::Metadata,
            ArtifactKind::ErrorMetadata,
            metadata,
        )
    }

    /// Record a failed evaluation.
    pub fn write_error_metadata(&self, record: &ErrorMetadata) -> Result<PathBuf, StoreError> {
        self.write_terminal(
            &record.id,
            ArtifactKind::ErrorMetadata,
            ArtifactKind::Metadata,
            record,
        )
    }

    /// Load a success record.
    pub fn load_metadata(&self, id: &CandidateId) -> Result<Metadata, StoreError> {
        load_json(&self.path(id, ArtifactKind::Metadata))
    }

    /// Load a failure record.
    pub fn load_error_metadata(&self, id: &CandidateId) -> Result<ErrorMetadata, StoreError> {
        load_json(&self.path(id, ArtifactKind::ErrorMetadata))
    }

    /// Delete one artifact. Returns `false` if it did not exist.
    ///
    /// Removing a terminal record also releases the id's claim.
    pub fn remove(&self, id: &CandidateId, kind: ArtifactKind) -> Result<bool, StoreError> {
        let removed = remove_if_exists(&self.path(id, kind))?;
        if removed && matches!(kind, ArtifactKind::Metadata | ArtifactKind::ErrorMetadata) {
            remove_if_exists(&self.claim_path(id))?;
        }
        Ok(removed)
    }

    /// All terminal records in population order.
    ///
    /// Rank is the position by modification time, ties broken by creation
    /// order of the id, across both successes and failures.
    pub fn ranked_outcomes(&self) -> Result<Vec<RankedOutcome>, StoreError> {
        let mut timed = Vec::new();
        for (kind, success) in [
            (ArtifactKind::Metadata, true),
            (ArtifactKind::ErrorMetadata, false),
        ] {
            for entry in self.entries(kind)? {
                if let Some(id) = parse_stem(&entry) {
                    timed.push((modified_time(&entry.path)?, entry.stem, id, success));
                }
            }
        }
        timed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.2.creation_cmp(&b.2)));

        Ok(timed
            .into_iter()
            .enumerate()
            .map(|(rank, (_, _, id, success))| RankedOutcome { id, rank, success })
            .collect())
    }

    /// Success records ranked at or above `min_rank`.
    pub fn successes_from_rank(&self, min_rank: usize) -> Result<Vec<Metadata>, StoreError> {
        self.ranked_outcomes()?
            .into_iter()
            .filter(|outcome| outcome.success && outcome.rank >= min_rank)
            .map(|outcome| self.load_metadata(&outcome.id))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Sentinel and crash markers
    // ------------------------------------------------------------------------

    pub fn sentinel_path(&self) -> PathBuf {
        self.root.join(SETUP_SENTINEL)
    }

    /// Whether population setup has completed.
    pub fn setup_done(&self) -> bool {
        self.sentinel_path().exists()
    }

    /// Mark population setup as completed.
    pub fn mark_setup_done(&self) -> Result<(), StoreError> {
        let path = self.sentinel_path();
        fs::write(&path, b"").map_err(io_error(&path))
    }

    /// Out-of-band error marker for a worker process.
    pub fn crash_marker_path(&self, node_id: usize, pid: u32) -> PathBuf {
        self.root.join(format!("{}_{}", node_id, pid))
    }

    pub fn has_crash_marker(&self, node_id: usize, pid: u32) -> bool {
        self.crash_marker_path(node_id, pid).exists()
    }

    /// Signal that worker `pid` on `node_id` hit a fatal error.
    pub fn write_crash_marker(
        &self,
        node_id: usize,
        pid: u32,
        message: &str,
    ) -> Result<PathBuf, StoreError> {
        let path = self.crash_marker_path(node_id, pid);
        fs::write(&path, message).map_err(io_error(&path))?;
        Ok(path)
    }

    /// Remove a crash marker. Returns `false` if there was none.
    pub fn clear_crash_marker(&self, node_id: usize, pid: u32) -> Result<bool, StoreError> {
        remove_if_exists(&self.crash_marker_path(node_id, pid))
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Create-exclusive write of a terminal record.
    ///
    /// Both record categories share one claim file per id, created with
    /// `create_new`; whoever creates it owns the id. The record is then
    /// staged in a hidden file and hard-linked into place, so readers never
    /// observe a partial record.
    fn write_terminal<T: Serialize>(
        &self,
        id: &CandidateId,
        kind: ArtifactKind,
        other: ArtifactKind,
        record: &T,
    ) -> Result<PathBuf, StoreError> {
        if self.exists(id, other) || self.exists(id, kind) {
            return Err(StoreError::WriteConflict { id: id.clone() });
        }

        let claim = self.claim(id, kind)?;
        let result = self.publish(id, kind, record);
        if let Err(e) = &result
            && !matches!(e, StoreError::WriteConflict { .. })
        {
            // Nothing landed, so the id is free again.
            if let Err(e) = fs::remove_file(&claim) {
                log::warn!("Failed to release claim {}: {}", claim.display(), e);
            }
        }
        result
    }

    fn claim_path(&self, id: &CandidateId) -> PathBuf {
        self.root.join(CLAIMS_DIR).join(id.to_string())
    }

    /// Take the per-id claim shared by both record categories.
    fn claim(&self, id: &CandidateId, kind: ArtifactKind) -> Result<PathBuf, StoreError> {
        let folder = self.root.join(CLAIMS_DIR);
        fs::create_dir_all(&folder).map_err(io_error(&folder))?;

        let path = self.claim_path(id);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => match file.write_all(kind.folder().as_bytes()) {
                Ok(()) => Ok(path),
                Err(source) => {
                    let _ = fs::remove_file(&path);
                    Err(StoreError::Io { path, source })
                }
            },
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StoreError::WriteConflict { id: id.clone() })
            }
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }

    /// Stage the record and link it into its category folder.
    fn publish<T: Serialize>(
        &self,
        id: &CandidateId,
        kind: ArtifactKind,
        record: &T,
    ) -> Result<PathBuf, StoreError> {
        let target = self.path(id, kind);
        let json = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Json {
            path: target.clone(),
            source,
        })?;

        let folder = self.folder(kind);
        fs::create_dir_all(&folder).map_err(io_error(&folder))?;
        let staging = folder.join(format!(
            ".{}.{}.{}.tmp",
            id,
            std::process::id(),
            STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&staging, json).map_err(io_error(&staging))?;

        let linked = fs::hard_link(&staging, &target);
        if let Err(e) = fs::remove_file(&staging) {
            log::warn!("Failed to remove staging file {}: {}", staging.display(), e);
        }

        match linked {
            Ok(()) => Ok(target),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StoreError::WriteConflict { id: id.clone() })
            }
            Err(e) => Err(StoreError::Io {
                path: target,
                source: e,
            }),
        }
    }

    /// Visible files with the category's extension. A missing folder is empty.
    fn entries(&self, kind: ArtifactKind) -> Result<Vec<Entry>, StoreError> {
        let folder = self.folder(kind);
        let read_dir = match fs::read_dir(&folder) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::Io {
                    path: folder,
                    source: e,
                });
            }
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let path = entry.map_err(io_error(&folder))?.path();
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if path.extension().is_some_and(|e| e == kind.extension())
                && let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned())
            {
                entries.push(Entry { stem, path });
            }
        }
        Ok(entries)
    }
}

/// Tie-break for equal modification times.
fn creation_then_name(a: &Entry, b: &Entry) -> std::cmp::Ordering {
    match (a.stem.parse::<CandidateId>(), b.stem.parse::<CandidateId>()) {
        (Ok(x), Ok(y)) => x.creation_cmp(&y),
        _ => a.stem.cmp(&b.stem),
    }
}

fn parse_stem(entry: &Entry) -> Option<CandidateId> {
    match entry.stem.parse() {
        Ok(id) => Some(id),
        Err(e) => {
            log::debug!("Skipping {}: {}", entry.path.display(), e);
            None
        }
    }
}

fn modified_time(path: &Path) -> Result<SystemTime, StoreError> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(io_error(path))
}

fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    serde_json::from_str(&content).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::tempdir;

    fn id(node: usize, index: usize) -> CandidateId {
        CandidateId::new(node, index, "18-10-00-00-000")
    }

    fn failure(id: CandidateId) -> ErrorMetadata {
        ErrorMetadata {
            id,
            node_id: 0,
            worker_id: Some(0),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_layout_and_paths() {
        let dir = tempdir().unwrap();
        let store = PopulationStore::new(dir.path());
        store.ensure_layout().unwrap();

        for kind in ArtifactKind::ALL {
            assert!(store.folder(kind).is_dir());
        }
        assert_eq!(
            store.path(&id(1, 2), ArtifactKind::Definition),
            dir.path().join("xml/1-2-18-10-00-00-000.xml")
        );
    }

    #[test]
    fn test_size_counts_both_outcomes() {
        let dir = tempdir().unwrap();
        let store = PopulationStore::new(dir.path());
        assert_eq!(store.size().unwrap(), 0);

        store.write_metadata(&Metadata::root(id(0, 0), 1.0, 1.0)).unwrap();
        store.write_metadata(&Metadata::root(id(0, 1), 2.0, 1.0)).unwrap();
        store.write_error_metadata(&failure(id(0, 2))).unwrap();

        assert_eq!(store.size().unwrap(), 3);
        assert!(store.is_evaluated(&id(0, 2)));
        assert!(!store.is_evaluated(&id(0, 3)));
    }

    #[test]
    fn test_second_terminal_write_conflicts() {
        let dir = tempdir().unwrap();
        let store = PopulationStore::new(dir.path());

        store.write_metadata(&Metadata::root(id(0, 0), 1.0, 1.0)).unwrap();
        assert!(matches!(
            store.write_metadata(&Metadata::root(id(0, 0), 9.0, 1.0)),
            Err(StoreError::WriteConflict { .. })
        ));
        assert!(matches!(
            store.write_error_metadata(&failure(id(0, 0))),
            Err(StoreError::WriteConflict { .. })
        ));

        store.write_error_metadata(&failure(id(0, 1))).unwrap();
        assert!(matches!(
            store.write_metadata(&Metadata::root(id(0, 1), 1.0, 1.0)),
            Err(StoreError::WriteConflict { .. })
        ));

        // The first record is untouched.
        assert_eq!(store.load_metadata(&id(0, 0)).unwrap().reward, 1.0);
        assert_eq!(store.size().unwrap(), 2);
    }

    #[test]
    fn test_concurrent_writers_single_winner() {
        let dir = tempdir().unwrap();
        let store = Arc::new(PopulationStore::new(dir.path()));
        store.ensure_layout().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store
                        .write_metadata(&Metadata::root(id(0, 0), i as f64, 1.0))
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(store.size().unwrap(), 1);
    }

    #[test]
    fn test_success_and_failure_race_single_winner() {
        let dir = tempdir().unwrap();
        let store = Arc::new(PopulationStore::new(dir.path()));
        store.ensure_layout().unwrap();

        let rounds = 200;
        for round in 0..rounds {
            let barrier = Arc::new(Barrier::new(2));
            let success = {
                let (store, barrier) = (Arc::clone(&store), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    store
                        .write_metadata(&Metadata::root(id(0, round), 1.0, 1.0))
                        .is_ok()
                })
            };
            let failed = {
                let (store, barrier) = (Arc::clone(&store), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    store.write_error_metadata(&failure(id(0, round))).is_ok()
                })
            };

            let winners = [success.join().unwrap(), failed.join().unwrap()]
                .into_iter()
                .filter(|ok| *ok)
                .count();
            assert_eq!(winners, 1, "round {}", round);
            assert!(
                !(store.exists(&id(0, round), ArtifactKind::Metadata)
                    && store.exists(&id(0, round), ArtifactKind::ErrorMetadata))
            );
        }
        assert_eq!(store.size().unwrap(), rounds);
    }

    #[test]
    fn test_equal_mtimes_rank_in_creation_order() {
        let dir = tempdir().unwrap();
        let store = PopulationStore::new(dir.path());

        let stamp = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        for index in [10, 2, 0, 11, 1] {
            let path = store
                .write_metadata(&Metadata::root(id(0, index), index as f64, 1.0))
                .unwrap();
            fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(stamp)
                .unwrap();
        }

        let ranked: Vec<usize> = store
            .ranked_outcomes()
            .unwrap()
            .iter()
            .map(|o| o.id.index())
            .collect();
        assert_eq!(ranked, vec![0, 1, 2, 10, 11]);

        let listed: Vec<usize> = store
            .list_ids(ArtifactKind::Metadata, None, SortBy::ModifiedTime)
            .unwrap()
            .iter()
            .map(CandidateId::index)
            .collect();
        assert_eq!(listed, vec![0, 1, 2, 10, 11]);
    }

    #[test]
    fn test_list_ids_filters_and_sorts() {
        let dir = tempdir().unwrap();
        let store = PopulationStore::new(dir.path());
        store.ensure_layout().unwrap();

        for (node, index) in [(1, 0), (0, 5), (0, 1)] {
            fs::write(store.path(&id(node, index), ArtifactKind::Definition), "<x/>").unwrap();
        }
        fs::write(store.folder(ArtifactKind::Definition).join("notes.txt"), "").unwrap();
        fs::write(store.folder(ArtifactKind::Definition).join("garbage.xml"), "").unwrap();

        let ids = store
            .list_ids(ArtifactKind::Definition, None, SortBy::Name)
            .unwrap();
        assert_eq!(ids, vec![id(0, 1), id(0, 5), id(1, 0)]);

        let node_one = Regex::new(r"^1-.*\.xml$").unwrap();
        let ids = store
            .list_ids(ArtifactKind::Definition, Some(&node_one), SortBy::ModifiedTime)
            .unwrap();
        assert_eq!(ids, vec![id(1, 0)]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = PopulationStore::new(dir.path());
        store.ensure_layout().unwrap();

        let path = store.path(&id(0, 0), ArtifactKind::Image);
        fs::write(&path, b"jpg").unwrap();
        assert!(store.remove(&id(0, 0), ArtifactKind::Image).unwrap());
        assert!(!store.remove(&id(0, 0), ArtifactKind::Image).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_removed_record_can_be_rewritten() {
        let dir = tempdir().unwrap();
        let store = PopulationStore::new(dir.path());
        store.ensure_layout().unwrap();

        store.write_error_metadata(&failure(id(0, 0))).unwrap();
        assert!(store.remove(&id(0, 0), ArtifactKind::ErrorMetadata).unwrap());
        store.write_metadata(&Metadata::root(id(0, 0), 1.0, 1.0)).unwrap();
        assert!(store.exists(&id(0, 0), ArtifactKind::Metadata));
    }

    #[test]
    fn test_ranked_outcomes_follow_write_order() {
        let dir = tempdir().unwrap();
        let store = PopulationStore::new(dir.path());

        store.write_metadata(&Metadata::root(id(0, 0), 1.0, 1.0)).unwrap();
        store.write_error_metadata(&failure(id(0, 1))).unwrap();
        store.write_metadata(&Metadata::root(id(0, 2), 3.0, 1.0)).unwrap();

        let ranked = store.ranked_outcomes().unwrap();
        let order: Vec<_> = ranked.iter().map(|o| (o.id.index(), o.success)).collect();
        assert_eq!(order, vec![(0, true), (1, false), (2, true)]);

        let eligible = store.successes_from_rank(1).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, id(0, 2));
    }

    #[test]
    fn test_sentinel_and_crash_markers() {
        let dir = tempdir().unwrap();
        let store = PopulationStore::new(dir.path());

        assert!(!store.setup_done());
        store.mark_setup_done().unwrap();
        assert!(store.setup_done());

        assert!(!store.has_crash_marker(1, 4242));
        store.write_crash_marker(1, 4242, "fatal").unwrap();
        assert!(store.has_crash_marker(1, 4242));
        assert!(store.clear_crash_marker(1, 4242).unwrap());
        assert!(!store.has_crash_marker(1, 4242));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            #[test]
            fn prop_size_is_successes_plus_errors(outcomes in proptest::collection::vec(any::<bool>(), 0..30)) {
                let dir = tempdir().unwrap();
                let store = PopulationStore::new(dir.path());

                for (i, success) in outcomes.iter().enumerate() {
                    if *success {
                        store.write_metadata(&Metadata::root(id(0, i), i as f64, 0.0)).unwrap();
                    } else {
                        store.write_error_metadata(&failure(id(0, i))).unwrap();
                    }
                }

                prop_assert_eq!(store.size().unwrap(), outcomes.len());
            }
        }
    }
}
