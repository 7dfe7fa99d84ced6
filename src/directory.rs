//! A synchronized directory: its on-disk index and temp-file pool
//!
//! One mutex covers both the filesystem scan and every read/write of the
//! index, so a hash taken during a scan can never interleave with a commit
//! of transferred content.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::checksum::BlockChecksum;
use crate::config::SyncConfig;
use crate::delta::DeltaAlgorithm;
use crate::events::{Event, EventBus};
use crate::hash::hash_file;
use crate::identity::PeerId;
use crate::index::{
    compare_file, now, FileIndex, FileRecord, IndexDiff, RecordState, SyncStatus, Timestamp,
};
use crate::paths;

struct IndexState {
    index: FileIndex,
    /// Size and mtime of each file when its current hash was taken. Not
    /// persisted: after a restart every file is hashed once more.
    observed: HashMap<String, Observed>,
    /// Bumped on every index mutation; peers are sent a full index only
    /// when this moved since the last one they got
    version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observed {
    len: u64,
    modified: SystemTime,
}

impl Observed {
    fn of(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
        Ok(Self {
            len: meta.len(),
            modified: meta.modified()?,
        })
    }
}

pub struct Directory {
    local_id: PeerId,
    root: PathBuf,
    index_path: PathBuf,
    temp_dir: PathBuf,
    state: Mutex<IndexState>,
    temp_files: Mutex<HashSet<PathBuf>>,
    events: Arc<EventBus>,
}

impl Directory {
    /// Open `root`, creating its temp dir and loading the persisted index
    pub fn open(
        local_id: PeerId,
        root: &Path,
        config: &SyncConfig,
        events: Arc<EventBus>,
    ) -> Result<Arc<Self>> {
        let root = fs::canonicalize(root)
            .with_context(|| format!("failed to canonicalize root path: {}", root.display()))?;
        if !root.is_dir() {
            bail!("root path is not a directory: {}", root.display());
        }

        let temp_dir = root.join(&config.temp_dir_name);
        fs::create_dir_all(&temp_dir)
            .with_context(|| format!("create temp dir {}", temp_dir.display()))?;
        purge_dir(&temp_dir);

        let directory = Self {
            local_id,
            index_path: root.join(&config.index_file_name),
            root,
            temp_dir,
            state: Mutex::new(IndexState {
                index: FileIndex::new(),
                observed: HashMap::new(),
                version: 0,
            }),
            temp_files: Mutex::new(HashSet::new()),
            events,
        };
        directory.load_index()?;
        Ok(Arc::new(directory))
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load_index(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.index = if self.index_path.is_file() {
            let raw = fs::read(&self.index_path)
                .with_context(|| format!("read index {}", self.index_path.display()))?;
            rmp_serde::from_slice(&raw)
                .with_context(|| format!("decode index {}", self.index_path.display()))?
        } else {
            FileIndex::new()
        };
        state.observed.clear();
        state.version += 1;
        debug!(files = state.index.len(), "index loaded");
        Ok(())
    }

    pub fn save_index(&self) -> Result<()> {
        let state = self.state.lock();
        self.write_index(&state.index)
    }

    // Caller holds the state lock
    fn write_index(&self, index: &FileIndex) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(index).context("encode index")?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.temp_dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all().ok();
        tmp.persist(&self.index_path)
            .with_context(|| format!("write index {}", self.index_path.display()))?;
        Ok(())
    }

    /// Rescan the tree and return the keys whose records changed.
    ///
    /// A file is rehashed whenever its size or mtime differs from when it
    /// was last hashed, and its record only advances when the hash actually
    /// differs, so touching a file never produces a new version. Tracked
    /// files missing from disk are stamped as deleted.
    pub fn update_index(&self) -> Result<BTreeSet<String>> {
        let mut changed = BTreeSet::new();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let stamp_at = now();
            let mut present = HashSet::new();

            for entry in WalkDir::new(&self.root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| e.path() != self.temp_dir)
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() || entry.path() == self.index_path {
                    continue;
                }
                let Some(key) = paths::relative_key(&self.root, entry.path()) else {
                    continue;
                };
                present.insert(key.clone());

                match self.scan_file(state, &key, entry.path(), stamp_at) {
                    Ok(true) => {
                        changed.insert(key);
                    }
                    Ok(false) => {}
                    Err(e) => warn!(file = %key, error = %e, "failed to index file"),
                }
            }

            for (key, record) in state.index.iter_mut() {
                if !present.contains(key) && !record.is_deleted() {
                    let at = record.next_stamp(self.local_id, stamp_at);
                    record.stamp(self.local_id, at, RecordState::Deleted);
                    state.observed.remove(key);
                    changed.insert(key.clone());
                }
            }

            if !changed.is_empty() {
                state.version += 1;
                self.write_index(&state.index)?;
            }
        }

        if !changed.is_empty() {
            info!(files = changed.len(), "local changes indexed");
            self.events.publish(Event::IndexChanged {
                paths: changed.clone(),
            });
        }
        Ok(changed)
    }

    fn scan_file(
        &self,
        state: &mut IndexState,
        key: &str,
        path: &Path,
        stamp_at: Timestamp,
    ) -> Result<bool> {
        // Taken before hashing: a write racing the hash leaves a newer mtime
        // behind and is picked up by the next scan
        let seen = Observed::of(path)?;
        let tracked = state.index.get(key).is_some_and(|r| !r.is_deleted());
        if tracked && state.observed.get(key) == Some(&seen) {
            return Ok(false);
        }

        let hash = hash_file(path)?;
        state.observed.insert(key.to_string(), seen);
        match state.index.get_mut(key) {
            None => {
                state.index.insert(
                    key.to_string(),
                    FileRecord::new_local(self.local_id, hash, stamp_at),
                );
                Ok(true)
            }
            Some(record) if record.hash() == Some(&hash) => Ok(false),
            Some(record) => {
                let at = record.next_stamp(self.local_id, stamp_at);
                record.stamp(self.local_id, at, RecordState::Active { hash });
                Ok(true)
            }
        }
    }

    pub fn record(&self, key: &str) -> Option<FileRecord> {
        self.state.lock().index.get(key).cloned()
    }

    /// Full index plus the version it corresponds to
    pub fn snapshot(&self) -> (FileIndex, u64) {
        let state = self.state.lock();
        (state.index.clone(), state.version)
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Subset of the index for an index delta
    pub fn records(&self, keys: &BTreeSet<String>) -> FileIndex {
        let state = self.state.lock();
        keys.iter()
            .filter_map(|k| state.index.get(k).map(|r| (k.clone(), r.clone())))
            .collect()
    }

    pub fn diff(&self, remote: &FileIndex) -> IndexDiff {
        IndexDiff::diff(&self.state.lock().index, remote)
    }

    /// Normalize a key received from a peer. The index file and the temp
    /// dir belong to the engine and are never valid keys.
    pub fn check_key(&self, key: &str) -> Result<String> {
        let key = paths::normalize_key(key)?;
        let reserved = [&self.index_path, &self.temp_dir]
            .into_iter()
            .filter_map(|p| paths::relative_key(&self.root, p));
        for name in reserved {
            if key == name || key.starts_with(&format!("{name}/")) {
                bail!("{key} is reserved");
            }
        }
        Ok(key)
    }

    pub fn file_path(&self, key: &str) -> Result<PathBuf> {
        let key = self.check_key(key)?;
        paths::resolve_under_root(&self.root, &key)
    }

    /// Block checksums of the current local copy, plus an open handle to
    /// that copy for later reconstruction. Empty when the file is not
    /// indexed, deleted, or missing.
    pub fn block_checksums(
        &self,
        key: &str,
        block_size: usize,
    ) -> Result<(Vec<BlockChecksum>, Option<File>)> {
        let path = self.file_path(key)?;
        let state = self.state.lock();
        if !state.index.get(key).is_some_and(|r| !r.is_deleted()) {
            return Ok((Vec::new(), None));
        }

        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), None)),
            Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
        };
        let checksums = DeltaAlgorithm::new(block_size).generate_checksums(BufReader::new(&file))?;
        Ok((checksums, Some(file)))
    }

    /// Reserve a fresh file in the temp dir, named after `proposed` when
    /// that name is free (`name`, `name-1`, `name-2`, ...)
    pub fn get_temp_path(&self, proposed: &str) -> Result<PathBuf> {
        let base = paths::temp_file_name(proposed);
        let mut temp_files = self.temp_files.lock();
        let mut name = base.clone();
        let mut suffix = 0u32;

        loop {
            let path = self.temp_dir.join(&name);
            if !temp_files.contains(&path) {
                match OpenOptions::new().write(true).create_new(true).open(&path) {
                    Ok(_) => {
                        temp_files.insert(path.clone());
                        return Ok(path);
                    }
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                    Err(e) => {
                        return Err(e).with_context(|| format!("create temp {}", path.display()))
                    }
                }
            }
            suffix += 1;
            name = format!("{base}-{suffix}");
        }
    }

    /// Return a temp file obtained from [`Directory::get_temp_path`] to the pool
    pub fn release_temp_file(&self, path: &Path) {
        if self.temp_files.lock().remove(path) {
            remove_if_exists(path);
        }
    }

    pub fn clear_temp_dir(&self) {
        let mut temp_files = self.temp_files.lock();
        for path in temp_files.drain() {
            remove_if_exists(&path);
        }
    }

    pub fn temp_file_count(&self) -> usize {
        self.temp_files.lock().len()
    }

    /// Atomically move a fully received temp file over `key` and record the
    /// sender's version. Returns the local commit timestamp, which the
    /// sender stores as this peer's entry in its sync log.
    pub fn commit_transfer(
        &self,
        key: &str,
        temp_path: &Path,
        incoming: &FileRecord,
    ) -> Result<Timestamp> {
        let target = self.file_path(key)?;
        let received = hash_file(temp_path)?;
        if incoming.hash() != Some(&received) {
            bail!("reconstructed {key} does not match the sender's content hash");
        }

        let at = now();
        {
            let mut state = self.state.lock();
            let local = state.index.get(key);
            if compare_file(incoming, local) != SyncStatus::NeedsUpdate {
                bail!("local index changed since negotiation; {key} is no longer outdated");
            }
            // Unindexed local edits would be silently overwritten
            let on_disk = match hash_file(&target) {
                Ok(hash) => Some(hash),
                Err(_) if !target.exists() => None,
                Err(e) => return Err(e),
            };
            if on_disk.as_ref() != local.and_then(|r| r.hash()) {
                bail!("{key} was modified locally and not indexed yet");
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(temp_path, &target)
                .with_context(|| format!("replace {}", target.display()))?;

            let record = FileRecord::accepted_from_remote(incoming, local, self.local_id, at);
            state.index.insert(key.to_string(), record);
            // Already hashed above, no need to rehash on the next scan
            match Observed::of(&target) {
                Ok(seen) => {
                    state.observed.insert(key.to_string(), seen);
                }
                Err(_) => {
                    state.observed.remove(key);
                }
            }
            state.version += 1;
            self.write_index(&state.index)?;
        }

        self.events.publish(Event::IndexChanged {
            paths: BTreeSet::from([key.to_string()]),
        });
        Ok(at)
    }

    /// Note that `peer` now holds the version `sent` of `key`. Ignored when
    /// the local record moved on in the meantime.
    pub fn finalize_outbound(
        &self,
        key: &str,
        sent: &FileRecord,
        peer: PeerId,
        at: Timestamp,
    ) -> Result<bool> {
        {
            let mut state = self.state.lock();
            let Some(record) = state.index.get_mut(key) else {
                return Ok(false);
            };
            if !record.same_version(sent) {
                return Ok(false);
            }
            let seen = record.sync_log.entry(peer).or_insert(at);
            *seen = (*seen).max(at);
            state.version += 1;
            self.write_index(&state.index)?;
        }

        self.events.publish(Event::IndexChanged {
            paths: BTreeSet::from([key.to_string()]),
        });
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn replace_index(&self, index: FileIndex) {
        let mut state = self.state.lock();
        state.index = index;
        state.observed.clear();
        state.version += 1;
    }
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove temp file");
        }
    }
}

/// Drop leftovers of an earlier run
fn purge_dir(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        if entry.file_type().is_ok_and(|t| t.is_file()) {
            remove_if_exists(&entry.path());
        }
    }
}
