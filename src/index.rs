//! File index data model and the conflict-aware diff
//!
//! Every record carries a sync log mapping peer ids to the newest version
//! of the file that peer is known to hold. A record written locally by peer
//! P at time T always has `sync_log[P] == T == last_update`; comparing
//! those self-entries across two records is what decides causality.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::hash::Digest;
use crate::identity::PeerId;

/// Whole seconds since the Unix epoch
pub type Timestamp = i64;

pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    Active { hash: Digest },
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub last_update: Timestamp,
    pub updater_id: PeerId,
    pub sync_log: BTreeMap<PeerId, Timestamp>,
    pub state: RecordState,
}

impl FileRecord {
    /// First version of a file seen by `peer`
    pub fn new_local(peer: PeerId, hash: Digest, at: Timestamp) -> Self {
        Self {
            last_update: at,
            updater_id: peer,
            sync_log: BTreeMap::from([(peer, at)]),
            state: RecordState::Active { hash },
        }
    }

    /// Advance the record as a new local write by `peer`
    pub fn stamp(&mut self, peer: PeerId, at: Timestamp, state: RecordState) {
        self.last_update = at;
        self.updater_id = peer;
        self.sync_log.insert(peer, at);
        self.state = state;
    }

    /// Timestamp for the next local write by `peer`: `now`, but strictly
    /// later than any version of this record `peer` already announced, so
    /// peers holding the old one never mistake it for the new one
    pub fn next_stamp(&self, peer: PeerId, now: Timestamp) -> Timestamp {
        let announced = self
            .sync_log
            .get(&peer)
            .copied()
            .unwrap_or(Timestamp::MIN)
            .max(self.last_update);
        now.max(announced.saturating_add(1))
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.state, RecordState::Deleted)
    }

    pub fn hash(&self) -> Option<&Digest> {
        match &self.state {
            RecordState::Active { hash } => Some(hash),
            RecordState::Deleted => None,
        }
    }

    /// Whether this record's sync log already covers `other`'s version
    pub fn has_observed(&self, other: &FileRecord) -> bool {
        self.sync_log
            .get(&other.updater_id)
            .is_some_and(|&seen| seen >= other.last_update)
    }

    /// Same content version, ignoring what the sync logs know about others
    pub fn same_version(&self, other: &FileRecord) -> bool {
        self.last_update == other.last_update
            && self.updater_id == other.updater_id
            && self.state == other.state
    }

    /// Record committed by `me` after pulling `incoming` from a peer.
    ///
    /// Content and version stay the sender's; the sync log is the union of
    /// both logs (newest entry wins) with `me` stamped at `at`.
    pub fn accepted_from_remote(
        incoming: &FileRecord,
        local: Option<&FileRecord>,
        me: PeerId,
        at: Timestamp,
    ) -> FileRecord {
        let mut record = incoming.clone();
        if let Some(local) = local {
            for (&peer, &seen) in &local.sync_log {
                let entry = record.sync_log.entry(peer).or_insert(seen);
                *entry = (*entry).max(seen);
            }
        }
        record.sync_log.insert(me, at);
        record
    }
}

/// Relative path -> record
pub type FileIndex = BTreeMap<String, FileRecord>;

/// Merge a changed-record subset into a cached index
pub fn merge_delta(index: &mut FileIndex, delta: FileIndex) {
    index.extend(delta);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    NotModified,
    NeedsUpdate,
    Conflict,
}

/// Decide whether `local` has to be pushed to the peer holding `remote`.
///
/// Pulling is never decided here; the peer runs the same comparison from
/// its side.
pub fn compare_file(local: &FileRecord, remote: Option<&FileRecord>) -> SyncStatus {
    let Some(remote) = remote else {
        return if local.is_deleted() {
            SyncStatus::NotModified
        } else {
            SyncStatus::NeedsUpdate
        };
    };

    if remote.has_observed(local) {
        // Remote holds this version or one derived from it
        SyncStatus::NotModified
    } else if local.has_observed(remote) {
        SyncStatus::NeedsUpdate
    } else {
        SyncStatus::Conflict
    }
}

/// Files the local side must act on for one peer.
///
/// `deletes` is never populated: deletion propagation is not defined yet,
/// the slot exists so callers do not change when it is. Until then a
/// locally deleted file is never offered to a peer that still has it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDiff {
    pub updates: BTreeSet<String>,
    pub deletes: BTreeSet<String>,
    pub conflicts: BTreeSet<String>,
}

impl IndexDiff {
    pub fn diff(local: &FileIndex, remote: &FileIndex) -> Self {
        let mut diff = Self::default();
        for (file, record) in local {
            match compare_file(record, remote.get(file)) {
                SyncStatus::NeedsUpdate if record.is_deleted() => {}
                SyncStatus::NeedsUpdate => {
                    diff.updates.insert(file.clone());
                }
                SyncStatus::Conflict => {
                    diff.conflicts.insert(file.clone());
                }
                SyncStatus::NotModified => {}
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.deletes.is_empty() && self.conflicts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: PeerId = PeerId::from_u128(0xA);
    const B: PeerId = PeerId::from_u128(0xB);
    const C: PeerId = PeerId::from_u128(0xC);

    fn record(updater: PeerId, last_update: Timestamp, log: &[(PeerId, Timestamp)]) -> FileRecord {
        FileRecord {
            last_update,
            updater_id: updater,
            sync_log: log.iter().copied().collect(),
            state: RecordState::Active {
                hash: Digest::of(format!("{updater}{last_update}").as_bytes()),
            },
        }
    }

    fn index(entries: &[(&str, FileRecord)]) -> FileIndex {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_file() {
        let a = index(&[("dir/file1", record(A, 10, &[(A, 10)]))]);
        let b = FileIndex::new();

        let ab = IndexDiff::diff(&a, &b);
        assert_eq!(ab.updates, set(&["dir/file1"]));
        assert!(ab.deletes.is_empty() && ab.conflicts.is_empty());

        assert!(IndexDiff::diff(&b, &a).is_empty());
    }

    #[test]
    fn test_propagated_update() {
        let a = index(&[("f", record(A, 1, &[(A, 1)]))]);
        let b = index(&[("f", record(B, 10, &[(A, 5), (B, 10)]))]);

        assert!(IndexDiff::diff(&a, &b).is_empty());

        let ba = IndexDiff::diff(&b, &a);
        assert_eq!(ba.updates, set(&["f"]));
        assert!(ba.conflicts.is_empty());
    }

    #[test]
    fn test_conflict() {
        let a = index(&[("f", record(A, 5, &[(A, 5)]))]);
        let b = index(&[("f", record(B, 6, &[(B, 6)]))]);

        assert_eq!(IndexDiff::diff(&a, &b).conflicts, set(&["f"]));
        assert_eq!(IndexDiff::diff(&b, &a).conflicts, set(&["f"]));
        assert!(IndexDiff::diff(&a, &b).updates.is_empty());
    }

    #[test]
    fn test_missing_remote() {
        let live = record(A, 3, &[(A, 3)]);
        assert_eq!(compare_file(&live, None), SyncStatus::NeedsUpdate);

        let mut gone = live.clone();
        gone.stamp(A, 4, RecordState::Deleted);
        assert_eq!(compare_file(&gone, None), SyncStatus::NotModified);
    }

    #[test]
    fn test_identical_records_not_modified() {
        let r = record(A, 7, &[(A, 7), (B, 7)]);
        assert_eq!(compare_file(&r, Some(&r)), SyncStatus::NotModified);
    }

    #[test]
    fn test_never_both_need_update() {
        let cases = [
            (record(A, 1, &[(A, 1)]), record(B, 10, &[(A, 5), (B, 10)])),
            (record(A, 5, &[(A, 5)]), record(B, 6, &[(B, 6)])),
            (record(A, 9, &[(A, 9), (B, 2)]), record(B, 2, &[(B, 2)])),
            (record(C, 4, &[(C, 4), (A, 4)]), record(C, 4, &[(C, 4), (B, 6)])),
        ];
        for (x, y) in &cases {
            let xy = compare_file(x, Some(y));
            let yx = compare_file(y, Some(x));
            assert!(
                !(xy == SyncStatus::NeedsUpdate && yx == SyncStatus::NeedsUpdate),
                "{x:?} vs {y:?}"
            );
        }
        // Dominating log: exactly one direction pushes
        let (x, y) = &cases[2];
        assert_eq!(compare_file(x, Some(y)), SyncStatus::NeedsUpdate);
        assert_eq!(compare_file(y, Some(x)), SyncStatus::NotModified);
    }

    #[test]
    fn test_stamp_keeps_self_entry_invariant() {
        let mut r = FileRecord::new_local(A, Digest::of(b"v1"), 100);
        assert_eq!(r.sync_log[&A], r.last_update);

        r.stamp(B, 150, RecordState::Active { hash: Digest::of(b"v2") });
        assert_eq!(r.updater_id, B);
        assert_eq!(r.sync_log[&B], 150);
        assert_eq!(r.last_update, 150);
        assert_eq!(r.sync_log[&A], 100);
    }

    #[test]
    fn test_accepted_from_remote_merges_logs() {
        let incoming = record(A, 1234, &[(A, 1234), (C, 1200), (B, 1000)]);
        let local = record(B, 900, &[(B, 900), (C, 1300)]);

        let merged = FileRecord::accepted_from_remote(&incoming, Some(&local), B, 1250);
        assert_eq!(merged.last_update, 1234);
        assert_eq!(merged.updater_id, A);
        assert_eq!(merged.state, incoming.state);
        assert_eq!(
            merged.sync_log,
            BTreeMap::from([(A, 1234), (B, 1250), (C, 1300)])
        );

        // Both sides now agree nothing needs to move
        assert_eq!(compare_file(&incoming, Some(&merged)), SyncStatus::NotModified);
        assert_eq!(compare_file(&merged, Some(&incoming)), SyncStatus::NotModified);
    }

    #[test]
    fn test_local_deletion_is_not_an_update() {
        let mut gone = record(A, 10, &[(A, 10)]);
        gone.stamp(A, 20, RecordState::Deleted);
        let held = record(A, 10, &[(A, 10), (B, 11)]);

        // Newer than what the peer holds, yet nothing is sent for it
        assert_eq!(compare_file(&gone, Some(&held)), SyncStatus::NeedsUpdate);
        let diff = IndexDiff::diff(&index(&[("f", gone)]), &index(&[("f", held)]));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_next_stamp_is_strictly_newer() {
        let r = record(A, 50, &[(A, 50), (B, 70)]);
        assert_eq!(r.next_stamp(A, 100), 100);
        assert_eq!(r.next_stamp(A, 50), 51);
        assert_eq!(r.next_stamp(A, 10), 51);
        // Our own entry may run ahead of last_update after pulling from B
        let pulled = record(B, 70, &[(A, 80), (B, 70)]);
        assert_eq!(pulled.next_stamp(A, 75), 81);
    }

    #[test]
    fn test_merge_delta_replaces_records() {
        let mut cached = index(&[("a", record(A, 1, &[(A, 1)])), ("b", record(A, 1, &[(A, 1)]))]);
        let delta = index(&[("b", record(B, 5, &[(A, 1), (B, 5)])), ("c", record(B, 5, &[(B, 5)]))]);
        merge_delta(&mut cached, delta);

        assert_eq!(cached.len(), 3);
        assert_eq!(cached["b"].updater_id, B);
        assert_eq!(cached["a"].updater_id, A);
    }
}
