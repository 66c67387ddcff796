use crate::blockstore::BlockId;
use crate::error::{IntegrityViolation, Result};
use crate::utils::write_atomically;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Client id space. Zero is reserved so a zeroed header never passes as a
/// valid client.
pub type ClientId = u32;

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    integrity_violation_in_previous_run: bool,
    /// Highest block version we have ever seen, per (client, block).
    versions: HashMap<(ClientId, BlockId), u64>,
    /// Which client performed the last update we saw, per block.
    last_update_client_id: HashMap<BlockId, ClientId>,
    /// Blocks we know were legitimately deleted. A tombstoned block
    /// reappearing on load is a replay.
    tombstones: HashSet<BlockId>,
}

/// Persistent bookkeeping used to detect rollback, replay and deletion of
/// blocks. Lives in the local state directory, never in the base directory.
#[derive(Debug)]
pub struct KnownBlockVersions {
    state_file_path: PathBuf,
    state: State,
}

impl KnownBlockVersions {
    /// Loads the state file, or starts fresh if there is none yet.
    pub fn load(state_file_path: PathBuf) -> Result<Self> {
        let state = match fs::read(&state_file_path) {
            Ok(bytes) => bincode::deserialize(&bytes)?,
            Err(err) if err.kind() == ErrorKind::NotFound => State::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            state_file_path,
            state,
        })
    }

    pub fn save(&self) -> Result<()> {
        let bytes = bincode::serialize(&self.state)?;
        write_atomically(&self.state_file_path, &bytes)?;
        Ok(())
    }

    pub fn integrity_violation_in_previous_run(&self) -> bool {
        self.state.integrity_violation_in_previous_run
    }

    pub fn set_integrity_violation_in_previous_run(&mut self) {
        self.state.integrity_violation_in_previous_run = true;
    }

    /// Validates the (client, version) header read from a block against
    /// everything this client has seen before, then records it as the newest
    /// known state of the block.
    pub fn check_and_update(
        &mut self,
        block_id: BlockId,
        client_id: ClientId,
        version: u64,
    ) -> std::result::Result<(), IntegrityViolation> {
        if self.state.tombstones.contains(&block_id) {
            return Err(IntegrityViolation::DeletedBlockReappeared { block_id });
        }
        let last_seen = self
            .state
            .versions
            .get(&(client_id, block_id))
            .copied();
        match self.state.last_update_client_id.get(&block_id) {
            Some(&last_client) if last_client == client_id => {
                // Same client as the last update we saw: the version must
                // not decrease.
                if let Some(last_seen) = last_seen {
                    if version < last_seen {
                        return Err(IntegrityViolation::RollbackOfOwnWrites {
                            block_id,
                            expected: last_seen,
                            seen: version,
                        });
                    }
                }
            }
            Some(_) => {
                // The block switched back to a client we've seen before: it
                // must carry something strictly newer than what that client
                // had last time, otherwise it is an old state replayed.
                if let Some(last_seen) = last_seen {
                    if version <= last_seen {
                        return Err(IntegrityViolation::RollbackToOtherClient {
                            block_id,
                            client_id,
                            seen: version,
                            last_seen,
                        });
                    }
                }
            }
            None => {}
        }
        self.record_update(block_id, client_id, version);
        Ok(())
    }

    /// Records the observed state without validating it. Used after a
    /// violation was downgraded to a warning.
    pub fn record_update(&mut self, block_id: BlockId, client_id: ClientId, version: u64) {
        let slot = self.state.versions.entry((client_id, block_id)).or_insert(0);
        *slot = (*slot).max(version);
        self.state.last_update_client_id.insert(block_id, client_id);
        self.state.tombstones.remove(&block_id);
    }

    /// Next version number for a write by `client_id`, monotonic per block
    /// across the lifetime of this state.
    pub fn increment_version(&mut self, client_id: ClientId, block_id: BlockId) -> u64 {
        let slot = self.state.versions.entry((client_id, block_id)).or_insert(0);
        *slot += 1;
        let version = *slot;
        self.state.last_update_client_id.insert(block_id, client_id);
        self.state.tombstones.remove(&block_id);
        version
    }

    pub fn mark_block_as_deleted(&mut self, block_id: BlockId) {
        self.state.tombstones.insert(block_id);
    }

    /// All blocks we expect to find in the base store: seen at least once
    /// and not known to be deleted.
    pub fn existing_blocks(&self) -> Vec<BlockId> {
        self.state
            .last_update_client_id
            .keys()
            .filter(|id| !self.state.tombstones.contains(id))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions() -> (tempfile::TempDir, KnownBlockVersions) {
        let dir = tempfile::tempdir().unwrap();
        let versions = KnownBlockVersions::load(dir.path().join("integritystate")).unwrap();
        (dir, versions)
    }

    #[test]
    fn accepts_first_sighting() {
        let (_dir, mut v) = versions();
        v.check_and_update(BlockId::random(), 1, 5).unwrap();
    }

    #[test]
    fn accepts_same_and_newer_version_from_same_client() {
        let (_dir, mut v) = versions();
        let id = BlockId::random();
        v.check_and_update(id, 1, 5).unwrap();
        v.check_and_update(id, 1, 5).unwrap();
        v.check_and_update(id, 1, 6).unwrap();
    }

    #[test]
    fn detects_rollback_of_same_client() {
        let (_dir, mut v) = versions();
        let id = BlockId::random();
        v.check_and_update(id, 1, 5).unwrap();
        let err = v.check_and_update(id, 1, 4).unwrap_err();
        assert!(matches!(err, IntegrityViolation::RollbackOfOwnWrites { .. }));
    }

    #[test]
    fn detects_rollback_to_other_clients_old_state() {
        let (_dir, mut v) = versions();
        let id = BlockId::random();
        v.check_and_update(id, 1, 5).unwrap();
        v.check_and_update(id, 2, 1).unwrap();
        // Client 1's old version 5 replayed: not strictly newer than what we
        // saw from client 1 before.
        let err = v.check_and_update(id, 1, 5).unwrap_err();
        assert!(matches!(err, IntegrityViolation::RollbackToOtherClient { .. }));
        // A genuinely newer write from client 1 is fine.
        let (_dir2, mut v2) = versions();
        v2.check_and_update(id, 1, 5).unwrap();
        v2.check_and_update(id, 2, 1).unwrap();
        v2.check_and_update(id, 1, 6).unwrap();
    }

    #[test]
    fn detects_reappearing_deleted_block() {
        let (_dir, mut v) = versions();
        let id = BlockId::random();
        v.check_and_update(id, 1, 5).unwrap();
        v.mark_block_as_deleted(id);
        let err = v.check_and_update(id, 1, 6).unwrap_err();
        assert!(matches!(err, IntegrityViolation::DeletedBlockReappeared { .. }));
    }

    #[test]
    fn own_write_clears_tombstone() {
        let (_dir, mut v) = versions();
        let id = BlockId::random();
        v.check_and_update(id, 1, 5).unwrap();
        v.mark_block_as_deleted(id);
        let version = v.increment_version(1, id);
        assert_eq!(version, 6);
        v.check_and_update(id, 1, version).unwrap();
    }

    #[test]
    fn versions_are_monotonic() {
        let (_dir, mut v) = versions();
        let id = BlockId::random();
        assert_eq!(v.increment_version(1, id), 1);
        assert_eq!(v.increment_version(1, id), 2);
        v.check_and_update(id, 1, 7).unwrap();
        assert_eq!(v.increment_version(1, id), 8);
    }

    #[test]
    fn state_survives_reload() {
        let (dir, mut v) = versions();
        let id = BlockId::random();
        v.check_and_update(id, 1, 5).unwrap();
        v.set_integrity_violation_in_previous_run();
        v.save().unwrap();

        let reloaded = KnownBlockVersions::load(dir.path().join("integritystate")).unwrap();
        assert!(reloaded.integrity_violation_in_previous_run());
        assert_eq!(reloaded.existing_blocks(), vec![id]);
        let mut reloaded = reloaded;
        let err = reloaded.check_and_update(id, 1, 4).unwrap_err();
        assert!(matches!(err, IntegrityViolation::RollbackOfOwnWrites { .. }));
    }

    #[test]
    fn existing_blocks_excludes_tombstones() {
        let (_dir, mut v) = versions();
        let id_kept = BlockId::random();
        let id_deleted = BlockId::random();
        v.check_and_update(id_kept, 1, 1).unwrap();
        v.check_and_update(id_deleted, 1, 1).unwrap();
        v.mark_block_as_deleted(id_deleted);
        assert_eq!(v.existing_blocks(), vec![id_kept]);
    }
}
