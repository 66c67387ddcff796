//! Integrity layer. Wraps every block in a `(client id, block version)`
//! header and keeps a sidecar record of the newest state this client has
//! seen, so that rolling the base directory back, replaying old blocks or
//! deleting blocks is detected instead of silently accepted.

mod known_block_versions;

pub use known_block_versions::{ClientId, KnownBlockVersions};

use super::{BlockId, BlockStore, RemoveResult, TryCreateResult};
use crate::error::{Error, IntegrityViolation, Result};
use log::{error, warn};
use std::collections::HashSet;
use std::sync::Mutex;

const FORMAT_VERSION: u16 = 0;
const HEADER_SIZE: usize = 2 + 4 + 8;

#[derive(Debug, Clone, Copy)]
pub struct IntegrityConfig {
    /// Downgrade all violations to warnings and keep serving data.
    pub allow_integrity_violations: bool,
    /// The filesystem is bound to a single client, so a block disappearing
    /// from the base store is an attack, not another client's cleanup.
    pub missing_block_is_integrity_violation: bool,
}

pub struct IntegrityBlockStore<B> {
    base: B,
    my_client_id: ClientId,
    config: IntegrityConfig,
    known_block_versions: Mutex<KnownBlockVersions>,
}

impl<B: BlockStore> IntegrityBlockStore<B> {
    /// Fails with [`IntegrityViolation::PreviousRun`] if a previous run
    /// already detected tampering and violations are not explicitly allowed.
    pub fn new(
        base: B,
        known_block_versions: KnownBlockVersions,
        my_client_id: ClientId,
        config: IntegrityConfig,
    ) -> Result<Self> {
        assert_ne!(0, my_client_id, "client id 0 is reserved");
        if known_block_versions.integrity_violation_in_previous_run() {
            if config.allow_integrity_violations {
                warn!("an integrity violation was detected on a previous run; continuing because integrity violations are explicitly allowed");
            } else {
                return Err(IntegrityViolation::PreviousRun.into());
            }
        }
        Ok(Self {
            base,
            my_client_id,
            config,
            known_block_versions: Mutex::new(known_block_versions),
        })
    }

    pub fn my_client_id(&self) -> ClientId {
        self.my_client_id
    }

    /// Mount-time scan: every block this client has seen (and not deleted)
    /// must still be present in the base store.
    pub fn check_for_missing_blocks(&self) -> Result<()> {
        let present: HashSet<BlockId> = self.base.all_block_ids()?.into_iter().collect();
        let expected = self.known_block_versions.lock().unwrap().existing_blocks();
        for block_id in expected {
            if !present.contains(&block_id) {
                self.handle_violation(IntegrityViolation::MissingBlock { block_id })?;
            }
        }
        Ok(())
    }

    /// Either propagates the violation (poisoning the local state so the
    /// next run refuses to mount) or downgrades it to a warning.
    fn handle_violation(&self, violation: IntegrityViolation) -> Result<()> {
        if self.config.allow_integrity_violations {
            warn!("integrity violation (explicitly allowed): {violation}");
            return Ok(());
        }
        error!("integrity violation: {violation}");
        {
            let mut versions = self.known_block_versions.lock().unwrap();
            versions.set_integrity_violation_in_previous_run();
            if let Err(save_err) = versions.save() {
                error!("failed to persist integrity state after violation: {save_err}");
            }
        }
        Err(violation.into())
    }

    fn serialize(&self, version: u64, data: &[u8]) -> Vec<u8> {
        let mut stored = Vec::with_capacity(HEADER_SIZE + data.len());
        stored.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        stored.extend_from_slice(&self.my_client_id.to_le_bytes());
        stored.extend_from_slice(&version.to_le_bytes());
        stored.extend_from_slice(data);
        stored
    }

    fn parse_header(id: &BlockId, stored: &[u8]) -> Result<(ClientId, u64, &[u8])> {
        if stored.len() < HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "block {id} is too short for the integrity header"
            )));
        }
        let format_version = u16::from_le_bytes([stored[0], stored[1]]);
        if format_version != FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "block {id} has unsupported integrity format version {format_version}"
            )));
        }
        let client_id = u32::from_le_bytes(stored[2..6].try_into().unwrap());
        let version = u64::from_le_bytes(stored[6..14].try_into().unwrap());
        Ok((client_id, version, &stored[HEADER_SIZE..]))
    }
}

impl<B: BlockStore> BlockStore for IntegrityBlockStore<B> {
    fn try_create(&self, id: &BlockId, data: &[u8]) -> Result<TryCreateResult> {
        let version = self
            .known_block_versions
            .lock()
            .unwrap()
            .increment_version(self.my_client_id, *id);
        self.base.try_create(id, &self.serialize(version, data))
    }

    fn load(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        let stored = match self.base.load(id)? {
            Some(stored) => stored,
            None => {
                if self.config.missing_block_is_integrity_violation {
                    let known = {
                        let versions = self.known_block_versions.lock().unwrap();
                        versions.existing_blocks().contains(id)
                    };
                    if known {
                        self.handle_violation(IntegrityViolation::MissingBlock {
                            block_id: *id,
                        })?;
                    }
                }
                return Ok(None);
            }
        };
        let (client_id, version, payload) = Self::parse_header(id, &stored)?;
        let check = self
            .known_block_versions
            .lock()
            .unwrap()
            .check_and_update(*id, client_id, version);
        if let Err(violation) = check {
            self.handle_violation(violation)?;
            // Violation was allowed; trust what we see from now on.
            self.known_block_versions
                .lock()
                .unwrap()
                .record_update(*id, client_id, version);
        }
        Ok(Some(payload.to_vec()))
    }

    fn store(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        let version = self
            .known_block_versions
            .lock()
            .unwrap()
            .increment_version(self.my_client_id, *id);
        self.base.store(id, &self.serialize(version, data))
    }

    fn remove(&self, id: &BlockId) -> Result<RemoveResult> {
        let result = self.base.remove(id)?;
        let mut versions = self.known_block_versions.lock().unwrap();
        versions.mark_block_as_deleted(*id);
        if let Err(err) = versions.save() {
            error!("failed to persist integrity state after removing {id}: {err}");
        }
        Ok(result)
    }

    fn exists(&self, id: &BlockId) -> Result<bool> {
        self.base.exists(id)
    }

    fn num_blocks(&self) -> Result<u64> {
        self.base.num_blocks()
    }

    fn estimate_num_free_bytes(&self) -> Result<u64> {
        self.base.estimate_num_free_bytes()
    }

    fn block_size_from_physical_block_size(&self, physical: u64) -> Result<u64> {
        let below = self.base.block_size_from_physical_block_size(physical)?;
        below.checked_sub(HEADER_SIZE as u64).ok_or_else(|| {
            Error::Corruption(format!("physical block size {physical} too small"))
        })
    }

    fn all_block_ids(&self) -> Result<Vec<BlockId>> {
        self.base.all_block_ids()
    }

    fn flush(&self) -> Result<()> {
        self.known_block_versions.lock().unwrap().save()?;
        self.base.flush()
    }
}

impl<B> Drop for IntegrityBlockStore<B> {
    fn drop(&mut self) {
        if let Err(err) = self.known_block_versions.lock().unwrap().save() {
            error!("failed to persist integrity state on shutdown: {err}");
        }
    }
}
