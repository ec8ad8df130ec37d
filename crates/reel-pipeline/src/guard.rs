//! Per-asset single-flight guard.
//!
//! A key is held from the moment an upload is admitted until its
//! [`InFlightToken`] is dropped, which happens once the job's outcome has
//! been persisted. The token also carries the job's cancellation handle so
//! an operator can stop a specific job by key.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reel_core::{AssetKey, JobId};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Running {
    job_id: JobId,
    cancel: CancellationToken,
}

/// Set of assets with a job in flight.
#[derive(Debug, Clone, Default)]
pub struct InFlightGuard {
    running: Arc<DashMap<AssetKey, Running>>,
}

impl InFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for `job_id`. Returns `None` if another job holds it.
    pub fn try_acquire(
        &self,
        key: &AssetKey,
        job_id: JobId,
        cancel: CancellationToken,
    ) -> Option<InFlightToken> {
        match self.running.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Running { job_id, cancel });
                Some(InFlightToken {
                    running: Arc::clone(&self.running),
                    key: key.clone(),
                    job_id,
                })
            }
        }
    }

    pub fn is_running(&self, key: &AssetKey) -> bool {
        self.running.contains_key(key)
    }

    /// Job currently holding `key`.
    pub fn job_for(&self, key: &AssetKey) -> Option<JobId> {
        self.running.get(key).map(|r| r.job_id)
    }

    /// Cancel the job holding `key`. Returns `false` if nothing is running.
    pub fn cancel(&self, key: &AssetKey) -> bool {
        match self.running.get(key) {
            Some(r) => {
                r.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct InFlightToken {
    running: Arc<DashMap<AssetKey, Running>>,
    key: AssetKey,
    job_id: JobId,
}

impl InFlightToken {
    pub fn key(&self) -> &AssetKey {
        &self.key
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        self.running
            .remove_if(&self.key, |_, r| r.job_id == self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_core::{EntityId, MediaKind};

    fn key(kind: MediaKind) -> AssetKey {
        AssetKey::new(EntityId::parse("clip").unwrap(), kind)
    }

    #[test]
    fn second_acquire_is_refused_until_drop() {
        let guard = InFlightGuard::new();
        let k = key(MediaKind::Video);

        let token = guard
            .try_acquire(&k, JobId::new(), CancellationToken::new())
            .unwrap();
        assert!(guard
            .try_acquire(&k, JobId::new(), CancellationToken::new())
            .is_none());
        assert_eq!(guard.job_for(&k), Some(token.job_id()));

        drop(token);
        assert!(!guard.is_running(&k));
        assert!(guard
            .try_acquire(&k, JobId::new(), CancellationToken::new())
            .is_some());
    }

    #[test]
    fn kinds_of_one_entity_are_separate() {
        let guard = InFlightGuard::new();
        let _video = guard
            .try_acquire(&key(MediaKind::Video), JobId::new(), CancellationToken::new())
            .unwrap();
        let _thumb = guard
            .try_acquire(&key(MediaKind::Thumbnail), JobId::new(), CancellationToken::new())
            .unwrap();
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn cancel_signals_the_holder() {
        let guard = InFlightGuard::new();
        let k = key(MediaKind::Video);
        let cancel = CancellationToken::new();
        let _token = guard.try_acquire(&k, JobId::new(), cancel.clone()).unwrap();

        assert!(guard.cancel(&k));
        assert!(cancel.is_cancelled());
        assert!(!guard.cancel(&key(MediaKind::Thumbnail)));
    }
}
