//! Job watches.
//!
//! A watch follows one job document until it reaches a terminal state and
//! pushes observations into the controller's event channel. The controller owns
//! the resulting [`WatchHandle`] and revokes it when the job settles, when a
//! newer request supersedes it, or when the session ends.

mod firestore;

pub use firestore::{decode_document, FirestoreWatcher};

use crate::model::{Credential, WatchEvent};
use tokio::sync::mpsc::UnboundedSender;

pub type EventSink = UnboundedSender<WatchEvent>;

pub trait JobWatcher: Send + Sync {
    /// Start watching `job_id`. Every event the watch produces carries `generation`.
    fn watch(
        &self,
        job_id: &str,
        generation: u64,
        credential: &Credential,
        sink: EventSink,
    ) -> WatchHandle;
}

type Revoker = Box<dyn FnOnce() + Send>;

/// Revocable subscription to a single job.
///
/// Revocation is idempotent and takes effect immediately; dropping the handle revokes it.
pub struct WatchHandle {
    job_id: String,
    generation: u64,
    revoker: Option<Revoker>,
}

impl WatchHandle {
    pub fn new(job_id: impl Into<String>, generation: u64, revoker: impl FnOnce() + Send + 'static) -> Self {
        Self {
            job_id: job_id.into(),
            generation,
            revoker: Some(Box::new(revoker)),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_revoked(&self) -> bool {
        self.revoker.is_none()
    }

    /// Whether an event was produced by this handle.
    pub fn owns(&self, event: &WatchEvent) -> bool {
        !self.is_revoked() && event.generation == self.generation && event.job_id == self.job_id
    }

    pub fn revoke(&mut self) {
        if let Some(revoke) = self.revoker.take() {
            tracing::debug!(job_id = %self.job_id, generation = self.generation, "watch revoked");
            revoke();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.revoke();
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("job_id", &self.job_id)
            .field("generation", &self.generation)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Observation;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_handle(count: &Arc<AtomicUsize>) -> WatchHandle {
        let c = count.clone();
        WatchHandle::new("doc1", 3, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn revoke_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut h = counting_handle(&count);
        h.revoke();
        h.revoke();
        drop(h);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_revokes() {
        let count = Arc::new(AtomicUsize::new(0));
        drop(counting_handle(&count));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn revoked_handle_owns_nothing() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut h = counting_handle(&count);
        let ev = WatchEvent {
            generation: 3,
            job_id: "doc1".into(),
            observation: Observation::Unrecognized,
        };
        assert!(h.owns(&ev));
        assert!(!h.owns(&WatchEvent {
            generation: 2,
            ..ev.clone()
        }));
        h.revoke();
        assert!(!h.owns(&ev));
    }
}
