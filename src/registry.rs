//! In-flight conversation bookkeeping and concurrency cap (spec.md §4.2).
//! Grounded on the teacher's `container_registry.rs` — a `DashMap`-backed
//! registry tracking per-key state and counts — generalized from
//! `(repo, branch) -> ContainerEntry{session_count}` to
//! `ConversationId -> CancellationToken`, since this registry tracks
//! live attempts rather than live containers.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

use crate::models::ConversationId;

/// Process-wide structure tracking which conversations are currently
/// being driven, plus a hard cap on how many may run at once. All
/// operations are O(1) and atomic with respect to each other (spec.md
/// §5's shared-resource policy).
pub struct ExecutionRegistry {
    running: DashMap<ConversationId, CancellationToken>,
    current_count: AtomicUsize,
    max_concurrency: usize,
}

impl ExecutionRegistry {
    /// `max_concurrency` must be > 0; spec.md §4.2 notes it is "never <= 0".
    pub fn new(max_concurrency: usize) -> Self {
        assert!(max_concurrency > 0, "max_concurrency must be positive");
        Self {
            running: DashMap::new(),
            current_count: AtomicUsize::new(0),
            max_concurrency,
        }
    }

    pub fn can_admit(&self) -> bool {
        self.current_count.load(Ordering::SeqCst) < self.max_concurrency
    }

    /// If `id` is already present or the registry is at capacity, returns
    /// `false` without mutating anything. Otherwise inserts and returns
    /// `true`. The capacity check and the insert happen while holding the
    /// DashMap shard lock for `id`'s entry plus a fetch-add guarded by a
    /// re-check, so two concurrent `admit` calls for distinct ids cannot
    /// both slip past a cap of 1.
    pub fn admit(&self, id: ConversationId, cancel: CancellationToken) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.running.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                // Reserve a slot optimistically, then back out if we lost the race.
                let reserved = self
                    .current_count
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        if n < self.max_concurrency { Some(n + 1) } else { None }
                    });
                if reserved.is_err() {
                    return false;
                }
                vacant.insert(cancel);
                true
            }
        }
    }

    /// Idempotent: removing an absent id is a no-op.
    pub fn release(&self, id: ConversationId) {
        if self.running.remove(&id).is_some() {
            self.current_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Fires the cancel handle, then releases. Returns `false` if `id`
    /// was not registered.
    pub fn cancel(&self, id: ConversationId) -> bool {
        if let Some((_, token)) = self.running.remove(&id) {
            self.current_count.fetch_sub(1, Ordering::SeqCst);
            token.cancel();
            true
        } else {
            false
        }
    }

    pub fn is_running(&self, id: ConversationId) -> bool {
        self.running.contains_key(&id)
    }

    pub fn running_count(&self) -> usize {
        self.current_count.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_then_release_restores_count() {
        let reg = ExecutionRegistry::new(3);
        assert!(reg.admit(1, CancellationToken::new()));
        assert_eq!(reg.running_count(), 1);
        reg.release(1);
        assert_eq!(reg.running_count(), 0);
    }

    #[test]
    fn admit_rejects_duplicate_id() {
        let reg = ExecutionRegistry::new(3);
        assert!(reg.admit(1, CancellationToken::new()));
        assert!(!reg.admit(1, CancellationToken::new()));
        assert_eq!(reg.running_count(), 1);
    }

    #[test]
    fn admit_rejects_over_capacity() {
        let reg = ExecutionRegistry::new(2);
        assert!(reg.admit(1, CancellationToken::new()));
        assert!(reg.admit(2, CancellationToken::new()));
        assert!(!reg.admit(3, CancellationToken::new()));
        assert_eq!(reg.running_count(), 2);
    }

    #[test]
    fn release_is_idempotent() {
        let reg = ExecutionRegistry::new(2);
        reg.release(42);
        assert_eq!(reg.running_count(), 0);
        reg.admit(1, CancellationToken::new());
        reg.release(1);
        reg.release(1);
        assert_eq!(reg.running_count(), 0);
    }

    #[test]
    fn cancel_fires_token_and_releases() {
        let reg = ExecutionRegistry::new(2);
        let token = CancellationToken::new();
        reg.admit(1, token.clone());
        assert!(reg.cancel(1));
        assert!(token.is_cancelled());
        assert!(!reg.is_running(1));
        assert_eq!(reg.running_count(), 0);
    }

    #[test]
    fn cancel_on_unregistered_id_returns_false() {
        let reg = ExecutionRegistry::new(2);
        assert!(!reg.cancel(999));
    }

    #[test]
    fn can_admit_reflects_capacity() {
        let reg = ExecutionRegistry::new(1);
        assert!(reg.can_admit());
        reg.admit(1, CancellationToken::new());
        assert!(!reg.can_admit());
    }

    #[test]
    #[should_panic(expected = "max_concurrency must be positive")]
    fn zero_concurrency_panics() {
        ExecutionRegistry::new(0);
    }
}
