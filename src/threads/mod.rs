//! Thread status state machine and metadata updates.
//!
//! Statuses: ACTIVE -> {ARCHIVED, LOCKED}, ARCHIVED -> {ACTIVE}, LOCKED is
//! terminal. Message additions and explicit status changes are distinct
//! operations, but both pass through this validator; a LOCKED thread rejects
//! both.
//!
//! Mutations are serialized per thread id through an async lock map —
//! concurrent `add_message` calls on one thread must not lose increments to
//! `message_count` or entries in `participant_ids`.

use crate::model::{Thread, ThreadStatus, ValidationError};
use crate::storage::{PersistenceError, ThreadRepository};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Above this many live locks the map is compacted, dropping entries nobody
/// holds.
const THREAD_LOCKS_CAP: usize = 1024;

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("thread `{id}` not found")]
    NotFound { id: String },
    #[error("thread `{id}` is locked")]
    Locked { id: String },
    #[error("invalid thread transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ThreadStatus,
        to: ThreadStatus,
    },
    #[error("thread already exists for parent message `{parent_message_id}`")]
    Duplicate { parent_message_id: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub struct ThreadStateMachine {
    repo: Arc<dyn ThreadRepository>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ThreadStateMachine {
    pub fn new(repo: Arc<dyn ThreadRepository>) -> Self {
        Self {
            repo,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, thread_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > THREAD_LOCKS_CAP {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(thread_id.to_string()).or_default().clone()
    }

    async fn load(&self, thread_id: &str) -> Result<Thread, ThreadError> {
        self.repo
            .find_by_id(thread_id)
            .await?
            .ok_or_else(|| ThreadError::NotFound {
                id: thread_id.to_string(),
            })
    }

    /// Create the one thread anchored to `parent_message_id`, status ACTIVE,
    /// zero messages.
    pub async fn create_thread(
        &self,
        parent_message_id: &str,
        chat_id: &str,
        initial_participants: BTreeSet<String>,
    ) -> Result<Thread, ThreadError> {
        let thread = Thread::new(parent_message_id, chat_id, initial_participants)?;
        if self
            .repo
            .find_by_parent_message_id(parent_message_id)
            .await?
            .is_some()
        {
            return Err(ThreadError::Duplicate {
                parent_message_id: parent_message_id.to_string(),
            });
        }
        match self.repo.create_thread(&thread).await {
            Ok(created) => Ok(created),
            // Lost the race against a concurrent creator; the unique
            // constraint is the arbiter.
            Err(PersistenceError::DuplicateThread { parent_message_id }) => {
                Err(ThreadError::Duplicate { parent_message_id })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Account one message: `message_count` +1, sender added to the
    /// participant set (set-idempotent), activity refreshed.
    pub async fn add_message(
        &self,
        thread_id: &str,
        sender_id: &str,
    ) -> Result<Thread, ThreadError> {
        let lock = self.lock_for(thread_id);
        let _guard = lock.lock().await;

        let mut thread = self.load(thread_id).await?;
        if thread.metadata.status == ThreadStatus::Locked {
            return Err(ThreadError::Locked {
                id: thread_id.to_string(),
            });
        }
        thread.record_message(sender_id);
        self.repo.update_thread(&thread).await?;
        Ok(thread)
    }

    /// Apply an explicit status change, validated against the transition
    /// table. Invalid transitions leave the stored state untouched.
    pub async fn transition(
        &self,
        thread_id: &str,
        next: ThreadStatus,
    ) -> Result<Thread, ThreadError> {
        let lock = self.lock_for(thread_id);
        let _guard = lock.lock().await;

        let mut thread = self.load(thread_id).await?;
        let from = thread.metadata.status;
        if !from.can_transition_to(next) {
            return Err(ThreadError::InvalidTransition { from, to: next });
        }
        thread.metadata.status = next;
        self.repo.update_thread(&thread).await?;
        Ok(thread)
    }

    /// Gate used by the send pipeline before any side effect: fails when the
    /// thread is unknown or locked.
    pub async fn ensure_accepts_messages(&self, thread_id: &str) -> Result<(), ThreadError> {
        let thread = self.load(thread_id).await?;
        if thread.metadata.status == ThreadStatus::Locked {
            return Err(ThreadError::Locked {
                id: thread_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn thread(&self, thread_id: &str) -> Result<Thread, ThreadError> {
        self.load(thread_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn machine() -> ThreadStateMachine {
        ThreadStateMachine::new(Arc::new(InMemoryStore::new()))
    }

    fn participants(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn create_then_duplicate_fails() {
        let machine = machine();
        machine
            .create_thread("p1", "c1", participants(&["u1"]))
            .await
            .unwrap();
        assert!(matches!(
            machine
                .create_thread("p1", "c1", participants(&["u2"]))
                .await,
            Err(ThreadError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn create_requires_participants() {
        let machine = machine();
        assert!(matches!(
            machine.create_thread("p1", "c1", BTreeSet::new()).await,
            Err(ThreadError::Validation(ValidationError::NoParticipants))
        ));
    }

    #[tokio::test]
    async fn three_messages_from_two_senders() {
        let machine = machine();
        let thread = machine
            .create_thread("p1", "c1", participants(&["u1"]))
            .await
            .unwrap();

        machine.add_message(&thread.id, "u1").await.unwrap();
        machine.add_message(&thread.id, "u2").await.unwrap();
        let updated = machine.add_message(&thread.id, "u1").await.unwrap();

        assert_eq!(updated.metadata.message_count, 3);
        assert_eq!(updated.metadata.participant_ids, participants(&["u1", "u2"]));
    }

    #[tokio::test]
    async fn locked_thread_rejects_additions_and_stays_unchanged() {
        let machine = machine();
        let thread = machine
            .create_thread("p1", "c1", participants(&["u1"]))
            .await
            .unwrap();
        machine
            .transition(&thread.id, ThreadStatus::Locked)
            .await
            .unwrap();

        assert!(matches!(
            machine.add_message(&thread.id, "u2").await,
            Err(ThreadError::Locked { .. })
        ));
        let current = machine.thread(&thread.id).await.unwrap();
        assert_eq!(current.metadata.message_count, 0);
        assert!(!current.metadata.participant_ids.contains("u2"));
    }

    #[tokio::test]
    async fn invalid_transitions_leave_status_unchanged() {
        use ThreadStatus::{Active, Archived, Locked};
        let machine = machine();
        let allowed = [(Active, Archived), (Active, Locked), (Archived, Active)];

        for from in [Active, Archived, Locked] {
            for to in [Active, Archived, Locked] {
                // Fresh thread forced into the `from` status.
                let parent = format!("p-{from:?}-{to:?}");
                let thread = machine
                    .create_thread(&parent, "c1", participants(&["u1"]))
                    .await
                    .unwrap();
                match from {
                    Active => {}
                    Archived => {
                        machine.transition(&thread.id, Archived).await.unwrap();
                    }
                    Locked => {
                        machine.transition(&thread.id, Locked).await.unwrap();
                    }
                }

                let result = machine.transition(&thread.id, to).await;
                let current = machine.thread(&thread.id).await.unwrap();
                if allowed.contains(&(from, to)) {
                    assert!(result.is_ok(), "{from:?} -> {to:?} should be allowed");
                    assert_eq!(current.metadata.status, to);
                } else {
                    assert!(
                        matches!(result, Err(ThreadError::InvalidTransition { .. })),
                        "{from:?} -> {to:?} should be rejected"
                    );
                    assert_eq!(current.metadata.status, from);
                }
            }
        }
    }

    #[tokio::test]
    async fn archived_reactivates_then_accepts_messages() {
        let machine = machine();
        let thread = machine
            .create_thread("p1", "c1", participants(&["u1"]))
            .await
            .unwrap();
        machine
            .transition(&thread.id, ThreadStatus::Archived)
            .await
            .unwrap();
        machine
            .transition(&thread.id, ThreadStatus::Active)
            .await
            .unwrap();
        let updated = machine.add_message(&thread.id, "u2").await.unwrap();
        assert_eq!(updated.metadata.message_count, 1);
    }

    #[tokio::test]
    async fn concurrent_additions_lose_no_increments() {
        let machine = Arc::new(machine());
        let thread = machine
            .create_thread("p1", "c1", participants(&["u1"]))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let machine = machine.clone();
            let thread_id = thread.id.clone();
            tasks.push(tokio::spawn(async move {
                machine
                    .add_message(&thread_id, &format!("u{}", i % 4))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let current = machine.thread(&thread.id).await.unwrap();
        assert_eq!(current.metadata.message_count, 20);
        // initial u1 plus senders u0..u3
        assert_eq!(current.metadata.participant_ids.len(), 4);
    }

    #[tokio::test]
    async fn unknown_thread_is_not_found() {
        let machine = machine();
        assert!(matches!(
            machine.add_message("ghost", "u1").await,
            Err(ThreadError::NotFound { .. })
        ));
        assert!(matches!(
            machine.ensure_accepts_messages("ghost").await,
            Err(ThreadError::NotFound { .. })
        ));
    }
}
