use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::storage::{SessionRepository, SessionUpsert};

type Slot = Arc<tokio::sync::Mutex<u64>>;

/// Position of a write in submission order for one session. Later tickets win.
///
/// A ticket keeps its session's slot alive until it is applied, so the slot
/// still knows about newer writes when an older ticket finally lands.
pub struct WriteTicket {
    seq: u64,
    id: String,
    slot: Slot,
}

impl WriteTicket {
    pub fn session_id(&self) -> &str {
        &self.id
    }
}

/// Serializes session writes per session id.
///
/// Every upsert is a full-state overwrite, so two saves of the same session that
/// land out of order would lose the newer message. The writer applies writes
/// for one id one at a time and drops any write whose ticket is older than one
/// already applied for that id. Pin toggles take the same slot, and an upsert of
/// an existing row keeps the stored pin state.
pub struct SessionWriter {
    repo: Arc<dyn SessionRepository>,
    next_ticket: AtomicU64,
    applied: Mutex<HashMap<String, Slot>>,
}

impl SessionWriter {
    pub fn new(repo: Arc<dyn SessionRepository>) -> Self {
        Self { repo, next_ticket: AtomicU64::new(0), applied: Mutex::new(HashMap::new()) }
    }

    pub fn repository(&self) -> &Arc<dyn SessionRepository> {
        &self.repo
    }

    /// Takes the next ticket for `id`. Call this at the moment the state is captured.
    pub fn ticket(&self, id: &str) -> WriteTicket {
        let seq = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        WriteTicket { seq, id: id.to_string(), slot: self.slot(id) }
    }

    pub async fn submit(&self, draft: SessionUpsert) -> Option<String> {
        if draft.messages.is_empty() {
            return None;
        }
        let id = draft.existing_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let ticket = self.ticket(&id);
        self.apply(ticket, draft).await
    }

    /// Writes `draft` under the ticket's session id unless a later ticket already
    /// landed for it. Returns the session id either way.
    pub async fn apply(&self, ticket: WriteTicket, mut draft: SessionUpsert) -> Option<String> {
        let WriteTicket { seq, id, slot } = ticket;
        let saved = if draft.messages.is_empty() {
            None
        } else {
            let mut last = slot.lock().await;
            if *last > seq {
                debug!(session_id = %id, ticket = seq, latest = *last, "dropping stale session write");
                Some(id.clone())
            } else {
                *last = seq;
                if let Some(current) = self.repo.get_session(&id).await {
                    draft.is_pinned = current.is_pinned;
                }
                draft.existing_id = Some(id.clone());
                self.repo.upsert_session(draft).await
            }
        };
        self.release(&id, slot);
        saved
    }

    /// Flips the pin flag, ordered against in-flight upserts of the same session.
    pub async fn toggle_pin(&self, id: &str) {
        let slot = self.slot(id);
        {
            let _guard = slot.lock().await;
            self.repo.toggle_pin(id).await;
        }
        self.release(id, slot);
    }

    pub async fn delete(&self, ids: &HashSet<String>) {
        self.repo.delete_sessions(ids).await;
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            applied.remove(id);
        }
    }

    fn slot(&self, id: &str) -> Slot {
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        applied.entry(id.to_string()).or_default().clone()
    }

    /// Drops the slot for `id` once nothing else references it.
    fn release(&self, id: &str, slot: Slot) {
        drop(slot);
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        if applied.get(id).is_some_and(|s| Arc::strong_count(s) == 1) {
            applied.remove(id);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}
