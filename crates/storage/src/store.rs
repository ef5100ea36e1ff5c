use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use snafu::{OptionExt, ensure};
use tokio::sync::broadcast;

use super::PersistHook;
use super::error::{
    ConversationExistsSnafu, ConversationNotFoundSnafu, EntryNotFoundSnafu, StorageResult,
    ThreadIndexGapSnafu,
};
use super::ids::ConversationId;
use super::types::{Conversation, MessageRole, StoreEvent, StoreSnapshot, ThreadEntry};

pub const STORE_EVENT_CAPACITY: usize = 1024;

struct ConversationSlot {
    id: ConversationId,
    conversation: Arc<Mutex<Conversation>>,
}

impl ConversationSlot {
    fn new(conversation: Conversation) -> Self {
        Self {
            id: conversation.id.clone(),
            conversation: Arc::new(Mutex::new(conversation)),
        }
    }
}

/// Owns every conversation and applies incremental updates to their threads.
///
/// The slot list sits behind one `RwLock`; each conversation has its own
/// `Mutex`, so appends for different conversations never wait on each other.
/// Every mutation is followed by a `persist` call on the configured hook.
/// Saves are serialized, and the hook runs synchronously on the calling thread.
pub struct ConversationStore {
    slots: RwLock<Vec<ConversationSlot>>,
    events: broadcast::Sender<StoreEvent>,
    persistence: Option<Arc<dyn PersistHook>>,
    persist_lock: Mutex<()>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        Self {
            slots: RwLock::new(Vec::new()),
            events,
            persistence: None,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn with_persistence(persistence: Arc<dyn PersistHook>) -> Self {
        Self {
            persistence: Some(persistence),
            ..Self::new()
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Replaces the in-memory state with the hook's saved snapshot.
    /// Returns the number of conversations loaded.
    pub fn rehydrate(&self) -> StorageResult<usize> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let Some(snapshot) = persistence.rehydrate()? else {
            return Ok(0);
        };

        let mut seen = HashSet::new();
        let mut slots = Vec::with_capacity(snapshot.conversations.len());
        for conversation in snapshot.conversations {
            if !seen.insert(conversation.id.clone()) {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    "skipping duplicate conversation in snapshot"
                );
                continue;
            }
            slots.push(ConversationSlot::new(conversation));
        }

        let conversation_count = slots.len();
        *self.write_slots() = slots;

        tracing::info!(conversation_count, "rehydrated conversation store");
        self.emit(StoreEvent::Rehydrated { conversation_count });
        Ok(conversation_count)
    }

    pub fn create_conversation(&self, id: ConversationId) -> StorageResult<Conversation> {
        let conversation = Conversation::new(id.clone());
        {
            let mut slots = self.write_slots();
            ensure!(
                !slots.iter().any(|slot| slot.id == id),
                ConversationExistsSnafu {
                    stage: "create-conversation",
                    id: id.to_string(),
                }
            );
            slots.push(ConversationSlot::new(conversation.clone()));
        }

        self.persist();
        self.emit(StoreEvent::ConversationCreated {
            conversation_id: id,
        });
        Ok(conversation)
    }

    pub fn delete_conversation(&self, id: &ConversationId) -> StorageResult<Conversation> {
        let removed = {
            let mut slots = self.write_slots();
            let position = slots
                .iter()
                .position(|slot| &slot.id == id)
                .context(ConversationNotFoundSnafu {
                    stage: "delete-conversation",
                    id: id.to_string(),
                })?;
            slots.remove(position)
        };

        let conversation = lock_conversation(&removed.conversation).clone();
        self.persist();
        self.emit(StoreEvent::ConversationDeleted {
            conversation_id: id.clone(),
        });
        Ok(conversation)
    }

    /// Appends `chunk` to entry `thread_index`.
    ///
    /// `thread_index == len` opens a new entry carrying `input` and `role`;
    /// `thread_index < len` concatenates onto the existing content. An index
    /// past the end would leave a hole and is rejected.
    pub fn append_chunk(
        &self,
        id: &ConversationId,
        thread_index: usize,
        chunk: &str,
        role: MessageRole,
        input: &str,
    ) -> StorageResult<()> {
        let slot = self.slot(id, "append-chunk")?;
        let opened = {
            let mut conversation = lock_conversation(&slot);
            let len = conversation.thread.len();
            ensure!(
                thread_index <= len,
                ThreadIndexGapSnafu {
                    stage: "append-chunk",
                    id: id.to_string(),
                    index: thread_index,
                    len,
                }
            );

            if thread_index == len {
                conversation
                    .thread
                    .push(ThreadEntry::new(input, role, chunk));
                true
            } else {
                conversation.thread[thread_index]
                    .message
                    .content
                    .push_str(chunk);
                false
            }
        };

        if !opened && chunk.is_empty() {
            return Ok(());
        }

        self.persist();
        if opened {
            self.emit(StoreEvent::EntryOpened {
                conversation_id: id.clone(),
                thread_index,
            });
        }
        if !chunk.is_empty() {
            self.emit(StoreEvent::ChunkAppended {
                conversation_id: id.clone(),
                thread_index,
                chunk: chunk.to_string(),
            });
        }
        Ok(())
    }

    /// Removes the newest pair, returning it. `None` when the thread is empty.
    pub fn drop_last_pair(&self, id: &ConversationId) -> StorageResult<Option<ThreadEntry>> {
        let slot = self.slot(id, "drop-last-pair")?;
        let (dropped, thread_index) = {
            let mut conversation = lock_conversation(&slot);
            let dropped = conversation.thread.pop();
            (dropped, conversation.thread.len())
        };

        if dropped.is_some() {
            self.persist();
            self.emit(StoreEvent::PairDropped {
                conversation_id: id.clone(),
                thread_index,
            });
        }
        Ok(dropped)
    }

    pub fn delete_entry(&self, id: &ConversationId, index: usize) -> StorageResult<ThreadEntry> {
        let slot = self.slot(id, "delete-entry")?;
        let removed = {
            let mut conversation = lock_conversation(&slot);
            let len = conversation.thread.len();
            ensure!(
                index < len,
                EntryNotFoundSnafu {
                    stage: "delete-entry",
                    id: id.to_string(),
                    index,
                    len,
                }
            );
            conversation.thread.remove(index)
        };

        self.persist();
        self.emit(StoreEvent::EntryDeleted {
            conversation_id: id.clone(),
            thread_index: index,
        });
        Ok(removed)
    }

    pub fn set_template(&self, id: &ConversationId, template: Option<String>) -> StorageResult<()> {
        let slot = self.slot(id, "set-template")?;
        lock_conversation(&slot).template = template.filter(|value| !value.trim().is_empty());

        self.persist();
        self.emit(StoreEvent::TemplateChanged {
            conversation_id: id.clone(),
        });
        Ok(())
    }

    pub fn list_conversations(&self) -> Vec<Conversation> {
        self.read_slots()
            .iter()
            .map(|slot| lock_conversation(&slot.conversation).clone())
            .collect()
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.read_slots()
            .iter()
            .find(|slot| &slot.id == id)
            .map(|slot| lock_conversation(&slot.conversation).clone())
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.read_slots().iter().any(|slot| &slot.id == id)
    }

    pub fn thread_len(&self, id: &ConversationId) -> StorageResult<usize> {
        let slot = self.slot(id, "thread-len")?;
        let len = lock_conversation(&slot).thread.len();
        Ok(len)
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            conversations: self.list_conversations(),
        }
    }

    fn slot(
        &self,
        id: &ConversationId,
        stage: &'static str,
    ) -> StorageResult<Arc<Mutex<Conversation>>> {
        self.read_slots()
            .iter()
            .find(|slot| &slot.id == id)
            .map(|slot| Arc::clone(&slot.conversation))
            .context(ConversationNotFoundSnafu {
                stage,
                id: id.to_string(),
            })
    }

    fn persist(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };

        // Snapshot and write under one lock so saves land in snapshot order.
        let _guard = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // A failed save must not interrupt streaming; the next mutation retries.
        if let Err(error) = persistence.persist(&self.snapshot()) {
            tracing::warn!(error = %error, "failed to persist conversation store");
        }
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine: the store is also read through snapshots.
        let _ = self.events.send(event);
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, Vec<ConversationSlot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, Vec<ConversationSlot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_conversation(conversation: &Mutex<Conversation>) -> MutexGuard<'_, Conversation> {
    conversation.lock().unwrap_or_else(PoisonError::into_inner)
}
