pub mod error;
pub mod ids;
pub mod persist;
pub mod store;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::ConversationId;
pub use persist::{JsonFilePersistence, MemoryPersistence};
pub use store::{ConversationStore, STORE_EVENT_CAPACITY};
pub use types::{
    Conversation, MessageRole, StoreEvent, StoreSnapshot, ThreadEntry, ThreadMessage,
};

/// Save/load contract for an external key-value persistence collaborator.
pub trait PersistHook: Send + Sync {
    fn persist(&self, snapshot: &StoreSnapshot) -> StorageResult<()>;
    fn rehydrate(&self) -> StorageResult<Option<StoreSnapshot>>;
}
