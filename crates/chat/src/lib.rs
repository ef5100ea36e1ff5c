//! Streaming chat core.
//!
//! [`ChatEngine`] turns UI commands (submit, stop, regenerate) into stream
//! sessions. Each session opens one thread entry in the
//! [`ConversationStore`](parley_storage::ConversationStore), appends decoded
//! fragments to it in arrival order, and flips the conversation's
//! [`StatusSignal`] back to a non-loading value however it ends.
#![deny(unsafe_code)]

mod engine;
mod error;
mod params;
mod session;
mod settings;
mod status;

pub use engine::{ChatEngine, EngineConfig, SessionHandle, SessionPolicy};
pub use error::{EngineError, EngineResult};
pub use params::{Caller, GenerationParams};
pub use session::{
    SessionId, SessionReport, SessionState, SessionTransition, SessionTransitionRejection,
    SessionTransitionResult, Termination,
};
pub use settings::{
    CONVERSATIONS_FILE_NAME, ClientSettings, ENV_PREFIX, SETTINGS_DIRECTORY_NAME,
    SETTINGS_FILE_NAME, SettingsError, SettingsStore,
};
pub use status::{Status, StatusSignal};
