use parley_storage::StorageError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("login required before `{stage}`"))]
    AuthRequired { stage: &'static str },
    #[snafu(display("prompt must not be blank"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display(
        "conversation '{conversation_id}' already has an active session ({session_id})"
    ))]
    SessionActive {
        stage: &'static str,
        conversation_id: String,
        session_id: String,
    },
    #[snafu(display("conversation '{conversation_id}' has nothing to regenerate"))]
    NothingToRegenerate {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("conversation '{conversation_id}' was deleted before the session started"))]
    ConversationGone {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("conversation store rejected `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("session task failed on `{stage}`: {source}"))]
    SessionJoin {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
}

impl EngineError {
    pub fn is_auth_required(&self) -> bool {
        matches!(self, Self::AuthRequired { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
