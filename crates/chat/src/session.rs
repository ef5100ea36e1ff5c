use std::fmt;

use parley_storage::{ConversationId, ConversationStore, MessageRole};
use parley_transport::{
    CancellationToken, ChatRequest, ChatTransport, Endpoint, TransportError, TransportReader,
};

/// Engine-local session identifier, unique per engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// How a session ended. All three leave the conversation interactive again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Completed,
    Aborted,
    Errored(String),
}

impl Termination {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Errored(_) => "errored",
        }
    }
}

/// Lifecycle of one session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Loading,
    Streaming {
        chunks: usize,
    },
    Terminated(Termination),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    Open,
    Chunk,
    Complete,
    Abort,
    Fail { message: String },
}

/// Rejection reason for illegal session transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransitionRejection {
    AlreadyOpen,
    NotOpen,
    AlreadyTerminated(Termination),
}

pub type SessionTransitionResult = Result<SessionState, SessionTransitionRejection>;

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Loading | Self::Streaming { .. })
    }

    pub fn termination(&self) -> Option<&Termination> {
        match self {
            Self::Terminated(termination) => Some(termination),
            Self::Idle | Self::Loading | Self::Streaming { .. } => None,
        }
    }

    /// Applies one transition deterministically.
    ///
    /// Only `Idle` may open. `Loading` and `Streaming` accept chunks and exactly
    /// one terminal transition; a terminated session accepts nothing.
    pub fn apply(&self, transition: SessionTransition) -> SessionTransitionResult {
        match (self, transition) {
            (Self::Terminated(termination), _) => Err(
                SessionTransitionRejection::AlreadyTerminated(termination.clone()),
            ),
            (Self::Idle, SessionTransition::Open) => Ok(Self::Loading),
            (Self::Idle, _) => Err(SessionTransitionRejection::NotOpen),
            (_, SessionTransition::Open) => Err(SessionTransitionRejection::AlreadyOpen),
            (Self::Loading, SessionTransition::Chunk) => Ok(Self::Streaming { chunks: 1 }),
            (Self::Streaming { chunks }, SessionTransition::Chunk) => Ok(Self::Streaming {
                chunks: chunks + 1,
            }),
            (_, SessionTransition::Complete) => Ok(Self::Terminated(Termination::Completed)),
            (_, SessionTransition::Abort) => Ok(Self::Terminated(Termination::Aborted)),
            (_, SessionTransition::Fail { message }) => {
                Ok(Self::Terminated(Termination::Errored(message)))
            }
        }
    }
}

/// Final outcome of one session, returned by `SessionHandle::wait`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub thread_index: usize,
    pub termination: Termination,
    pub chunks_applied: usize,
    /// Index the next session on this conversation will write to.
    pub next_thread_index: usize,
}

/// One in-flight exchange bound to a single thread entry.
///
/// The session never owns conversation text. It pushes fragments into the
/// store at `thread_index` and stops appending as soon as its token fires.
pub(crate) struct StreamSession {
    id: SessionId,
    conversation_id: ConversationId,
    thread_index: usize,
    prompt: String,
    cancel: CancellationToken,
    state: SessionState,
    chunks_applied: usize,
}

impl StreamSession {
    pub(crate) fn open(
        id: SessionId,
        conversation_id: ConversationId,
        thread_index: usize,
        prompt: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            conversation_id,
            thread_index,
            prompt,
            cancel,
            state: SessionState::Loading,
            chunks_applied: 0,
        }
    }

    pub(crate) async fn run(
        mut self,
        store: &ConversationStore,
        transport: &dyn ChatTransport,
        request: ChatRequest,
        endpoint: Endpoint,
    ) -> SessionReport {
        tracing::debug!(
            session_id = %self.id,
            conversation_id = %self.conversation_id,
            thread_index = self.thread_index,
            transport = transport.name(),
            "stream session started"
        );

        let transition = match transport
            .open(&request, &endpoint, self.cancel.clone())
            .await
        {
            Ok(reader) => self.pump(store, reader).await,
            Err(error) => self.transition_for_error(&error),
        };

        self.finish(transition)
    }

    async fn pump(
        &mut self,
        store: &ConversationStore,
        mut reader: TransportReader,
    ) -> SessionTransition {
        loop {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => {
                    if self.cancel.is_cancelled() {
                        return SessionTransition::Abort;
                    }
                    if let Err(error) = store.append_chunk(
                        &self.conversation_id,
                        self.thread_index,
                        &chunk,
                        MessageRole::Assistant,
                        &self.prompt,
                    ) {
                        tracing::warn!(
                            session_id = %self.id,
                            conversation_id = %self.conversation_id,
                            error = %error,
                            "failed to apply stream chunk"
                        );
                        return SessionTransition::Fail {
                            message: error.to_string(),
                        };
                    }
                    self.chunks_applied += 1;
                    self.advance(SessionTransition::Chunk);
                }
                Ok(None) if self.cancel.is_cancelled() => return SessionTransition::Abort,
                Ok(None) => return SessionTransition::Complete,
                Err(error) => return self.transition_for_error(&error),
            }
        }
    }

    fn transition_for_error(&self, error: &TransportError) -> SessionTransition {
        if error.is_aborted() || self.cancel.is_cancelled() {
            tracing::info!(
                session_id = %self.id,
                conversation_id = %self.conversation_id,
                "stream stopped by user"
            );
            return SessionTransition::Abort;
        }

        tracing::warn!(
            session_id = %self.id,
            conversation_id = %self.conversation_id,
            error = %error,
            "error in reading stream"
        );
        SessionTransition::Fail {
            message: error.to_string(),
        }
    }

    fn advance(&mut self, transition: SessionTransition) {
        match self.state.apply(transition) {
            Ok(next) => self.state = next,
            Err(rejection) => tracing::debug!(
                session_id = %self.id,
                ?rejection,
                "ignored illegal session transition"
            ),
        }
    }

    fn finish(mut self, transition: SessionTransition) -> SessionReport {
        self.advance(transition);
        let termination = self
            .state
            .termination()
            .cloned()
            .unwrap_or_else(|| Termination::Errored("session ended without terminating".into()));

        tracing::info!(
            session_id = %self.id,
            conversation_id = %self.conversation_id,
            thread_index = self.thread_index,
            chunks = self.chunks_applied,
            termination = termination.label(),
            "stream session finished"
        );

        SessionReport {
            session_id: self.id,
            conversation_id: self.conversation_id,
            thread_index: self.thread_index,
            termination,
            chunks_applied: self.chunks_applied,
            next_thread_index: self.thread_index + 1,
        }
    }
}
