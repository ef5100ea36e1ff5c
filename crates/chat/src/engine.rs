use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parley_storage::{ConversationId, ConversationStore, MessageRole, ThreadEntry};
use parley_transport::{CancellationToken, ChatTransport};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{
    AuthRequiredSnafu, ConversationGoneSnafu, EmptyPromptSnafu, EngineResult,
    NothingToRegenerateSnafu, SessionActiveSnafu, SessionJoinSnafu, StorageSnafu,
};
use crate::params::{Caller, GenerationParams, build_exchange};
use crate::session::{SessionId, SessionReport, StreamSession};
use crate::status::{Status, StatusSignal};

/// What to do when a conversation already has a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    /// Refuse the new submission with `SessionActive`.
    #[default]
    Reject,
    /// Cancel the running session, wait for it to settle, then start.
    Supersede,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineConfig {
    pub policy: SessionPolicy,
    pub defaults: GenerationParams,
}

impl EngineConfig {
    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_defaults(mut self, defaults: GenerationParams) -> Self {
        self.defaults = defaults;
        self
    }
}

/// Caller-side handle on a spawned session.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: SessionId,
    conversation_id: ConversationId,
    thread_index: usize,
    cancel: CancellationToken,
    join: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> EngineResult<SessionReport> {
        self.join.await.context(SessionJoinSnafu {
            stage: "wait-session",
        })
    }
}

struct ActiveSession {
    session_id: SessionId,
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

/// Slot in the active-session registry, owned until the session is spawned.
struct Reservation {
    session_id: SessionId,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

struct EngineInner {
    store: Arc<ConversationStore>,
    transport: Arc<dyn ChatTransport>,
    config: EngineConfig,
    active: Mutex<HashMap<ConversationId, ActiveSession>>,
    statuses: Mutex<HashMap<ConversationId, StatusSignal>>,
    drafts: Mutex<HashMap<ConversationId, String>>,
    next_session_id: AtomicU64,
}

/// Entry point for UI commands: submit, stop, regenerate.
///
/// Cloning is cheap and every clone drives the same sessions.
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<EngineInner>,
}

impl ChatEngine {
    pub fn new(
        store: Arc<ConversationStore>,
        transport: Arc<dyn ChatTransport>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                transport,
                config,
                active: Mutex::new(HashMap::new()),
                statuses: Mutex::new(HashMap::new()),
                drafts: Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Direct store access. Thread edits during a live session belong on the
    /// engine's own `delete_entry`/`drop_last_pair`.
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Starts a session that streams the answer to `prompt` into a new entry.
    ///
    /// The entry is opened before the request goes out, so its index is fixed
    /// for the session's lifetime. Missing `caller` fails before any state is
    /// touched.
    pub async fn submit(
        &self,
        caller: Option<&Caller>,
        conversation_id: &ConversationId,
        prompt: &str,
        params: GenerationParams,
    ) -> EngineResult<SessionHandle> {
        let caller = caller.context(AuthRequiredSnafu { stage: "submit" })?;
        let prompt = prompt.trim();
        ensure!(!prompt.is_empty(), EmptyPromptSnafu { stage: "submit" });
        self.inner
            .store
            .thread_len(conversation_id)
            .context(StorageSnafu { stage: "submit" })?;

        let reservation = self
            .reserve(conversation_id, self.inner.config.policy, "submit")
            .await?;
        self.start(caller, conversation_id, prompt.to_string(), params, reservation)
    }

    /// Replaces the newest pair with a fresh answer to the same prompt.
    pub async fn regenerate(
        &self,
        caller: Option<&Caller>,
        conversation_id: &ConversationId,
        params: GenerationParams,
    ) -> EngineResult<SessionHandle> {
        let caller = caller.context(AuthRequiredSnafu {
            stage: "regenerate",
        })?;
        self.inner
            .store
            .thread_len(conversation_id)
            .context(StorageSnafu {
                stage: "regenerate",
            })?;

        let reservation = self
            .reserve(conversation_id, self.inner.config.policy, "regenerate")
            .await?;
        let dropped = match self.inner.store.drop_last_pair(conversation_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.inner.release(conversation_id, reservation);
                return NothingToRegenerateSnafu {
                    stage: "regenerate",
                    conversation_id: conversation_id.to_string(),
                }
                .fail();
            }
            Err(source) => {
                self.inner.release(conversation_id, reservation);
                return Err(source).context(StorageSnafu {
                    stage: "regenerate",
                });
            }
        };

        tracing::debug!(
            conversation_id = %conversation_id,
            prompt_len = dropped.input.len(),
            "regenerating last pair"
        );
        self.start(caller, conversation_id, dropped.input, params, reservation)
    }

    /// Removes entry `index` from the thread.
    ///
    /// Refused with `SessionActive` while a session streams into the
    /// conversation, whatever the policy: removal would shift the index the
    /// session appends to. Edits made straight through [`ChatEngine::store`]
    /// bypass this check.
    pub async fn delete_entry(
        &self,
        conversation_id: &ConversationId,
        index: usize,
    ) -> EngineResult<ThreadEntry> {
        let reservation = self
            .reserve(conversation_id, SessionPolicy::Reject, "delete-entry")
            .await?;
        let removed = self
            .inner
            .store
            .delete_entry(conversation_id, index)
            .context(StorageSnafu {
                stage: "delete-entry",
            });
        self.inner.release(conversation_id, reservation);
        removed
    }

    /// Removes the newest pair. Same live-session rule as [`ChatEngine::delete_entry`].
    pub async fn drop_last_pair(
        &self,
        conversation_id: &ConversationId,
    ) -> EngineResult<Option<ThreadEntry>> {
        let reservation = self
            .reserve(conversation_id, SessionPolicy::Reject, "drop-last-pair")
            .await?;
        let dropped = self
            .inner
            .store
            .drop_last_pair(conversation_id)
            .context(StorageSnafu {
                stage: "drop-last-pair",
            });
        self.inner.release(conversation_id, reservation);
        dropped
    }

    /// Requests cancellation of the conversation's live session, if any.
    pub fn stop(&self, conversation_id: &ConversationId) -> bool {
        let active = lock(&self.inner.active);
        match active.get(conversation_id) {
            Some(session) => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    session_id = %session.session_id,
                    "stop requested"
                );
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_session(&self, conversation_id: &ConversationId) -> Option<SessionId> {
        lock(&self.inner.active)
            .get(conversation_id)
            .map(|session| session.session_id)
    }

    pub fn is_streaming(&self, conversation_id: &ConversationId) -> bool {
        self.active_session(conversation_id).is_some()
    }

    pub fn status(&self, conversation_id: &ConversationId) -> Status {
        self.inner.status_signal(conversation_id).get()
    }

    pub fn watch_status(&self, conversation_id: &ConversationId) -> watch::Receiver<Status> {
        self.inner.status_signal(conversation_id).subscribe()
    }

    pub fn set_draft(&self, conversation_id: &ConversationId, text: impl Into<String>) {
        lock(&self.inner.drafts).insert(conversation_id.clone(), text.into());
    }

    pub fn draft(&self, conversation_id: &ConversationId) -> String {
        lock(&self.inner.drafts)
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Cancels every live session. Returns how many were signalled.
    pub fn shutdown(&self) -> usize {
        let active = lock(&self.inner.active);
        for session in active.values() {
            session.cancel.cancel();
        }
        if !active.is_empty() {
            tracing::info!(sessions = active.len(), "chat engine shutting down");
        }
        active.len()
    }

    async fn reserve(
        &self,
        conversation_id: &ConversationId,
        policy: SessionPolicy,
        stage: &'static str,
    ) -> EngineResult<Reservation> {
        let session_id = SessionId(self.inner.next_session_id.fetch_add(1, Ordering::Relaxed));

        loop {
            let (stale_id, mut finished) = {
                let mut active = lock(&self.inner.active);
                match active.get(conversation_id) {
                    None => {
                        let cancel = CancellationToken::new();
                        let (finished, receiver) = watch::channel(false);
                        active.insert(
                            conversation_id.clone(),
                            ActiveSession {
                                session_id,
                                cancel: cancel.clone(),
                                finished: receiver,
                            },
                        );
                        return Ok(Reservation {
                            session_id,
                            cancel,
                            finished,
                        });
                    }
                    Some(existing) => match policy {
                        SessionPolicy::Reject => {
                            return SessionActiveSnafu {
                                stage,
                                conversation_id: conversation_id.to_string(),
                                session_id: existing.session_id.to_string(),
                            }
                            .fail();
                        }
                        SessionPolicy::Supersede => {
                            tracing::debug!(
                                conversation_id = %conversation_id,
                                superseded = %existing.session_id,
                                session_id = %session_id,
                                "superseding active session"
                            );
                            existing.cancel.cancel();
                            (existing.session_id, existing.finished.clone())
                        }
                    },
                }
            };

            let settled = finished.wait_for(|done| *done).await.map(|_| ());
            if settled.is_err() {
                // Sender dropped without finishing: the session task died.
                self.inner.forget(conversation_id, stale_id);
            }
        }
    }

    fn start(
        &self,
        caller: &Caller,
        conversation_id: &ConversationId,
        prompt: String,
        params: GenerationParams,
        reservation: Reservation,
    ) -> EngineResult<SessionHandle> {
        let inner = &self.inner;
        let Some(conversation) = inner.store.conversation(conversation_id) else {
            inner.release(conversation_id, reservation);
            return ConversationGoneSnafu {
                stage: "start-session",
                conversation_id: conversation_id.to_string(),
            }
            .fail();
        };

        let status = inner.status_signal(conversation_id);
        status.set(Status::Loading);
        lock(&inner.drafts).remove(conversation_id);

        let thread_index = conversation.thread.len();
        if let Err(source) = inner.store.append_chunk(
            conversation_id,
            thread_index,
            "",
            MessageRole::Assistant,
            &prompt,
        ) {
            inner.settle(conversation_id, reservation.session_id, &status);
            reservation.finished.send_replace(true);
            return Err(source).context(StorageSnafu {
                stage: "open-entry",
            });
        }

        let params = params.or(&inner.config.defaults);
        let (request, endpoint) = build_exchange(&conversation, &prompt, &params, caller);

        let Reservation {
            session_id,
            cancel,
            finished,
        } = reservation;
        let session = StreamSession::open(
            session_id,
            conversation_id.clone(),
            thread_index,
            prompt,
            cancel.clone(),
        );

        let task_inner = Arc::clone(inner);
        let join = tokio::spawn(async move {
            let report = session
                .run(
                    &task_inner.store,
                    task_inner.transport.as_ref(),
                    request,
                    endpoint,
                )
                .await;
            task_inner.settle(&report.conversation_id, report.session_id, &status);
            finished.send_replace(true);
            report
        });

        Ok(SessionHandle {
            session_id,
            conversation_id: conversation_id.clone(),
            thread_index,
            cancel,
            join,
        })
    }
}

impl EngineInner {
    fn status_signal(&self, conversation_id: &ConversationId) -> StatusSignal {
        lock(&self.statuses)
            .entry(conversation_id.clone())
            .or_default()
            .clone()
    }

    fn release(&self, conversation_id: &ConversationId, reservation: Reservation) {
        self.forget(conversation_id, reservation.session_id);
        reservation.finished.send_replace(true);
    }

    /// Frees the session's slot and publishes `Success` under the registry lock.
    ///
    /// A reader that sees `Success` can immediately reserve the slot, and a
    /// newer session's `Loading` is never overwritten.
    fn settle(
        &self,
        conversation_id: &ConversationId,
        session_id: SessionId,
        status: &StatusSignal,
    ) {
        let mut active = lock(&self.active);
        let owned = active
            .get(conversation_id)
            .is_none_or(|session| session.session_id == session_id);
        if owned {
            active.remove(conversation_id);
            status.set(Status::Success);
        }
    }

    /// Removes the registry entry only if it still belongs to `session_id`.
    fn forget(&self, conversation_id: &ConversationId, session_id: SessionId) {
        let mut active = lock(&self.active);
        if active
            .get(conversation_id)
            .is_some_and(|session| session.session_id == session_id)
        {
            active.remove(conversation_id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
