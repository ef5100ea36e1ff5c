#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_chat::{Caller, ChatEngine, EngineConfig, SessionPolicy};
use parley_storage::{ConversationId, ConversationStore, StoreEvent};
use parley_transport::{
    BoxFuture, CancellationToken, ChatRequest, ChatTransport, Endpoint, TransportError,
    TransportReader, TransportResult,
};
use tokio::sync::{broadcast, mpsc};

pub const CONVERSATION: &str = "chat-1";

/// What the next `open` call hands back.
pub enum Script {
    Body(Vec<TransportResult<Vec<u8>>>),
    Gated(mpsc::UnboundedReceiver<TransportResult<Vec<u8>>>),
    Refuse(TransportError),
}

impl Script {
    pub fn text(chunks: &[&str]) -> Self {
        Self::Body(
            chunks
                .iter()
                .map(|chunk| Ok(chunk.as_bytes().to_vec()))
                .collect(),
        )
    }

    pub fn bytes(chunks: &[&[u8]]) -> Self {
        Self::Body(chunks.iter().map(|chunk| Ok(chunk.to_vec())).collect())
    }
}

/// Test-side control over a gated body. Dropping it ends the body.
pub struct Gate {
    sender: mpsc::UnboundedSender<TransportResult<Vec<u8>>>,
}

impl Gate {
    pub fn send(&self, text: &str) {
        let _ = self.sender.send(Ok(text.as_bytes().to_vec()));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.sender.send(Err(TransportError::Source {
            stage: "scripted-body",
            message: message.to_string(),
        }));
    }
}

pub fn gated() -> (Gate, Script) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Gate { sender }, Script::Gated(receiver))
}

#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<(ChatRequest, Endpoint)>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn open_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<(ChatRequest, Endpoint)> {
        self.requests.lock().unwrap().clone()
    }
}

impl ChatTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open<'a>(
        &'a self,
        request: &'a ChatRequest,
        endpoint: &'a Endpoint,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, TransportResult<TransportReader>> {
        Box::pin(async move {
            self.requests
                .lock()
                .unwrap()
                .push((request.clone(), endpoint.clone()));
            let script = self.scripts.lock().unwrap().pop_front();

            match script {
                None => Ok(TransportReader::empty(cancel)),
                Some(Script::Body(items)) => Ok(TransportReader::from_stream(
                    futures::stream::iter(items),
                    cancel,
                )),
                Some(Script::Gated(receiver)) => Ok(TransportReader::from_stream(
                    futures::stream::unfold(receiver, |mut receiver| async move {
                        receiver.recv().await.map(|item| (item, receiver))
                    }),
                    cancel,
                )),
                Some(Script::Refuse(error)) => Err(error),
            }
        })
    }
}

pub struct Harness {
    pub engine: ChatEngine,
    pub store: Arc<ConversationStore>,
    pub transport: Arc<ScriptedTransport>,
    pub conversation_id: ConversationId,
}

impl Harness {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self::with_config(EngineConfig::default(), scripts)
    }

    pub fn with_policy(policy: SessionPolicy, scripts: Vec<Script>) -> Self {
        Self::with_config(EngineConfig::default().with_policy(policy), scripts)
    }

    pub fn with_config(config: EngineConfig, scripts: Vec<Script>) -> Self {
        Self::with_store(Arc::new(ConversationStore::new()), config, scripts)
    }

    pub fn with_store(
        store: Arc<ConversationStore>,
        config: EngineConfig,
        scripts: Vec<Script>,
    ) -> Self {
        let conversation_id = ConversationId::new(CONVERSATION);
        store.create_conversation(conversation_id.clone()).unwrap();
        let transport = Arc::new(ScriptedTransport::new(scripts));
        let engine = ChatEngine::new(
            Arc::clone(&store),
            Arc::clone(&transport) as Arc<dyn ChatTransport>,
            config,
        );

        Self {
            engine,
            store,
            transport,
            conversation_id,
        }
    }

    pub fn content(&self, index: usize) -> String {
        self.store
            .conversation(&self.conversation_id)
            .unwrap()
            .thread[index]
            .message
            .content
            .clone()
    }

    pub fn thread_len(&self) -> usize {
        self.store.thread_len(&self.conversation_id).unwrap()
    }
}

pub fn caller() -> Caller {
    Caller::new("user-42").unwrap()
}

/// Waits until `count` chunks have been appended anywhere in the store.
pub async fn wait_for_chunks(events: &mut broadcast::Receiver<StoreEvent>, count: usize) {
    let mut seen = 0;
    tokio::time::timeout(Duration::from_secs(5), async {
        while seen < count {
            if let StoreEvent::ChunkAppended { .. } = events.recv().await.unwrap() {
                seen += 1;
            }
        }
    })
    .await
    .expect("timed out waiting for appended chunks");
}

/// Waits until the transport has been opened `count` times.
pub async fn wait_for_opens(transport: &ScriptedTransport, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.open_count() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("timed out waiting for the transport to open");
}
