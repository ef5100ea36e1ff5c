use std::process::ExitCode;
use std::sync::Arc;

use parley_chat::{
    Caller, ChatEngine, EngineError, GenerationParams, SessionHandle, SessionReport,
    SettingsStore, Termination,
};
use parley_storage::{
    ConversationId, ConversationStore, JsonFilePersistence, StorageError, StoreEvent,
};
use parley_transport::{HttpTransport, TransportError};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const USER_ENV: &str = "PARLEY_USER";

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to build http transport on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("conversation store failed on `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("terminal i/o failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

type CliResult<T> = Result<T, CliError>;

enum Command {
    Quit,
    New,
    Regenerate,
    Template(Option<String>),
    Prompt(String),
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let command = match line {
            "/quit" | "/exit" => Self::Quit,
            "/new" => Self::New,
            "/regen" => Self::Regenerate,
            "/template" => Self::Template(None),
            _ => match line.strip_prefix("/template ") {
                Some(template) => Self::Template(Some(template.trim().to_string())),
                None => Self::Prompt(line.to_string()),
            },
        };
        Some(command)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "parley exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> CliResult<()> {
    let settings = SettingsStore::load().settings();
    let store_path = settings.resolved_store_path();
    let store = Arc::new(ConversationStore::with_persistence(Arc::new(
        JsonFilePersistence::new(&store_path),
    )));
    match store.rehydrate() {
        Ok(count) => tracing::info!(path = %store_path.display(), count, "loaded conversations"),
        Err(error) => tracing::warn!(
            path = %store_path.display(),
            error = %error,
            "could not load conversations, starting empty"
        ),
    }

    let transport = HttpTransport::new(settings.transport_config()).context(TransportSnafu {
        stage: "build-transport",
    })?;
    let engine = ChatEngine::new(Arc::clone(&store), Arc::new(transport), settings.engine_config());
    let caller = std::env::var(USER_ENV).ok().and_then(Caller::new);

    let mut conversation_id = open_conversation(&store, std::env::args().nth(1))?;
    let mut stdout = tokio::io::stdout();
    say(&mut stdout, &format!("conversation {conversation_id}\n")).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context(TerminalSnafu {
        stage: "read-prompt",
    })? {
        let Some(command) = Command::parse(&line) else {
            continue;
        };

        let events = store.subscribe();
        let started = match command {
            Command::Quit => break,
            Command::New => {
                conversation_id = store
                    .create_conversation(ConversationId::generate())
                    .context(StoreSnafu {
                        stage: "new-conversation",
                    })?
                    .id;
                say(&mut stdout, &format!("conversation {conversation_id}\n")).await?;
                continue;
            }
            Command::Template(template) => {
                let cleared = template.is_none();
                store
                    .set_template(&conversation_id, template)
                    .context(StoreSnafu {
                        stage: "set-template",
                    })?;
                let notice = if cleared { "template cleared\n" } else { "template set\n" };
                say(&mut stdout, notice).await?;
                continue;
            }
            Command::Regenerate => {
                engine
                    .regenerate(caller.as_ref(), &conversation_id, GenerationParams::new())
                    .await
            }
            Command::Prompt(prompt) => {
                engine
                    .submit(
                        caller.as_ref(),
                        &conversation_id,
                        &prompt,
                        GenerationParams::new(),
                    )
                    .await
            }
        };

        match started {
            Ok(handle) => {
                let report = stream_to_stdout(&mut stdout, events, handle).await?;
                if let Some(report) = report {
                    describe(&mut stdout, &report).await?;
                }
            }
            Err(EngineError::AuthRequired { .. }) => {
                say(
                    &mut stdout,
                    &format!("login required: set {USER_ENV} to submit prompts\n"),
                )
                .await?;
            }
            Err(error) => say(&mut stdout, &format!("{error}\n")).await?,
        }
    }

    engine.shutdown();
    Ok(())
}

fn open_conversation(
    store: &ConversationStore,
    requested: Option<String>,
) -> CliResult<ConversationId> {
    if let Some(id) = requested.and_then(|raw| ConversationId::parse(&raw).ok()) {
        if store.contains(&id) {
            return Ok(id);
        }
        return store
            .create_conversation(id)
            .map(|conversation| conversation.id)
            .context(StoreSnafu {
                stage: "open-requested-conversation",
            });
    }

    if let Some(latest) = store.list_conversations().pop() {
        return Ok(latest.id);
    }

    store
        .create_conversation(ConversationId::generate())
        .map(|conversation| conversation.id)
        .context(StoreSnafu {
            stage: "create-first-conversation",
        })
}

/// Prints appended chunks until the session ends. Ctrl-C stops the stream.
async fn stream_to_stdout(
    stdout: &mut tokio::io::Stdout,
    mut events: broadcast::Receiver<StoreEvent>,
    handle: SessionHandle,
) -> CliResult<Option<SessionReport>> {
    let conversation_id = handle.conversation_id().clone();
    let thread_index = handle.thread_index();
    let cancel = handle.cancel_token();
    let waiting = handle.wait();
    tokio::pin!(waiting);

    loop {
        tokio::select! {
            report = &mut waiting => {
                // Every append happened before the report, so the backlog is complete.
                while let Ok(event) = events.try_recv() {
                    print_chunk(stdout, &event, &conversation_id, thread_index).await?;
                }
                say(stdout, "\n").await?;
                return Ok(match report {
                    Ok(report) => Some(report),
                    Err(error) => {
                        tracing::warn!(error = %error, "session task failed");
                        None
                    }
                });
            }
            event = events.recv() => match event {
                Ok(event) => print_chunk(stdout, &event, &conversation_id, thread_index).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "terminal fell behind the stream");
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => cancel.cancel(),
        }
    }
}

async fn print_chunk(
    stdout: &mut tokio::io::Stdout,
    event: &StoreEvent,
    conversation_id: &ConversationId,
    thread_index: usize,
) -> CliResult<()> {
    match event {
        StoreEvent::ChunkAppended {
            conversation_id: id,
            thread_index: index,
            chunk,
        } if id == conversation_id && *index == thread_index => say(stdout, chunk).await,
        _ => Ok(()),
    }
}

async fn describe(stdout: &mut tokio::io::Stdout, report: &SessionReport) -> CliResult<()> {
    match &report.termination {
        Termination::Completed => Ok(()),
        Termination::Aborted => say(stdout, "[stopped]\n").await,
        Termination::Errored(message) => say(stdout, &format!("[error: {message}]\n")).await,
    }
}

async fn say(stdout: &mut tokio::io::Stdout, text: &str) -> CliResult<()> {
    stdout.write_all(text.as_bytes()).await.context(TerminalSnafu {
        stage: "write-output",
    })?;
    stdout.flush().await.context(TerminalSnafu {
        stage: "flush-output",
    })
}
