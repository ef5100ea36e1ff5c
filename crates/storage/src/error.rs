use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("conversation '{id}' was not found"))]
    ConversationNotFound { stage: &'static str, id: String },
    #[snafu(display("conversation '{id}' already exists"))]
    ConversationExists { stage: &'static str, id: String },
    #[snafu(display("conversation id must not be blank"))]
    BlankConversationId { stage: &'static str },
    #[snafu(display("conversation '{id}' has no entry {index} (thread length {len})"))]
    EntryNotFound {
        stage: &'static str,
        id: String,
        index: usize,
        len: usize,
    },
    #[snafu(display(
        "conversation '{id}' cannot open entry {index} past thread length {len}"
    ))]
    ThreadIndexGap {
        stage: &'static str,
        id: String,
        index: usize,
        len: usize,
    },
    #[snafu(display("failed to create snapshot directory at {path}"))]
    CreateSnapshotDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to read conversation snapshot from {path}"))]
    ReadSnapshot {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write conversation snapshot to {path}"))]
    WriteSnapshot {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to replace conversation snapshot {from} -> {to}"))]
    ReplaceSnapshot {
        stage: &'static str,
        from: String,
        to: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to encode conversation snapshot on `{stage}`: {source}"))]
    EncodeSnapshot {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode conversation snapshot at {path}: {source}"))]
    DecodeSnapshot {
        stage: &'static str,
        path: String,
        source: serde_json::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
