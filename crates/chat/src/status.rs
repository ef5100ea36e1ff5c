use std::sync::Arc;

use tokio::sync::watch;

/// Tri-state activity flag consumed by the UI to enable or disable input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Idle,
    Loading,
    /// The last session ended, whatever the cause. UIs treat this like idle.
    Success,
}

impl Status {
    pub fn is_loading(self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn accepts_input(self) -> bool {
        !self.is_loading()
    }
}

/// Single-writer, many-reader status holder for one conversation.
///
/// Only the engine and the session it drives call [`StatusSignal::set`];
/// everyone else reads through [`StatusSignal::get`] or a watch receiver.
#[derive(Debug, Clone)]
pub struct StatusSignal {
    sender: Arc<watch::Sender<Status>>,
}

impl Default for StatusSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Status::Idle);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn get(&self) -> Status {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.sender.subscribe()
    }

    pub(crate) fn set(&self, status: Status) -> Status {
        self.sender.send_replace(status)
    }
}
