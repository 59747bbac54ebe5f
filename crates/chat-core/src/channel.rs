use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{SessionCommand, TimelineOp, ViewEvent};

/// Receiver half handed to each frontend. Events emitted before a frontend
/// subscribes are not replayed.
pub type ViewEventStream = broadcast::Receiver<ViewEvent>;

#[derive(Debug, Error)]
pub enum SessionChannelError {
    /// The room session has left or crashed.
    #[error("room session is no longer running")]
    SessionStopped,
}

/// Wiring between one room session and any number of frontends.
///
/// Frontends push [`SessionCommand`]s into a bounded queue owned by the
/// session; the session fans [`ViewEvent`]s out to every subscriber.
#[derive(Clone, Debug)]
pub struct SessionChannels {
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<ViewEvent>,
}

impl SessionChannels {
    /// Returns the channels and the command queue the session task drains.
    pub fn new(
        command_capacity: usize,
        event_capacity: usize,
    ) -> (Self, mpsc::Receiver<SessionCommand>) {
        let (commands, queue) = mpsc::channel(command_capacity.max(1));
        let (events, _) = broadcast::channel(event_capacity.max(1));
        (Self { commands, events }, queue)
    }

    pub fn subscribe(&self) -> ViewEventStream {
        self.events.subscribe()
    }

    /// Queue a command, waiting while the session is busy.
    pub async fn send_command(&self, command: SessionCommand) -> Result<(), SessionChannelError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionChannelError::SessionStopped)
    }

    /// Publish an event. Having no frontend attached is not an error.
    pub fn emit(&self, event: ViewEvent) {
        let _ = self.events.send(event);
    }

    /// Publish a timeline delta unless it is empty. Returns whether anything
    /// was sent.
    pub fn emit_delta(&self, ops: Vec<TimelineOp>) -> bool {
        if ops.is_empty() {
            return false;
        }
        self.emit(ViewEvent::TimelineDelta { ops });
        true
    }
}
