use std::time::Duration;

use crate::{
    error::ChatError,
    retry::RetryPolicy,
    types::{ConnectionState, StatusLevel},
};

/// Delay between a connection error and the switch to polling.
pub const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_secs(3);
/// Reconnect attempts allowed before degrading to polling.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Transport-level happenings fed into the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionInput {
    /// Open the first channel for the session.
    ConnectRequested,
    /// The current channel instance reported `connect`.
    ChannelConnected,
    /// The current channel instance reported `disconnect`.
    ChannelDisconnected {
        reason: String,
        server_initiated: bool,
    },
    /// The channel reported `connect_error`.
    ConnectError { message: String },
    /// The channel could not be constructed at all.
    ChannelUnavailable { reason: String },
    /// The scheduled reconnect delay passed.
    ReconnectElapsed,
    /// The scheduled polling fallback delay passed.
    FallbackElapsed,
    /// The session is being torn down.
    Shutdown,
}

/// Side effects requested by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Publish the new state to the frontend.
    StateChanged(ConnectionState),
    /// Construct a new channel instance.
    OpenChannel,
    /// Emit `join` on the current channel instance.
    JoinRoom,
    /// Emit `get_online_users`.
    RequestRoster,
    /// Start the heartbeat and live roster timers.
    StartHeartbeat,
    /// Stop the heartbeat and live roster timers.
    StopHeartbeat,
    /// Fire `ReconnectElapsed` after the delay.
    ScheduleReconnect(Duration),
    /// Fire `FallbackElapsed` after the delay.
    ScheduleFallback(Duration),
    /// Drop the live channel and start the polling driver.
    StartPolling,
    /// Show a status line.
    Surface { level: StatusLevel, text: String },
}

/// Explicit lifecycle of the live channel.
///
/// `DegradedPolling` is terminal: once entered, every later input except
/// `Shutdown` is ignored.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    retry: RetryPolicy,
    max_reconnect_attempts: u32,
    fallback_delay: Duration,
    reconnect_attempts: u32,
    reconnect_scheduled: bool,
    channel_generation: u64,
    joined_generation: Option<u64>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new(
            RetryPolicy::default(),
            DEFAULT_MAX_RECONNECT_ATTEMPTS,
            DEFAULT_FALLBACK_DELAY,
        )
    }
}

impl ConnectionStateMachine {
    pub fn new(retry: RetryPolicy, max_reconnect_attempts: u32, fallback_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retry,
            max_reconnect_attempts,
            fallback_delay,
            reconnect_attempts: 0,
            reconnect_scheduled: false,
            channel_generation: 0,
            joined_generation: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Identifier of the most recently opened channel instance.
    pub fn channel_generation(&self) -> u64 {
        self.channel_generation
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn apply(&mut self, input: &ConnectionInput) -> Result<Vec<ConnectionAction>, ChatError> {
        use ConnectionInput::*;

        if let Shutdown = input {
            return Ok(self.shutdown());
        }
        if self.state == ConnectionState::DegradedPolling {
            return Ok(Vec::new());
        }

        match input {
            ConnectRequested => {
                self.expect_any_of(&[ConnectionState::Disconnected], "connect")?;
                Ok(self.open_channel())
            }
            ChannelConnected => self.on_connected(),
            ChannelDisconnected {
                reason,
                server_initiated,
            } => self.on_disconnected(reason, *server_initiated),
            ConnectError { message } => Ok(self.on_connect_error(message)),
            ChannelUnavailable { reason } => {
                Ok(self.degrade(format!("Live channel unavailable ({reason}), polling for updates")))
            }
            ReconnectElapsed => {
                self.expect_any_of(&[ConnectionState::Connecting], "reconnect")?;
                if !self.reconnect_scheduled {
                    return Err(ChatError::invalid_state(self.state, "reconnect"));
                }
                self.reconnect_scheduled = false;
                self.channel_generation += 1;
                Ok(vec![ConnectionAction::OpenChannel])
            }
            FallbackElapsed => {
                self.expect_any_of(&[ConnectionState::Error], "fallback")?;
                Ok(self.degrade("Live channel failed, polling for updates".to_owned()))
            }
            Shutdown => Ok(Vec::new()),
        }
    }

    fn on_connected(&mut self) -> Result<Vec<ConnectionAction>, ChatError> {
        self.expect_any_of(
            &[ConnectionState::Connecting, ConnectionState::Connected],
            "channel_connected",
        )?;

        let mut actions = Vec::new();
        if self.state != ConnectionState::Connected {
            self.state = ConnectionState::Connected;
            self.reconnect_attempts = 0;
            self.reconnect_scheduled = false;
            actions.push(ConnectionAction::StateChanged(ConnectionState::Connected));
            actions.push(ConnectionAction::Surface {
                level: StatusLevel::Info,
                text: "Connected".to_owned(),
            });
            actions.push(ConnectionAction::StartHeartbeat);
        }
        if self.joined_generation != Some(self.channel_generation) {
            self.joined_generation = Some(self.channel_generation);
            actions.push(ConnectionAction::JoinRoom);
            actions.push(ConnectionAction::RequestRoster);
        }
        Ok(actions)
    }

    fn on_disconnected(
        &mut self,
        reason: &str,
        server_initiated: bool,
    ) -> Result<Vec<ConnectionAction>, ChatError> {
        self.expect_any_of(
            &[ConnectionState::Connected, ConnectionState::Connecting],
            "channel_disconnected",
        )?;

        self.state = ConnectionState::Disconnected;
        let mut actions = vec![
            ConnectionAction::StopHeartbeat,
            ConnectionAction::StateChanged(ConnectionState::Disconnected),
        ];
        if server_initiated {
            actions.push(ConnectionAction::Surface {
                level: StatusLevel::Warning,
                text: format!("Disconnected by server: {reason}"),
            });
            return Ok(actions);
        }

        if self.reconnect_attempts >= self.max_reconnect_attempts {
            actions.extend(self.degrade("Reconnect attempts exhausted, polling for updates".to_owned()));
            return Ok(actions);
        }

        let delay = self.retry.delay_for_attempt(self.reconnect_attempts, None);
        self.reconnect_attempts += 1;
        self.reconnect_scheduled = true;
        self.state = ConnectionState::Connecting;
        actions.push(ConnectionAction::StateChanged(ConnectionState::Connecting));
        actions.push(ConnectionAction::Surface {
            level: StatusLevel::Warning,
            text: format!(
                "Connection lost, reconnecting in {}s",
                delay.as_secs_f32().round() as u64
            ),
        });
        actions.push(ConnectionAction::ScheduleReconnect(delay));
        Ok(actions)
    }

    fn on_connect_error(&mut self, message: &str) -> Vec<ConnectionAction> {
        if self.state == ConnectionState::Error {
            return Vec::new();
        }
        self.state = ConnectionState::Error;
        self.reconnect_scheduled = false;
        vec![
            ConnectionAction::StopHeartbeat,
            ConnectionAction::StateChanged(ConnectionState::Error),
            ConnectionAction::Surface {
                level: StatusLevel::Error,
                text: format!("Connection error: {message}"),
            },
            ConnectionAction::ScheduleFallback(self.fallback_delay),
        ]
    }

    fn open_channel(&mut self) -> Vec<ConnectionAction> {
        self.state = ConnectionState::Connecting;
        self.channel_generation += 1;
        vec![
            ConnectionAction::StateChanged(ConnectionState::Connecting),
            ConnectionAction::OpenChannel,
        ]
    }

    fn degrade(&mut self, text: String) -> Vec<ConnectionAction> {
        self.state = ConnectionState::DegradedPolling;
        self.reconnect_scheduled = false;
        vec![
            ConnectionAction::StopHeartbeat,
            ConnectionAction::StateChanged(ConnectionState::DegradedPolling),
            ConnectionAction::Surface {
                level: StatusLevel::Warning,
                text,
            },
            ConnectionAction::StartPolling,
        ]
    }

    fn shutdown(&mut self) -> Vec<ConnectionAction> {
        self.state = ConnectionState::Disconnected;
        self.reconnect_scheduled = false;
        vec![
            ConnectionAction::StopHeartbeat,
            ConnectionAction::StateChanged(ConnectionState::Disconnected),
        ]
    }

    fn expect_any_of(&self, expected: &[ConnectionState], action: &str) -> Result<(), ChatError> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(ChatError::invalid_state(self.state, action))
        }
    }
}
