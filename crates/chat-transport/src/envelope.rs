use chat_core::{
    ChannelCommand, ChannelEvent, MessageId, PresenceEvent, RosterUser, SendAckPayload,
    WireMessage,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::TransportError;

/// Decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Event(ChannelEvent),
    /// Reply to an outbound frame that requested an ack.
    Ack { ack: u64, data: Value },
    /// Event this client does not handle.
    Ignored(String),
}

#[derive(Debug, Serialize)]
struct OutboundFrame<'a> {
    event: &'a str,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    ack: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: Option<String>,
    #[serde(default)]
    data: Value,
    ack: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeletedPayload {
    id: Option<MessageId>,
    message_id: Option<MessageId>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UsersPayload {
    users: Vec<RosterUser>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MessagePayload {
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CaptchaPayload {
    captcha_id: String,
    question: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IdResponsePayload {
    client_id: String,
    server_id: Option<MessageId>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DisconnectPayload {
    reason: Option<String>,
}

/// Encode a command as `{"event", "data", "ack"?}`.
pub fn encode_command(command: &ChannelCommand, ack: Option<u64>) -> Result<String, TransportError> {
    let data = match command {
        ChannelCommand::Join { room } => json!({ "room": room }),
        ChannelCommand::SendMessage(payload) => serde_json::to_value(payload)
            .map_err(|err| TransportError::Protocol(err.to_string()))?,
        ChannelCommand::GetOnlineUsers { room_id } | ChannelCommand::HeartbeatChat { room_id } => {
            json!({ "room_id": room_id })
        }
    };
    serde_json::to_string(&OutboundFrame {
        event: command.event_name(),
        data,
        ack,
    })
    .map_err(|err| TransportError::Protocol(err.to_string()))
}

/// Decode one inbound text frame.
pub fn decode_frame(text: &str) -> Result<InboundFrame, TransportError> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|err| TransportError::Protocol(err.to_string()))?;

    let Some(event) = raw.event else {
        return match raw.ack {
            Some(ack) => Ok(InboundFrame::Ack {
                ack,
                data: raw.data,
            }),
            None => Err(TransportError::Protocol(
                "frame has neither event nor ack".to_owned(),
            )),
        };
    };

    let data = raw.data;
    let decoded = match event.as_str() {
        "message" => ChannelEvent::Message(payload::<WireMessage>(data)?),
        "message_updated" => ChannelEvent::MessageUpdated(payload::<WireMessage>(data)?),
        "message_deleted" => {
            let deleted = payload::<DeletedPayload>(data)?;
            match deleted.id.or(deleted.message_id) {
                Some(id) => ChannelEvent::MessageDeleted { id },
                None => return Ok(InboundFrame::Ignored(event)),
            }
        }
        "online_users" => ChannelEvent::OnlineUsers {
            users: payload::<UsersPayload>(data)?.users,
        },
        "user_join" => ChannelEvent::UserJoin(payload::<PresenceEvent>(data)?),
        "user_leave" => ChannelEvent::UserLeave(payload::<PresenceEvent>(data)?),
        "permission_denied" => ChannelEvent::PermissionDenied {
            message: payload::<MessagePayload>(data)?.message,
        },
        "error" => ChannelEvent::ServerError {
            message: payload::<MessagePayload>(data)?
                .message
                .unwrap_or_else(|| "server error".to_owned()),
        },
        "require_captcha" => {
            let captcha = payload::<CaptchaPayload>(data)?;
            if captcha.captcha_id.is_empty() {
                return Ok(InboundFrame::Ignored(event));
            }
            ChannelEvent::RequireCaptcha {
                captcha_id: captcha.captcha_id,
                question: captcha.question,
            }
        }
        "message_id_response" => {
            let response = payload::<IdResponsePayload>(data)?;
            if response.client_id.is_empty() {
                return Ok(InboundFrame::Ignored(event));
            }
            ChannelEvent::SendAck {
                client_id: response.client_id,
                ack: SendAckPayload {
                    success: response.server_id.is_some(),
                    data: response.server_id.map(|id| WireMessage {
                        id: Some(id),
                        ..Default::default()
                    }),
                    message: None,
                },
            }
        }
        "disconnect" => ChannelEvent::Disconnected {
            reason: payload::<DisconnectPayload>(data)?
                .reason
                .unwrap_or_else(|| "io server disconnect".to_owned()),
            server_initiated: true,
        },
        _ => return Ok(InboundFrame::Ignored(event)),
    };
    Ok(InboundFrame::Event(decoded))
}

/// Turn the data of an ack reply into a `SendAck` for `client_id`.
pub fn decode_send_ack(client_id: String, data: Value) -> Result<ChannelEvent, TransportError> {
    Ok(ChannelEvent::SendAck {
        client_id,
        ack: payload::<SendAckPayload>(data)?,
    })
}

fn payload<T: DeserializeOwned + Default>(data: Value) -> Result<T, TransportError> {
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data).map_err(|err| TransportError::Protocol(err.to_string()))
}
