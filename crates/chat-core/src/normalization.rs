use chrono::{DateTime, NaiveDateTime};

use crate::{
    error::{ChatError, ChatErrorCategory},
    types::{
        ClientToken, Message, MessageKind, PresenceEvent, SendAckPayload, StatusLevel, ViewEvent,
        WireMessage,
    },
};

/// Parse a server timestamp into Unix milliseconds.
///
/// Accepts RFC 3339 values and naive ISO-8601 values, which the server emits
/// in UTC. Missing or unparseable values fall back to `now_ms`.
pub fn parse_timestamp_ms(raw: Option<&str>, now_ms: i64) -> i64 {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return now_ms;
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.timestamp_millis();
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc().timestamp_millis())
        .unwrap_or(now_ms)
}

/// Convert a wire payload into the internal message model.
pub fn normalize_wire_message(wire: &WireMessage, now_ms: i64) -> Message {
    let content = wire
        .content
        .clone()
        .or_else(|| wire.message.clone())
        .unwrap_or_default();
    let author_name = wire
        .nickname
        .clone()
        .filter(|name| !name.is_empty())
        .or_else(|| wire.username.clone())
        .unwrap_or_default();

    Message {
        id: wire.id,
        client_token: wire
            .client_id
            .as_deref()
            .filter(|raw| !raw.is_empty())
            .map(ClientToken::from_raw),
        content,
        timestamp_ms: parse_timestamp_ms(wire.timestamp.as_deref(), now_ms),
        author_id: wire.user_id,
        author_name,
        color: wire.color.clone(),
        badge: wire.badge.clone(),
        kind: wire.kind.unwrap_or_default(),
        pending: false,
        deleted: false,
    }
}

/// Convert a join/leave presence payload into a notice message.
pub fn normalize_presence(event: &PresenceEvent, kind: MessageKind, now_ms: i64) -> Message {
    let author_name = event
        .nickname
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| event.username.clone());

    Message {
        id: None,
        client_token: None,
        content: String::new(),
        timestamp_ms: parse_timestamp_ms(event.timestamp.as_deref(), now_ms),
        author_id: Some(event.user_id),
        author_name,
        color: None,
        badge: None,
        kind,
        pending: false,
        deleted: false,
    }
}

/// Send acknowledgement after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The ack carried the authoritative message.
    Confirmed(Message),
    /// The server accepted the send; the broadcast will confirm it.
    Accepted,
    /// The server refused the send.
    Rejected(ChatError),
}

/// Normalize a channel acknowledgement for the send identified by `token`.
///
/// The ack always names its token explicitly, so the returned message carries
/// it even when the payload omitted `client_id`.
pub fn normalize_send_ack(token: &ClientToken, ack: &SendAckPayload, now_ms: i64) -> SendOutcome {
    if !ack.success {
        let message = ack
            .message
            .clone()
            .unwrap_or_else(|| "message was rejected".to_owned());
        return SendOutcome::Rejected(ChatError::new(
            ChatErrorCategory::Permission,
            "send_rejected",
            message,
        ));
    }

    match &ack.data {
        Some(data) if data.id.is_some() => {
            let mut message = normalize_wire_message(data, now_ms);
            message.client_token = Some(token.clone());
            SendOutcome::Confirmed(message)
        }
        _ => SendOutcome::Accepted,
    }
}

/// Convert an error into a user-visible status event.
pub fn status_from_error(error: &ChatError) -> ViewEvent {
    let level = if error.is_recoverable() {
        StatusLevel::Warning
    } else {
        StatusLevel::Error
    };
    ViewEvent::Status {
        level,
        text: error.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageId;

    #[test]
    fn naive_timestamps_are_utc() {
        assert_eq!(
            parse_timestamp_ms(Some("2023-11-14T22:13:20.250000"), 0),
            1_700_000_000_250
        );
        assert_eq!(
            parse_timestamp_ms(Some("2023-11-14T23:13:20+01:00"), 0),
            1_700_000_000_000
        );
        assert_eq!(parse_timestamp_ms(Some("yesterday"), 77), 77);
        assert_eq!(parse_timestamp_ms(None, 88), 88);
    }

    #[test]
    fn wire_message_prefers_content_and_nickname() {
        let wire = WireMessage {
            id: Some(MessageId(9)),
            client_id: Some("client-1-a".into()),
            message: Some("legacy".into()),
            username: Some("alice".into()),
            nickname: Some("Ali".into()),
            ..Default::default()
        };

        let msg = normalize_wire_message(&wire, 5);
        assert_eq!(msg.content, "legacy");
        assert_eq!(msg.author_name, "Ali");
        assert_eq!(msg.timestamp_ms, 5);
        assert_eq!(msg.client_token, Some(ClientToken::from_raw("client-1-a")));
        assert_eq!(msg.kind, MessageKind::UserMessage);
    }

    #[test]
    fn ack_with_data_confirms_and_carries_token() {
        let token = ClientToken::from_raw("client-1-b");
        let ack = SendAckPayload {
            success: true,
            data: Some(WireMessage {
                id: Some(MessageId(42)),
                content: Some("hello".into()),
                ..Default::default()
            }),
            message: None,
        };

        match normalize_send_ack(&token, &ack, 0) {
            SendOutcome::Confirmed(msg) => {
                assert_eq!(msg.id, Some(MessageId(42)));
                assert_eq!(msg.client_token, Some(token));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn failed_ack_maps_to_stable_error_code() {
        let ack = SendAckPayload {
            success: false,
            data: None,
            message: Some("muted".into()),
        };
        match normalize_send_ack(&ClientToken::from_raw("t"), &ack, 0) {
            SendOutcome::Rejected(err) => {
                assert_eq!(err.code, "send_rejected");
                assert_eq!(err.message, "muted");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
