use async_trait::async_trait;
use chat_core::{HistoryPage, HistoryQuery, MessageId, OnlineSnapshot, PageSelector, RoomId};
use reqwest::{Client, RequestBuilder, Response, header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;
use url::Url;

use crate::{ChatApi, TransportError};

/// REST client for the chat server's JSON API.
///
/// Requests authenticate with the server's session cookie when one is set.
#[derive(Clone)]
pub struct HttpChatApi {
    http: Client,
    base_url: Url,
    session_cookie: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendBody<'a> {
    room_id: RoomId,
    message: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Outcome {
    success: bool,
    message: Option<String>,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl HttpChatApi {
    pub fn new(base_url: Url) -> Self {
        Self {
            http: Client::new(),
            base_url,
            session_cookie: None,
        }
    }

    /// Attach a `Cookie` header value to every request.
    pub fn with_session_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.session_cookie = Some(cookie.into());
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|err| TransportError::Protocol(format!("invalid endpoint {path}: {err}")))
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.session_cookie {
            Some(cookie) => request.header(header::COOKIE, cookie),
            None => request,
        }
    }

    async fn read_json<T: DeserializeOwned>(res: Response) -> Result<T, TransportError> {
        if res.status().is_success() {
            Ok(res.json::<T>().await?)
        } else {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            Err(TransportError::Status { status, body })
        }
    }

    fn check(outcome: Outcome) -> Result<(), TransportError> {
        if outcome.success {
            Ok(())
        } else {
            Err(TransportError::Rejected(
                outcome.message.unwrap_or_else(|| "request rejected".to_owned()),
            ))
        }
    }
}

/// Query pairs for a history request.
fn history_params(query: HistoryQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![("limit", query.limit.to_string())];
    match query.selector {
        PageSelector::Last => params.push(("page", "last".to_owned())),
        PageSelector::Page(page) => params.push(("page", page.to_string())),
        PageSelector::Offset(offset) => params.push(("offset", offset.to_string())),
    }
    params
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn history(
        &self,
        room_id: RoomId,
        query: HistoryQuery,
    ) -> Result<HistoryPage, TransportError> {
        let url = self.endpoint(&format!("api/chat/{room_id}/history"))?;
        debug!(room_id, ?query, "fetching history");
        let res = self
            .authed(self.http.get(url).query(&history_params(query)))
            .send()
            .await?;
        Self::read_json(res).await
    }

    async fn send(&self, room_id: RoomId, content: &str) -> Result<(), TransportError> {
        let url = self.endpoint("api/chat/send")?;
        let res = self
            .authed(self.http.post(url).json(&SendBody {
                room_id,
                message: content,
            }))
            .send()
            .await?;
        Self::check(Self::read_json(res).await?)
    }

    async fn delete(&self, room_id: RoomId, id: MessageId) -> Result<(), TransportError> {
        let url = self.endpoint(&format!("api/chat/{room_id}/messages/{id}"))?;
        let res = self.authed(self.http.delete(url)).send().await?;
        Self::check(Self::read_json(res).await?)
    }

    async fn online_count(&self, room_id: RoomId) -> Result<OnlineSnapshot, TransportError> {
        let url = self.endpoint(&format!("api/chat/{room_id}/online_count"))?;
        let res = self.authed(self.http.get(url)).send().await?;
        Self::read_json(res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_params_follow_selector() {
        let last = history_params(HistoryQuery {
            selector: PageSelector::Last,
            limit: 50,
        });
        assert_eq!(
            last,
            vec![("limit", "50".to_owned()), ("page", "last".to_owned())]
        );

        let offset = history_params(HistoryQuery {
            selector: PageSelector::Offset(20),
            limit: 10,
        });
        assert_eq!(offset[1], ("offset", "20".to_owned()));
    }

    #[test]
    fn endpoints_join_onto_base_path() {
        let api = HttpChatApi::new(Url::parse("https://chat.example/").expect("valid url"));
        let url = api
            .endpoint("api/chat/4/messages/9")
            .expect("endpoint should join");
        assert_eq!(url.as_str(), "https://chat.example/api/chat/4/messages/9");
    }

    #[test]
    fn unsuccessful_outcome_is_rejection() {
        let err = HttpChatApi::check(Outcome {
            success: false,
            message: Some("no permission".into()),
        })
        .expect_err("rejection expected");
        assert_eq!(err, TransportError::Rejected("no permission".into()));
    }
}
