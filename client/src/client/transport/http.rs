//! JSON-over-HTTP transport against the widget front.

use super::CoordinatorApi;
use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use livecell_base::constraint::ConstraintDescriptor;
use livecell_base::error::{ErrorKind, LiveError};
use livecell_base::protocol::{
    BatchUpdateRequest, BatchUpdateResponse, CollaborationEvent, ConstraintsResponse,
    ExecuteCellRequest, ExecutionOutput, HistoryEntry, LockRequest, LockResponse,
    RegisterWidgetRequest, SessionInfo, StartSessionRequest, UpdateOutcome, UpdateValueRequest,
};
use livecell_base::widget::{ClientId, SessionId, WidgetId, WidgetRecord};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Deserialize)]
struct Removed {
    removed: bool,
}

#[derive(Deserialize)]
struct Released {
    released: bool,
}

#[derive(Clone, Debug)]
pub struct HttpCoordinator {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpCoordinator {
    /// `connect_timeout` bounds connection setup only; call deadlines are
    /// applied by the session client so event streams can stay open.
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("{}/{}", livecell_base::APP_NAME, env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout)
            .build()
            .map_err(LiveError::from)?;
        let base_url = Url::parse(base_url).map_err(|e| {
            LiveError::InvalidParameter(format!("coordinator url {}: {}", base_url, e))
        })?;
        Ok(Self { client, base_url })
    }

    /// Base url plus path segments; each segment is percent-encoded, so ids
    /// holding `/`, `?` or `#` stay one segment.
    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                LiveError::InvalidParameter(format!("{} can't be a base url", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn session_url(&self, session_id: &SessionId, rest: &[&str]) -> Result<Url> {
        self.url(
            ["live", "sessions", session_id.as_str()]
                .into_iter()
                .chain(rest.iter().copied()),
        )
    }

    fn widget_url(&self, session_id: &SessionId, widget_id: &WidgetId, rest: &[&str]) -> Result<Url> {
        self.session_url(
            session_id,
            &[&["widgets", widget_id.as_str()][..], rest].concat(),
        )
    }

    /// Turn the front's error body into a classified `LiveError`.
    async fn error_from(resp: reqwest::Response) -> anyhow::Error {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let err = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(ErrorBody { error }) => LiveError::WireError {
                kind: ErrorKind::from_code(&error.code),
                message: error.message,
            },
            Err(_) if status.is_server_error() => {
                LiveError::RemoteUnavailable(format!("coordinator answered {}", status))
            }
            Err(_) => LiveError::WireError {
                kind: ErrorKind::Internal,
                message: format!("unexpected response {}: {}", status, body),
            },
        };
        err.into()
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        if resp.status().is_success() {
            Ok(resp.json::<T>().await.map_err(LiveError::from)?)
        } else {
            Err(Self::error_from(resp).await)
        }
    }

    async fn send<T: DeserializeOwned>(req: reqwest::RequestBuilder) -> Result<T> {
        let resp = req.send().await.map_err(LiveError::from)?;
        Self::parse(resp).await
    }
}

/// Offset and length of the first blank line ending an event frame.
fn frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let find = |sep: &[u8]| buf.windows(sep.len()).position(|w| w == sep);
    let lf = find(b"\n\n").map(|at| (at, 2));
    let crlf = find(b"\r\n\r\n").map(|at| (at, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Split a `text/event-stream` body into collaboration events. Frames are
/// cut on raw bytes and decoded whole, so a character split across network
/// chunks survives. Comments (keep-alives) and undecodable frames are
/// skipped.
pub(crate) fn sse_events<S>(body: S) -> impl Stream<Item = CollaborationEvent> + Send + 'static
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    async_stream::stream! {
        let mut body = Box::pin(body);
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("event stream interrupted: {:?}", e);
                    break;
                }
            };
            buf.extend_from_slice(&chunk);
            while let Some((end, sep)) = frame_end(&buf) {
                let frame = buf.split_to(end + sep);
                let text = match std::str::from_utf8(&frame[..end]) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::debug!("skip event frame that is not utf-8: {:?}", e);
                        continue;
                    }
                };
                let data = text
                    .lines()
                    .filter_map(|l| l.strip_prefix("data:"))
                    .map(str::trim_start)
                    .collect::<Vec<_>>()
                    .join("\n");
                if data.is_empty() {
                    continue;
                }
                match serde_json::from_str::<CollaborationEvent>(&data) {
                    Ok(event) => yield event,
                    Err(e) => tracing::debug!("skip undecodable event frame: {:?}", e),
                }
            }
        }
    }
}

#[async_trait]
impl CoordinatorApi for HttpCoordinator {
    async fn start_session(&self, session_id: Option<SessionId>) -> Result<SessionInfo> {
        Self::send(
            self.client
                .post(self.url(["live", "sessions"])?)
                .json(&StartSessionRequest { session_id }),
        )
        .await
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<bool> {
        let r: Removed = Self::send(self.client.delete(self.session_url(session_id, &[])?)).await?;
        Ok(r.removed)
    }

    async fn register(
        &self,
        session_id: &SessionId,
        req: RegisterWidgetRequest,
    ) -> Result<WidgetRecord> {
        Self::send(
            self.client
                .post(self.session_url(session_id, &["widgets"])?)
                .json(&req),
        )
        .await
    }

    async fn update(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        req: UpdateValueRequest,
    ) -> Result<UpdateOutcome> {
        Self::send(
            self.client
                .put(self.widget_url(session_id, widget_id, &["value"])?)
                .json(&req),
        )
        .await
    }

    async fn batch(
        &self,
        session_id: &SessionId,
        req: BatchUpdateRequest,
    ) -> Result<BatchUpdateResponse> {
        Self::send(
            self.client
                .post(self.session_url(session_id, &["batch"])?)
                .json(&req),
        )
        .await
    }

    async fn state(&self, session_id: &SessionId, widget_id: &WidgetId) -> Result<WidgetRecord> {
        Self::send(self.client.get(self.widget_url(session_id, widget_id, &[])?)).await
    }

    async fn all_states(&self, session_id: &SessionId) -> Result<Vec<WidgetRecord>> {
        Self::send(
            self.client
                .get(self.session_url(session_id, &["widgets"])?),
        )
        .await
    }

    async fn constraints(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
    ) -> Result<ConstraintDescriptor> {
        let r: ConstraintsResponse = Self::send(
            self.client
                .get(self.widget_url(session_id, widget_id, &["constraints"])?),
        )
        .await?;
        Ok(r.constraints)
    }

    async fn history(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        since: Option<u64>,
    ) -> Result<Vec<HistoryEntry>> {
        let mut req = self
            .client
            .get(self.widget_url(session_id, widget_id, &["history"])?);
        if let Some(since) = since {
            req = req.query(&[("since", since)]);
        }
        Self::send(req).await
    }

    async fn lock(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        holder_id: &ClientId,
    ) -> Result<LockResponse> {
        Self::send(
            self.client
                .post(self.widget_url(session_id, widget_id, &["lock"])?)
                .json(&LockRequest {
                    holder_id: holder_id.clone(),
                }),
        )
        .await
    }

    async fn unlock(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        holder_id: &ClientId,
    ) -> Result<bool> {
        let r: Released = Self::send(
            self.client
                .delete(self.widget_url(session_id, widget_id, &["lock"])?)
                .json(&LockRequest {
                    holder_id: holder_id.clone(),
                }),
        )
        .await?;
        Ok(r.released)
    }

    async fn unregister(&self, session_id: &SessionId, widget_id: &WidgetId) -> Result<bool> {
        let r: Removed = Self::send(self.client.delete(self.widget_url(session_id, widget_id, &[])?)).await?;
        Ok(r.removed)
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
        observer: Option<ClientId>,
    ) -> Result<BoxStream<'static, CollaborationEvent>> {
        let mut req = self
            .client
            .get(self.session_url(session_id, &["events"])?)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(observer) = observer {
            req = req.query(&[("clientId", observer.as_str())]);
        }
        let resp = req.send().await.map_err(LiveError::from)?;
        if !resp.status().is_success() {
            return Err(Self::error_from(resp).await);
        }
        Ok(sse_events(resp.bytes_stream()).boxed())
    }

    async fn execute_cell(
        &self,
        session_id: &SessionId,
        cell_id: &str,
        code: &str,
    ) -> Result<ExecutionOutput> {
        Self::send(
            self.client
                .post(self.session_url(session_id, &["cells", cell_id, "execute"])?)
                .json(&ExecuteCellRequest {
                    code: code.to_string(),
                }),
        )
        .await
    }

    async fn session_state(&self, session_id: &SessionId) -> Result<serde_json::Value> {
        Self::send(
            self.client
                .get(self.session_url(session_id, &["state"])?),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static {
        let owned: Vec<reqwest::Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        futures::stream::iter(owned)
    }

    #[tokio::test]
    async fn test_sse_frames_split_across_chunks() {
        let body = chunks(&[
            ": keep-alive\n\n",
            "event: widgetRemoved\ndata: {\"type\":\"widget",
            "Removed\",\"widgetId\":\"w1\"}\n\n",
            "event: lockChanged\r\ndata: {\"type\":\"lockChanged\",\"widgetId\":\"w2\"}\r\n\r\n",
            "data: not json\n\n",
        ]);
        let events: Vec<CollaborationEvent> = sse_events(body).collect().await;
        assert_eq!(
            events,
            vec![
                CollaborationEvent::WidgetRemoved {
                    widget_id: WidgetId::new("w1")
                },
                CollaborationEvent::LockChanged {
                    widget_id: WidgetId::new("w2"),
                    lock: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_sse_keeps_characters_split_across_chunks() {
        let frame = "data: {\"type\":\"widgetRemoved\",\"widgetId\":\"h\u{e9}llo\"}\n\n".as_bytes();
        // cut between the two bytes of the e-acute
        let at = frame.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let parts: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::copy_from_slice(&frame[..at])),
            Ok(Bytes::copy_from_slice(&frame[at..])),
        ];
        let events: Vec<CollaborationEvent> =
            sse_events(futures::stream::iter(parts)).collect().await;
        assert_eq!(
            events,
            vec![CollaborationEvent::WidgetRemoved {
                widget_id: WidgetId::new("h\u{e9}llo")
            }]
        );
    }

    #[test]
    fn test_ids_are_single_path_segments() {
        let api = HttpCoordinator::new("http://127.0.0.1:8011/", Duration::from_secs(1)).unwrap();
        let url = api
            .widget_url(&SessionId::new("s 1"), &WidgetId::new("a/b?c#d"), &["value"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8011/live/sessions/s%201/widgets/a%2Fb%3Fc%23d/value"
        );
    }

    #[tokio::test]
    async fn test_unreachable_front_is_remote_unavailable() {
        let api = HttpCoordinator::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = api.start_session(None).await.unwrap_err();
        assert_eq!(LiveError::classify(&err), ErrorKind::RemoteUnavailable);
    }
}
