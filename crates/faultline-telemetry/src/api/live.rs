//! Live event streams over WebSocket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use super::AppState;
use crate::broadcast::ErrorEvent;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/live", get(live_all))
        .route("/live/{group_id}", get(live_group))
}

/// Frames the server sends besides events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Subscribed { topic: String },
    /// The subscriber fell behind and `missed` events were dropped.
    Lagged { missed: u64 },
}

async fn live_all(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    // Subscribe before the upgrade so nothing published meanwhile is lost.
    let events = state.recorder.broadcaster().subscribe_all();
    ws.on_upgrade(move |socket| stream_events(socket, events, "all".to_owned()))
}

async fn live_group(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> Response {
    let events = state.recorder.broadcaster().subscribe_group(group_id);
    ws.on_upgrade(move |socket| stream_events(socket, events, format!("group:{group_id}")))
}

async fn stream_events(
    socket: WebSocket,
    mut events: broadcast::Receiver<ErrorEvent>,
    topic: String,
) {
    let (mut sender, mut receiver) = socket.split();
    tracing::debug!(%topic, "live subscriber connected");

    if send_json(&mut sender, &ControlMessage::Subscribed { topic: topic.clone() })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_json(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(%topic, missed, "live subscriber lagged");
                    if send_json(&mut sender, &ControlMessage::Lagged { missed })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                // Pings are answered by the socket; other frames are ignored.
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!(%topic, "live subscriber disconnected");
}

/// Errors only when the socket is gone.
async fn send_json<S, T>(sender: &mut S, value: &T) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
    T: Serialize,
{
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialise live event");
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header::AUTHORIZATION, Request, StatusCode};
    use faultline_gateway::InterceptorConfig;
    use tower::ServiceExt;

    use super::*;
    use crate::api::{router, test_support};

    #[test]
    fn control_messages_are_tagged() {
        let json = serde_json::to_value(ControlMessage::Lagged { missed: 3 }).unwrap();
        assert_eq!(json["type"], "lagged");
        assert_eq!(json["missed"], 3);

        let json = serde_json::to_value(ControlMessage::Subscribed {
            topic: "all".to_owned(),
        })
        .unwrap();
        assert_eq!(json["type"], "subscribed");
    }

    #[tokio::test]
    async fn live_requires_token() {
        let app = router(
            AppState::new(test_support::recorder(), Some("s3cret")),
            InterceptorConfig::default(),
        );
        let res = app
            .oneshot(Request::get("/api/errors/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn plain_get_is_not_upgraded() {
        let app = router(
            AppState::new(test_support::recorder(), Some("s3cret")),
            InterceptorConfig::default(),
        );
        let group_id = Uuid::new_v4();
        let res = app
            .oneshot(
                Request::get(format!("/api/errors/live/{group_id}?access_token=s3cret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        // Authorised, but the request carries no upgrade headers.
        assert!(res.status().is_client_error());
        assert_ne!(res.status(), StatusCode::UNAUTHORIZED);

        let app = router(
            AppState::new(test_support::recorder(), Some("s3cret")),
            InterceptorConfig::default(),
        );
        let res = app
            .oneshot(
                Request::get("/api/errors/live")
                    .header(AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_ne!(res.status(), StatusCode::UNAUTHORIZED);
    }
}
