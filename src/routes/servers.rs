//! Server directory endpoints.
//!
//! - `GET /api/servers`: latest snapshot with delay labels and selection
//! - `GET /api/servers/events`: SSE stream of snapshots while a list is on screen
//! - `POST /api/servers/refresh`: ask the engine to re-enumerate and probe
//! - `PUT /api/servers/selected`: select a server from the latest snapshot
//!
//! Credentials never leave the daemon; a server is selected by address and
//! port (plus `method` when that is ambiguous).

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    Json,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::{api_error, ApiError};
use crate::directory::{DirectoryObserver, DirectorySync, ObserverToken, ServerDescriptor};
use crate::AppState;

fn server_json(server: &ServerDescriptor, selected: bool) -> Value {
    json!({
        "name": server.name,
        "address": server.address,
        "port": server.port,
        "method": server.method,
        "delay_ms": server.delay,
        "delay": server.delay_status().to_string(),
        "selected": selected,
    })
}

fn snapshot_json(directory: &DirectorySync, servers: &[ServerDescriptor]) -> Value {
    let listed: Vec<Value> = servers
        .iter()
        .map(|s| server_json(s, directory.is_selected(s)))
        .collect();
    let selected = directory.current_selection().map(|s| server_json(&s, true));
    json!({"servers": listed, "selected": selected})
}

pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let directory = state.bridge.directory();
    Json(snapshot_json(directory, &directory.servers()))
}

/// `GET /api/servers/events`: one `servers` event per snapshot.
///
/// Opening a stream takes the directory's single observer slot, so an older
/// stream ends. The latest snapshot is replayed first. Closing the stream
/// frees the slot unless a newer stream already holds it.
pub async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let directory = Arc::clone(state.bridge.directory());
    let (tx, rx) = mpsc::unbounded_channel();

    let weak = Arc::downgrade(&directory);
    let observer: Arc<dyn DirectoryObserver> = Arc::new(move |servers: &[ServerDescriptor]| {
        let Some(directory) = weak.upgrade() else {
            return;
        };
        let data = snapshot_json(&directory, servers).to_string();
        let _ = tx.send(Event::default().event("servers").data(data));
    });
    let token = directory.subscribe(observer);
    debug!("Servers: event stream opened ({token:?})");

    Sse::new(DirectoryEvents {
        rx,
        directory,
        token,
    })
    .keep_alive(KeepAlive::default().interval(Duration::from_secs(15)))
}

/// Snapshot stream that gives its observer registration back when dropped.
struct DirectoryEvents {
    rx: mpsc::UnboundedReceiver<Event>,
    directory: Arc<DirectorySync>,
    token: ObserverToken,
}

impl Stream for DirectoryEvents {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Ends once a newer registration dropped our sender.
        self.rx.poll_recv(cx).map(|event| event.map(Ok))
    }
}

impl Drop for DirectoryEvents {
    fn drop(&mut self) {
        if self.directory.unregister_observer(self.token) {
            debug!("Servers: event stream closed ({:?})", self.token);
        }
    }
}

pub async fn refresh(State(state): State<AppState>) -> Json<Value> {
    state.bridge.directory().refresh();
    Json(json!({"refreshing": true}))
}

#[derive(Deserialize)]
pub struct SelectBody {
    pub address: String,
    pub port: u16,
    pub method: Option<String>,
}

/// Answers `404 SERVER_NOT_FOUND` when no server in the latest snapshot
/// matches.
pub async fn select(
    State(state): State<AppState>,
    Json(body): Json<SelectBody>,
) -> Result<Json<Value>, ApiError> {
    let directory = state.bridge.directory();
    let server = directory
        .servers()
        .iter()
        .find(|s| {
            s.address == body.address
                && s.port == body.port
                && body.method.as_ref().is_none_or(|m| *m == s.method)
        })
        .cloned()
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "SERVER_NOT_FOUND",
                format!("{}:{} is not in the server list", body.address, body.port),
            )
        })?;
    let reply = server_json(&server, true);
    directory.select(server);
    Ok(Json(reply))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::routes::testutil::{app, call, KEY};
    use crate::testing::server;

    async fn open_events(app: &Router) -> (StatusCode, Body) {
        let request = Request::get("/api/servers/events")
            .header("authorization", format!("Bearer {KEY}"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        (response.status(), response.into_body())
    }

    /// The next SSE frame as text, or `None` once the stream ended.
    async fn next_event(body: &mut Body) -> Option<String> {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .unwrap()?;
        let data = frame.unwrap().into_data().unwrap();
        Some(String::from_utf8(data.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_list_and_select() {
        let (h, app) = app();
        let mut tokyo = server("tokyo", "203.0.113.10", 443);
        tokyo.delay = Some(87);
        let mut osaka = server("osaka", "203.0.113.11", 443);
        osaka.delay = Some(30_000);
        h.bridge.directory().on_snapshot(vec![tokyo, osaka]);

        let (_, body) = call(&app, "GET", "/api/servers", None).await;
        assert_eq!(body["servers"][0]["delay"], "87 ms");
        assert_eq!(body["servers"][1]["delay"], "Timeout");
        assert!(body["servers"][0].get("credential").is_none());
        assert_eq!(body["selected"], json!(null));

        let (status, body) = call(
            &app,
            "PUT",
            "/api/servers/selected",
            Some(json!({"address": "203.0.113.11", "port": 443})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "osaka");
        assert_eq!(h.engine.count("set_selected_server"), 1);

        let (_, body) = call(&app, "GET", "/api/servers", None).await;
        assert_eq!(body["selected"]["name"], "osaka");
        assert_eq!(body["servers"][1]["selected"], true);
    }

    #[tokio::test]
    async fn test_select_unknown_server_is_not_found() {
        let (_h, app) = app();
        let (status, body) = call(
            &app,
            "PUT",
            "/api/servers/selected",
            Some(json!({"address": "198.51.100.1", "port": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "SERVER_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_refresh_asks_engine() {
        let (h, app) = app();
        call(&app, "POST", "/api/servers/refresh", None).await;
        assert_eq!(h.engine.count("enumerate_servers"), 1);
    }

    #[tokio::test]
    async fn test_events_stream_snapshots_until_closed() {
        let (h, app) = app();
        let directory = Arc::clone(h.bridge.directory());

        let (status, mut body) = open_events(&app).await;
        assert_eq!(status, StatusCode::OK);
        assert!(directory.has_observer());

        let replay = next_event(&mut body).await.unwrap();
        assert!(replay.contains("event: servers"));
        assert!(replay.contains(r#""servers":[]"#));

        directory.on_snapshot(vec![server("tokyo", "203.0.113.10", 443)]);
        let update = next_event(&mut body).await.unwrap();
        assert!(update.contains("tokyo"));
        assert!(!update.contains("secret"));

        drop(body);
        assert!(!directory.has_observer());
    }

    #[tokio::test]
    async fn test_newer_events_stream_replaces_older() {
        let (h, app) = app();
        let directory = Arc::clone(h.bridge.directory());

        let (_, mut first) = open_events(&app).await;
        next_event(&mut first).await.unwrap();
        let (_, mut second) = open_events(&app).await;
        next_event(&mut second).await.unwrap();

        // The older stream lost its registration and ends
        assert!(next_event(&mut first).await.is_none());
        drop(first);
        assert!(directory.has_observer());

        directory.on_snapshot(vec![server("osaka", "203.0.113.11", 443)]);
        assert!(next_event(&mut second).await.unwrap().contains("osaka"));
    }

    #[tokio::test]
    async fn test_events_require_auth() {
        let (_h, app) = app();
        let response = app
            .oneshot(Request::get("/api/servers/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
