//! Speech endpoints.
//!
//! - `GET /api/speech/voices`: candidate voice names
//! - `POST /api/speech`: queue an utterance, returns a ticket
//! - `GET /api/speech/done?ticket=`: poll a ticket (consumes the completion)

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::AppState;

pub async fn voices(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"voices": state.bridge.voices()}))
}

#[derive(Deserialize)]
pub struct SpeakBody {
    pub text: String,
    /// Voice name; unknown names fall back to a random candidate.
    pub voice: Option<String>,
    #[serde(default = "default_volume")]
    pub volume: f32,
}

fn default_volume() -> f32 {
    1.0
}

/// `POST /api/speech`: `{"ticket": "<id>"}`, or `{"ticket": ""}` when the
/// request was rejected. An empty ticket polls as done.
pub async fn speak(State(state): State<AppState>, Json(body): Json<SpeakBody>) -> Json<Value> {
    let ticket = state
        .bridge
        .speak(&body.text, body.voice.as_deref(), body.volume);
    Json(json!({"ticket": ticket}))
}

#[derive(Deserialize)]
pub struct DoneQuery {
    #[serde(default)]
    pub ticket: String,
}

pub async fn done(State(state): State<AppState>, Query(query): Query<DoneQuery>) -> Json<Value> {
    Json(json!({"done": state.bridge.poll_completion(&query.ticket)}))
}
