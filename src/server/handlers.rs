use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::synthesizer::{SynthesisError, SynthesisRequest};
use super::AppState;
use crate::Language;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    pub voice: String,
}

#[derive(Debug, Deserialize)]
pub struct TtsRequest {
    pub text: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub instruct: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_language() -> String {
    "English".to_string()
}

fn default_seed() -> u64 {
    42
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = state.engine();
    let model = if engine.is_some() { "loaded" } else { "not_loaded" };
    let voice = match engine {
        Some(engine) if engine.has_voice() => "cloned",
        _ => "no_reference",
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        model: model.to_string(),
        voice: voice.to_string(),
    })
}

pub async fn synthesize(
    State(state): State<AppState>,
    Json(req): Json<TtsRequest>,
) -> Result<Response, ApiError> {
    let engine = state
        .engine()
        .ok_or_else(|| ApiError::ServiceUnavailable("Model not loaded yet".into()))?;
    if !engine.has_voice() {
        return Err(no_voice());
    }
    let text = req.text.trim();
    if text.is_empty() {
        return Err(ApiError::BadRequest("Empty text".into()));
    }
    let language: Language = req
        .language
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Unsupported language: {}", req.language)))?;
    if !req.instruct.trim().is_empty() {
        tracing::debug!(instruct = %req.instruct, "instruct is ignored for cloned voices");
    }

    let request = SynthesisRequest {
        text: text.to_string(),
        language,
        seed: req.seed,
    };
    let audio = engine.synthesize(request).await.map_err(|e| match e {
        SynthesisError::NoVoice => no_voice(),
        other => ApiError::Internal(format!("Synthesis failed: {other}")),
    })?;
    let wav = audio
        .to_wav_bytes()
        .map_err(|e| ApiError::Internal(format!("Synthesis failed: {e:#}")))?;

    Ok(([(header::CONTENT_TYPE, "audio/wav")], wav).into_response())
}

fn no_voice() -> ApiError {
    ApiError::ServiceUnavailable("No reference audio loaded, voice cloning unavailable".into())
}
