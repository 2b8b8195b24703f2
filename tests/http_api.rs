//! HTTP surface tests against a fake synthesizer. No model weights needed.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use monitalk_tts::server::{router, AppState, SynthesisError, SynthesisRequest, Synthesizer};
use monitalk_tts::{AudioBuffer, Language};
use serde_json::{json, Value};
use tower::ServiceExt;

struct FakeSynth {
    voice: bool,
    fail: bool,
    seen: Mutex<Vec<SynthesisRequest>>,
}

impl FakeSynth {
    fn new(voice: bool) -> Self {
        Self {
            voice,
            fail: false,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(true)
        }
    }
}

#[async_trait]
impl Synthesizer for FakeSynth {
    fn has_voice(&self) -> bool {
        self.voice
    }

    async fn synthesize(&self, request: SynthesisRequest) -> Result<AudioBuffer, SynthesisError> {
        self.seen.lock().unwrap().push(request);
        if self.fail {
            return Err(SynthesisError::Engine(anyhow::anyhow!("decoder exploded")));
        }
        Ok(AudioBuffer::new(vec![0.25; 2400], 24_000))
    }
}

fn app_with(synth: Arc<FakeSynth>) -> Router {
    router(AppState::with_engine(synth))
}

fn post_tts(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/tts")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn health(app: Router) -> Value {
    let response = app
        .oneshot(Request::get("/api/tts/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

#[tokio::test]
async fn test_health_before_model_loads() {
    let body = health(router(AppState::new())).await;
    assert_eq!(body, json!({"status": "ok", "model": "not_loaded", "voice": "no_reference"}));
}

#[tokio::test]
async fn test_health_reports_voice() {
    let body = health(app_with(Arc::new(FakeSynth::new(true)))).await;
    assert_eq!(body["model"], "loaded");
    assert_eq!(body["voice"], "cloned");

    let body = health(app_with(Arc::new(FakeSynth::new(false)))).await;
    assert_eq!(body["model"], "loaded");
    assert_eq!(body["voice"], "no_reference");
}

#[tokio::test]
async fn test_engine_installed_late_is_visible() {
    let state = AppState::new();
    let app = router(state.clone());
    assert!(state.set_engine(Arc::new(FakeSynth::new(true))));
    assert!(!state.set_engine(Arc::new(FakeSynth::new(false))));
    assert_eq!(health(app).await["voice"], "cloned");
}

#[tokio::test]
async fn test_model_not_loaded_wins_over_empty_text() {
    let response = router(AppState::new())
        .oneshot(post_tts(json!({"text": "  "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await, json!({"detail": "Model not loaded yet"}));
}

#[tokio::test]
async fn test_missing_voice_wins_over_empty_text() {
    let response = app_with(Arc::new(FakeSynth::new(false)))
        .oneshot(post_tts(json!({"text": ""})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        json_body(response).await["detail"],
        "No reference audio loaded, voice cloning unavailable"
    );
}

#[tokio::test]
async fn test_empty_text_is_rejected() {
    let synth = Arc::new(FakeSynth::new(true));
    let response = app_with(synth.clone())
        .oneshot(post_tts(json!({"text": " \n\t"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["detail"], "Empty text");
    assert!(synth.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_language_is_rejected() {
    let response = app_with(Arc::new(FakeSynth::new(true)))
        .oneshot(post_tts(json!({"text": "hi", "language": "Klingon"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["detail"], "Unsupported language: Klingon");
}

#[tokio::test]
async fn test_synthesis_returns_wav() {
    let synth = Arc::new(FakeSynth::new(true));
    let response = app_with(synth.clone())
        .oneshot(post_tts(json!({"text": "  Hello there.  "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/wav");

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let reader = hound::WavReader::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, 24_000);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len(), 2400);

    let seen = synth.seen.lock().unwrap();
    assert_eq!(
        seen.as_slice(),
        &[SynthesisRequest {
            text: "Hello there.".into(),
            language: Language::English,
            seed: 42,
        }]
    );
}

#[tokio::test]
async fn test_request_fields_are_forwarded() {
    let synth = Arc::new(FakeSynth::new(true));
    let response = app_with(synth.clone())
        .oneshot(post_tts(json!({
            "text": "Bonjour",
            "language": "french",
            "instruct": "whisper",
            "seed": 7
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let seen = synth.seen.lock().unwrap();
    assert_eq!(seen[0].language, Language::French);
    assert_eq!(seen[0].seed, 7);
}

#[tokio::test]
async fn test_engine_failure_is_internal_error() {
    let response = app_with(Arc::new(FakeSynth::failing()))
        .oneshot(post_tts(json!({"text": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["detail"], "Synthesis failed: decoder exploded");
}

#[tokio::test]
async fn test_malformed_json_is_client_error() {
    let request = Request::builder()
        .method("POST")
        .uri("/api/tts")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"text\":"))
        .unwrap();
    let response = app_with(Arc::new(FakeSynth::new(true))).oneshot(request).await.unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_cors_preflight_is_allowed() {
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/tts")
        .header(header::ORIGIN, "http://localhost:5173")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = app_with(Arc::new(FakeSynth::new(true))).oneshot(request).await.unwrap();
    assert!(response.status().is_success());
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}
