use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::post,
};
use castor::auth::device_flow::{DeviceFlow, PollOutcome};
use castor::config::AuthConfig;
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::net::TcpListener;
use url::Url;

#[derive(Clone, Default)]
struct CaptureState {
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
    responses: Arc<Mutex<Vec<(StatusCode, Value)>>>,
}

impl CaptureState {
    fn push_response(&self, status: StatusCode, body: Value) {
        self.responses.lock().unwrap().push((status, body));
    }

    fn forms(&self) -> Vec<HashMap<String, String>> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .map(|b| url::form_urlencoded::parse(b).into_owned().collect())
            .collect()
    }
}

async fn handler(
    State(state): State<CaptureState>,
    body: axum::body::Bytes,
) -> (StatusCode, Json<Value>) {
    state.bodies.lock().unwrap().push(body.to_vec());
    let mut responses = state.responses.lock().unwrap();
    if responses.is_empty() {
        (StatusCode::OK, Json(json!({})))
    } else {
        let (status, body) = responses.remove(0);
        (status, Json(body))
    }
}

async fn spawn_capture_server(state: CaptureState) -> Url {
    let app = Router::new()
        .route("/device/code", post(handler))
        .route("/token", post(handler))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });
    Url::parse(&format!("http://{addr}")).expect("valid base url")
}

fn make_cfg(base: &Url) -> AuthConfig {
    let mut cfg = AuthConfig::with_dir(PathBuf::from("/tmp/unused"));
    cfg.device_code_url = base.join("/device/code").unwrap();
    cfg.token_url = base.join("/token").unwrap();
    cfg.client_id = "client-id".to_string();
    cfg
}

#[tokio::test]
async fn device_code_request_posts_pkce_form_fields() {
    let state = CaptureState::default();
    state.push_response(
        StatusCode::OK,
        json!({
            "device_code": "dc-1",
            "user_code": "ABCD-1234",
            "verification_uri": "https://chat.qwen.ai/authorize",
            "verification_uri_complete": "https://chat.qwen.ai/authorize?user_code=ABCD-1234",
            "expires_in": 900,
            "interval": 5
        }),
    );
    let base = spawn_capture_server(state.clone()).await;
    let cfg = make_cfg(&base);
    let http = reqwest::Client::new();

    let device = DeviceFlow::request_device_code(&cfg, &http, "challenge-1")
        .await
        .expect("device authorization should start");

    let forms = state.forms();
    assert_eq!(forms.len(), 1);
    let form = &forms[0];
    assert_eq!(form.get("client_id").map(String::as_str), Some("client-id"));
    assert_eq!(
        form.get("code_challenge").map(String::as_str),
        Some("challenge-1")
    );
    assert_eq!(
        form.get("code_challenge_method").map(String::as_str),
        Some("S256")
    );
    assert!(
        form.get("scope")
            .is_some_and(|s| s.contains("model.completion")),
        "scope should request model completion; got {:?}",
        form.get("scope")
    );

    // The ready-made approval URL must carry the client id.
    assert_eq!(
        device.verification_uri_complete.as_deref(),
        Some("https://chat.qwen.ai/authorize?user_code=ABCD-1234&client=client-id")
    );
}

#[tokio::test]
async fn device_code_rejection_yields_none() {
    let state = CaptureState::default();
    state.push_response(StatusCode::BAD_REQUEST, json!({"error": "invalid_scope"}));
    let base = spawn_capture_server(state).await;
    let cfg = make_cfg(&base);

    let err = DeviceFlow::request_device_code(&cfg, &reqwest::Client::new(), "c")
        .await
        .expect_err("a rejected device-code request must fail");
    let castor::error::OauthError::UpstreamStatus(status) = err else {
        panic!("expected an upstream-status error, got {err:?}");
    };
    assert_eq!(status.as_u16(), StatusCode::BAD_REQUEST.as_u16());
}

#[tokio::test]
async fn poll_outcomes_map_rfc_error_codes() {
    let state = CaptureState::default();
    state.push_response(
        StatusCode::BAD_REQUEST,
        json!({"error": "authorization_pending"}),
    );
    state.push_response(StatusCode::TOO_MANY_REQUESTS, json!({"error": "slow_down"}));
    state.push_response(StatusCode::BAD_REQUEST, json!({"error": "access_denied"}));
    state.push_response(StatusCode::BAD_REQUEST, json!({"error": "expired_token"}));
    state.push_response(
        StatusCode::BAD_REQUEST,
        json!({"error": "totally_unknown", "error_description": "?"}),
    );
    let base = spawn_capture_server(state.clone()).await;
    let cfg = make_cfg(&base);
    let http = reqwest::Client::new();

    let poll = || DeviceFlow::poll_once(&cfg, &http, "dc-1", "verifier-1");
    assert!(matches!(poll().await, PollOutcome::Pending));
    assert!(matches!(poll().await, PollOutcome::SlowDown));
    assert!(matches!(poll().await, PollOutcome::Denied));
    assert!(matches!(poll().await, PollOutcome::Expired));
    assert!(matches!(poll().await, PollOutcome::Failed { fatal: true }));

    let forms = state.forms();
    assert_eq!(forms.len(), 5);
    assert_eq!(
        forms[0].get("grant_type").map(String::as_str),
        Some("urn:ietf:params:oauth:grant-type:device_code")
    );
    assert_eq!(forms[0].get("device_code").map(String::as_str), Some("dc-1"));
    assert_eq!(
        forms[0].get("code_verifier").map(String::as_str),
        Some("verifier-1")
    );
}

#[tokio::test]
async fn poll_success_returns_a_normalized_credential() {
    let state = CaptureState::default();
    state.push_response(
        StatusCode::OK,
        json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "token_type": "Bearer",
            "expires_in": 3600,
            "resource_url": "portal.qwen.ai"
        }),
    );
    let base = spawn_capture_server(state).await;
    let cfg = make_cfg(&base);

    let outcome = DeviceFlow::poll_once(&cfg, &reqwest::Client::new(), "dc-1", "v").await;
    let PollOutcome::Success(cred) = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(cred.access_token, "at-1");
    assert_eq!(cred.refresh_token, "rt-1");
    assert_eq!(cred.resource_url.as_deref(), Some("https://portal.qwen.ai"));
    assert!(!cred.is_expired(30_000));
}

#[tokio::test]
async fn poll_success_with_missing_refresh_token_is_fatal() {
    let state = CaptureState::default();
    state.push_response(
        StatusCode::OK,
        json!({"access_token": "at-1", "expires_in": 3600}),
    );
    let base = spawn_capture_server(state).await;
    let cfg = make_cfg(&base);

    let outcome = DeviceFlow::poll_once(&cfg, &reqwest::Client::new(), "dc-1", "v").await;
    assert!(matches!(outcome, PollOutcome::Failed { fatal: true }));
}
