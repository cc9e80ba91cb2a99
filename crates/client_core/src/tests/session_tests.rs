use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;

use super::*;

#[derive(Clone, Default)]
struct MockBackend {
    probe_calls: Arc<AtomicUsize>,
    reject_probe: Arc<AtomicBool>,
}

fn make_token(id: i64, username: &str) -> String {
    let claims = serde_json::json!({ "id": id, "username": username });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("header.{payload}.signature")
}

async fn messages(State(backend): State<MockBackend>) -> (StatusCode, Json<serde_json::Value>) {
    backend.probe_calls.fetch_add(1, Ordering::SeqCst);
    if backend.reject_probe.load(Ordering::SeqCst) {
        (StatusCode::FORBIDDEN, Json(serde_json::json!({ "message": "Invalid token" })))
    } else {
        (StatusCode::OK, Json(serde_json::json!([])))
    }
}

async fn login(
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, (StatusCode, Json<ErrorBody>)> {
    if request.password == "secret" {
        Ok(Json(TokenResponse {
            token: make_token(7, &request.username),
        }))
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                message: "Invalid credentials".to_string(),
            }),
        ))
    }
}

async fn spawn_backend(backend: MockBackend) -> String {
    let app = Router::new()
        .route("/messages", get(messages))
        .route("/api/auth/login", post(login))
        .route("/api/auth/register", post(|| async { StatusCode::CREATED }))
        .route("/api/auth/logout", post(|| async { StatusCode::NO_CONTENT }))
        .with_state(backend);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn gate_with(
    backend: MockBackend,
    credentials: Arc<MemoryCredentialStore>,
) -> SessionGate {
    let base_url = spawn_backend(backend).await;
    SessionGate::new(Client::new(), base_url, credentials)
}

#[test]
fn decode_identity_reads_the_payload_segment() {
    let identity = decode_identity(&make_token(42, "alice")).unwrap();
    assert_eq!(identity.user_id, UserId(42));
    assert_eq!(identity.username, "alice");
}

#[test]
fn decode_identity_rejects_garbage() {
    assert!(decode_identity("not-a-token").is_err());
    assert!(decode_identity("a.b.c").is_err());
}

#[tokio::test]
async fn absent_credential_settles_without_network() {
    let backend = MockBackend::default();
    let gate = gate_with(backend.clone(), Arc::new(MemoryCredentialStore::default())).await;

    let state = gate.validate().await.unwrap();

    assert_eq!(state, SessionState::Unauthenticated);
    assert_eq!(backend.probe_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn valid_credential_resolves_the_embedded_identity() {
    let backend = MockBackend::default();
    let credentials = Arc::new(MemoryCredentialStore::with_token(make_token(7, "alice")));
    let gate = gate_with(backend, credentials).await;

    let state = gate.validate().await.unwrap();

    let SessionState::Authenticated(identity) = state else {
        panic!("expected an authenticated session");
    };
    assert_eq!(identity.user_id, UserId(7));
    assert_eq!(identity.username, "alice");
    assert_eq!(*gate.watch().borrow(), SessionState::Authenticated(identity));
}

#[tokio::test]
async fn validation_runs_once_per_credential() {
    let backend = MockBackend::default();
    let credentials = Arc::new(MemoryCredentialStore::with_token(make_token(7, "alice")));
    let gate = gate_with(backend.clone(), credentials).await;

    let first = gate.validate().await.unwrap();
    let second = gate.validate().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(backend.probe_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_credential_is_cleared() {
    let backend = MockBackend::default();
    backend.reject_probe.store(true, Ordering::SeqCst);
    let credentials = Arc::new(MemoryCredentialStore::with_token(make_token(7, "alice")));
    let gate = gate_with(backend, credentials.clone()).await;

    let state = gate.validate().await.unwrap();

    assert_eq!(state, SessionState::Unauthenticated);
    assert!(credentials.load().await.unwrap().is_none());
}

#[tokio::test]
async fn login_stores_the_token_and_flips_state() {
    let credentials = Arc::new(MemoryCredentialStore::default());
    let gate = gate_with(MockBackend::default(), credentials.clone()).await;

    let identity = gate.login("alice", "secret").await.unwrap();

    assert_eq!(identity.username, "alice");
    assert!(credentials.load().await.unwrap().is_some());
    assert!(matches!(gate.state(), SessionState::Authenticated(_)));
}

#[tokio::test]
async fn login_failure_surfaces_the_backend_message() {
    let credentials = Arc::new(MemoryCredentialStore::default());
    let gate = gate_with(MockBackend::default(), credentials.clone()).await;

    let err = gate.login("alice", "wrong").await.unwrap_err();

    assert!(err.to_string().contains("Invalid credentials"));
    assert!(credentials.load().await.unwrap().is_none());
    assert_eq!(gate.state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn logout_drops_the_credential() {
    let credentials = Arc::new(MemoryCredentialStore::default());
    let gate = gate_with(MockBackend::default(), credentials.clone()).await;
    gate.login("alice", "secret").await.unwrap();

    gate.logout().await.unwrap();

    assert!(credentials.load().await.unwrap().is_none());
    assert_eq!(gate.state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn file_store_round_trips_and_clears() {
    let path = std::env::temp_dir().join(format!("cred-test-{}", uuid::Uuid::new_v4()));
    let store = FileCredentialStore::new(&path);

    assert!(store.load().await.unwrap().is_none());
    store.store("tok").await.unwrap();
    assert_eq!(store.load().await.unwrap().as_deref(), Some("tok"));
    store.clear().await.unwrap();
    assert!(store.load().await.unwrap().is_none());
    // Clearing twice stays quiet.
    store.clear().await.unwrap();
}
