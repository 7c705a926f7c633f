//! HTTP resource store tests against a local stub of the resource API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Form, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use job_engine::config::ApiConfig;
use job_engine::store::{Filter, HttpResourceStore, ResourceStore, SearchQuery, StoreError};
use serde_json::{json, Value};

const COOKIE: &str = "com.sixsq.nuvla.cookie";

#[derive(Default)]
struct StubApi {
    logins: AtomicUsize,
    reject_logins: AtomicBool,
    /// Token of the only session the stub accepts.
    session: Mutex<Option<String>>,
    search_form: Mutex<Option<HashMap<String, String>>>,
}

impl StubApi {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(token) = self.session.lock().unwrap().clone() else {
            return false;
        };
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|cookies| cookies.contains(&format!("{}={}", COOKIE, token)))
    }

    fn expire_session(&self) {
        *self.session.lock().unwrap() = None;
    }
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "status": status.as_u16(), "message": message }))).into_response()
}

async fn login(State(api): State<Arc<StubApi>>) -> Response {
    let attempt = api.logins.fetch_add(1, Ordering::SeqCst) + 1;
    if api.reject_logins.load(Ordering::SeqCst) {
        return error(StatusCode::UNAUTHORIZED, "invalid credentials");
    }

    let token = format!("token-{}", attempt);
    *api.session.lock().unwrap() = Some(token.clone());
    (
        StatusCode::CREATED,
        [(header::SET_COOKIE, format!("{}={}; Path=/", COOKIE, token))],
        Json(json!({ "status": 201, "resource-id": format!("session/{}", attempt) })),
    )
        .into_response()
}

async fn get_job(State(api): State<Arc<StubApi>>, headers: HeaderMap) -> Response {
    if !api.authorized(&headers) {
        return error(StatusCode::UNAUTHORIZED, "session expired");
    }
    Json(json!({ "id": "job/1", "action": "collect_vm", "state": "RUNNING" })).into_response()
}

async fn edit_job(Json(partial): Json<Value>) -> Response {
    let mut doc = json!({ "id": "job/1", "action": "collect_vm", "state": "RUNNING" });
    if let (Some(fields), Some(changes)) = (doc.as_object_mut(), partial.as_object()) {
        for (key, value) in changes {
            fields.insert(key.clone(), value.clone());
        }
    }
    Json(doc).into_response()
}

async fn delete_job() -> Response {
    Json(json!({ "status": 200, "resource-id": "job/1" })).into_response()
}

async fn missing_job() -> Response {
    error(StatusCode::NOT_FOUND, "job/missing not found")
}

async fn busy_job() -> Response {
    error(StatusCode::CONFLICT, "job/busy was modified concurrently")
}

async fn unavailable_job() -> Response {
    error(StatusCode::SERVICE_UNAVAILABLE, "maintenance")
}

async fn teapot_job() -> Response {
    error(StatusCode::IM_A_TEAPOT, "short and stout")
}

async fn create_job() -> Response {
    (
        StatusCode::CREATED,
        Json(json!({ "status": 201, "resource-id": "job/new" })),
    )
        .into_response()
}

async fn search_jobs(
    State(api): State<Arc<StubApi>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    *api.search_form.lock().unwrap() = Some(form);
    Json(json!({
        "count": 3,
        "jobs": [{ "id": "job/a" }, { "id": "job/b" }],
    }))
    .into_response()
}

/// Serves the stub on an ephemeral port and returns its endpoint.
async fn serve(api: Arc<StubApi>) -> String {
    let app = Router::new()
        .route("/api/session", post(login))
        .route("/api/jobs", post(create_job).put(search_jobs))
        .route("/api/job/1", get(get_job).put(edit_job).delete(delete_job))
        .route("/api/job/missing", get(missing_job))
        .route("/api/job/busy", put(busy_job))
        .route("/api/job/down", get(unavailable_job))
        .route("/api/job/teapot", get(teapot_job))
        .with_state(api);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn logged_in_store() -> (Arc<StubApi>, HttpResourceStore) {
    let api = Arc::new(StubApi::default());
    let endpoint = serve(api.clone()).await;
    let store = HttpResourceStore::new(&ApiConfig::default().with_endpoint(endpoint)).unwrap();
    store.login("super", "secret").await.unwrap();
    (api, store)
}

/// Test 1: Error statuses map onto distinct store errors
#[tokio::test]
async fn test_status_mapping() {
    let (_api, store) = logged_in_store().await;

    let missing = store.get("job/missing").await.unwrap_err();
    assert!(matches!(missing, StoreError::NotFound(ref id) if id == "job/missing"));

    let busy = store.edit("job/busy", json!({ "progress": 10 })).await.unwrap_err();
    assert!(matches!(busy, StoreError::Conflict(ref id) if id == "job/busy"));
    assert!(busy.is_conflict());

    let down = store.get("job/down").await.unwrap_err();
    assert!(matches!(down, StoreError::Unavailable(ref message) if message == "maintenance"));

    let teapot = store.get("job/teapot").await.unwrap_err();
    assert!(matches!(teapot, StoreError::Api { status: 418, ref message } if message == "short and stout"));
}

/// Test 2: A 401 without a prior login is reported as unauthorized
#[tokio::test]
async fn test_unauthorized_without_session() {
    let api = Arc::new(StubApi::default());
    let endpoint = serve(api.clone()).await;
    let store = HttpResourceStore::new(&ApiConfig::default().with_endpoint(endpoint)).unwrap();

    let err = store.get("job/1").await.unwrap_err();
    assert!(matches!(err, StoreError::Unauthorized(ref message) if message == "session expired"));
    assert_eq!(api.logins.load(Ordering::SeqCst), 0);
}

/// Test 3: An expired session is reopened once and the request retried
#[tokio::test]
async fn test_expired_session_logs_in_again() {
    let (api, store) = logged_in_store().await;
    assert_eq!(store.get("job/1").await.unwrap()["state"], json!("RUNNING"));
    assert_eq!(api.logins.load(Ordering::SeqCst), 1);

    api.expire_session();
    let doc = store.get("job/1").await.unwrap();
    assert_eq!(doc["id"], json!("job/1"));
    assert_eq!(api.logins.load(Ordering::SeqCst), 2);

    // The new session sticks
    store.get("job/1").await.unwrap();
    assert_eq!(api.logins.load(Ordering::SeqCst), 2);
}

/// Test 4: When logging in again is refused the request fails as
/// unauthorized after a single attempt
#[tokio::test]
async fn test_rejected_relogin_is_unauthorized() {
    let (api, store) = logged_in_store().await;
    api.reject_logins.store(true, Ordering::SeqCst);
    api.expire_session();

    let err = store.get("job/1").await.unwrap_err();
    assert!(matches!(err, StoreError::Unauthorized(_)));
    assert_eq!(api.logins.load(Ordering::SeqCst), 2);
}

/// Test 5: Create, edit, search and delete speak the collection protocol
#[tokio::test]
async fn test_crud_and_search() {
    let (api, store) = logged_in_store().await;

    let id = store
        .create("jobs", json!({ "action": "collect_vm" }))
        .await
        .unwrap();
    assert_eq!(id, "job/new");

    let edited = store.edit("job/1", json!({ "progress": 40 })).await.unwrap();
    assert_eq!(edited["progress"], json!(40));
    assert_eq!(edited["action"], json!("collect_vm"));

    let query = SearchQuery::new()
        .filter(Filter::eq("state", "QUEUED"))
        .first(1)
        .last(2);
    let results = store.search("jobs", &query).await.unwrap();
    assert_eq!(results.count, 3);
    assert_eq!(results.resources.len(), 2);
    assert_eq!(results.resources[1]["id"], json!("job/b"));

    let form = api.search_form.lock().unwrap().clone().unwrap();
    assert_eq!(form.get("filter").map(String::as_str), Some("state=\"QUEUED\""));
    assert_eq!(form.get("first").map(String::as_str), Some("1"));
    assert_eq!(form.get("last").map(String::as_str), Some("2"));

    store.delete("job/1").await.unwrap();
}
