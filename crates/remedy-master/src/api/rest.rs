use crate::error::MasterError;
use crate::Master;
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use remedy_core::wire::{
    self, ApiResponse, AuthGrant, AuthRequest, WorkerRequest, HEADER_ACCESS_KEY, HEADER_SIGNATURE,
    HEADER_TIMESTAMP,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// REST API routes
pub fn create_rest_api(master: Arc<Master>) -> Router {
    Router::new()
        .route(wire::AUTH_PATH, post(worker_auth))
        .route(wire::HEARTBEAT_PATH, put(worker_heartbeat))
        .route(wire::DISCONNECT_PATH, post(worker_disconnect))
        .route(wire::INITIALIZATION_PATH, get(worker_initialization))
        .route("/api/v1/queue/stats", get(queue_stats))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(master)
}

#[derive(Debug, Serialize)]
struct QueueStatsResponse {
    queues: BTreeMap<String, usize>,
    processing: usize,
    workers_connected: usize,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    connected_workers: usize,
}

/// Address of the caller, preferring the first `X-Forwarded-For` hop
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Verify the signature headers of a worker call against `subject`
fn verify_headers(master: &Master, headers: &HeaderMap, subject: &str) -> Result<(), ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let (Some(access_key), Some(timestamp), Some(signature)) = (
        header(HEADER_ACCESS_KEY),
        header(HEADER_TIMESTAMP),
        header(HEADER_SIGNATURE),
    ) else {
        return Err(MasterError::MissingCredentials.into());
    };
    let timestamp = timestamp
        .parse::<i64>()
        .map_err(|_| MasterError::BadRequest("invalid timestamp".into()))?;

    master.auth().verify_signed(access_key, timestamp, signature, subject)?;
    Ok(())
}

fn worker_body(payload: Result<Json<WorkerRequest>, JsonRejection>) -> Result<WorkerRequest, ApiError> {
    let Json(body) = payload.map_err(|e| MasterError::BadRequest(e.body_text()))?;
    if body.worker_id.is_empty() {
        return Err(MasterError::BadRequest("worker_id is required".into()).into());
    }
    Ok(body)
}

/// Worker handshake: returns database and queue connection details
async fn worker_auth(
    State(master): State<Arc<Master>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<AuthRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<AuthGrant>>, ApiError> {
    let Json(request) = payload.map_err(|e| MasterError::BadRequest(e.body_text()))?;
    let ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));

    match master.auth().authenticate(&request, &ip) {
        Ok(grant) => {
            master.metrics().record_auth("ok");
            Ok(Json(ApiResponse::ok(grant)))
        }
        Err(e) => {
            master.metrics().record_auth("rejected");
            Err(e.into())
        }
    }
}

async fn worker_heartbeat(
    State(master): State<Arc<Master>>,
    headers: HeaderMap,
    payload: Result<Json<WorkerRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    verify_headers(&master, &headers, wire::HEARTBEAT_PATH)?;
    let body = worker_body(payload)?;

    master.auth().heartbeat(&body.worker_id);
    Ok(Json(ApiResponse::ok(json!({ "timestamp": Utc::now().timestamp() }))))
}

async fn worker_disconnect(
    State(master): State<Arc<Master>>,
    headers: HeaderMap,
    payload: Result<Json<WorkerRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    let body = worker_body(payload)?;
    verify_headers(&master, &headers, &body.worker_id)?;

    master.auth().disconnect(&body.worker_id);
    Ok(Json(ApiResponse::ok(Value::Null)))
}

/// The master distributes no repositories or templates
async fn worker_initialization(
    State(master): State<Arc<Master>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    verify_headers(&master, &headers, wire::INITIALIZATION_PATH)?;
    Ok(Json(ApiResponse::ok(json!({
        "repositories": [],
        "templates": [],
        "timestamp": Utc::now().timestamp(),
    }))))
}

async fn queue_stats(State(master): State<Arc<Master>>) -> Result<Json<ApiResponse<QueueStatsResponse>>, ApiError> {
    let stats = master.queue().get_queue_stats().await.map_err(MasterError::from)?;
    let processing = master.queue().processing_len().await.map_err(MasterError::from)?;

    Ok(Json(ApiResponse::ok(QueueStatsResponse {
        queues: stats.to_map(),
        processing,
        workers_connected: master.auth().connections().count_active(),
    })))
}

/// Health check endpoint
async fn health_check(State(master): State<Arc<Master>>) -> Response {
    let connected_workers = master.auth().connections().count_active();
    match master.queue().ping().await {
        Ok(()) => Json(HealthResponse {
            status: "healthy".to_string(),
            connected_workers,
        })
        .into_response(),
        Err(e) => {
            tracing::warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy".to_string(),
                    connected_workers,
                }),
            )
                .into_response()
        }
    }
}

async fn metrics_handler(State(master): State<Arc<Master>>) -> Result<String, ApiError> {
    master.update_queue_metrics().await;
    Ok(master.metrics().gather().map_err(MasterError::from)?)
}

/// Renders any failure as the standard envelope with a matching HTTP status
#[derive(Debug)]
pub struct ApiError(MasterError);

impl From<MasterError> for ApiError {
    fn from(e: MasterError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.status_code();
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }

        let body = Json(ApiResponse::<Value>::error(code as i32, self.0.to_string()));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccessKeyEntry, MasterConfig};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use remedy_core::signature::sign;
    use remedy_queue::MemoryBackend;
    use tower::ServiceExt;

    fn master() -> Arc<Master> {
        let mut config = MasterConfig::default();
        config.access_keys = vec![AccessKeyEntry {
            access_key: "AK".into(),
            secret_key: "SK".into(),
            active: true,
            description: String::new(),
        }];
        Arc::new(Master::new(config, Arc::new(MemoryBackend::new())).unwrap())
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn auth_request(worker_id: &str, secret: &str) -> Request<Body> {
        let ts = Utc::now().timestamp();
        let body = json!({
            "access_key": "AK",
            "worker_id": worker_id,
            "timestamp": ts,
            "signature": sign(secret, "AK", worker_id, ts).unwrap(),
        });
        Request::post(wire::AUTH_PATH)
            .header("content-type", "application/json")
            .header("x-forwarded-for", "10.1.1.1, 192.168.0.1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn signed(method: &str, path: &str, subject: &str, body: Value) -> Request<Body> {
        let ts = Utc::now().timestamp();
        Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .header(HEADER_ACCESS_KEY, "AK")
            .header(HEADER_TIMESTAMP, ts.to_string())
            .header(HEADER_SIGNATURE, sign("SK", "AK", subject, ts).unwrap())
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_auth_flow() {
        let master = master();
        let app = create_rest_api(master.clone());

        let (status, body) = call(app.clone(), auth_request("w-1", "SK")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 200);
        assert_eq!(body["data"]["redis_config"]["prefix"], "ahop:queue");
        assert_eq!(master.auth().connections().get("w-1").unwrap().ip_address, "10.1.1.1");

        let (status, body) = call(app.clone(), auth_request("w-1", "SK")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], 409);

        let (status, _) = call(app, auth_request("w-2", "bad")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(master.metrics().auth_attempts_total.with_label_values(&["rejected"]).get(), 2);
    }

    #[tokio::test]
    async fn test_auth_malformed_body() {
        let request = Request::post(wire::AUTH_PATH)
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = call(create_rest_api(master()), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn test_heartbeat_and_disconnect() {
        let master = master();
        let app = create_rest_api(master.clone());
        call(app.clone(), auth_request("w-1", "SK")).await;

        let heartbeat = signed("PUT", wire::HEARTBEAT_PATH, wire::HEARTBEAT_PATH, json!({"worker_id": "w-1"}));
        let (status, _) = call(app.clone(), heartbeat).await;
        assert_eq!(status, StatusCode::OK);

        // signed over the wrong subject
        let forged = signed("POST", wire::DISCONNECT_PATH, "w-2", json!({"worker_id": "w-1"}));
        let (status, _) = call(app.clone(), forged).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let disconnect = signed("POST", wire::DISCONNECT_PATH, "w-1", json!({"worker_id": "w-1"}));
        let (status, _) = call(app, disconnect).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(master.auth().connections().count_active(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_requires_headers() {
        let request = Request::put(wire::HEARTBEAT_PATH)
            .header("content-type", "application/json")
            .body(Body::from(json!({"worker_id": "w-1"}).to_string()))
            .unwrap();
        let (status, body) = call(create_rest_api(master()), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "missing authentication headers");
    }

    #[tokio::test]
    async fn test_queue_stats_health_and_metrics() {
        let master = master();
        master
            .queue()
            .enqueue(remedy_core::TaskMessage::new("t-1", "ping", remedy_core::Priority::HIGHEST))
            .await
            .unwrap();
        let app = create_rest_api(master);

        let (status, body) = call(app.clone(), Request::get("/api/v1/queue/stats").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["queues"]["priority_1"], 1);
        assert_eq!(body["data"]["queues"]["total"], 1);

        let (status, body) = call(app.clone(), Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("remedy_queue_depth{priority=\"1\"} 1"));
    }

    #[test]
    fn test_client_ip_fallback() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)), "127.0.0.1");
        assert_eq!(client_ip(&headers, None), "unknown");
    }
}
