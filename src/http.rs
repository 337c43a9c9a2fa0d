use crate::engine::ResourceMonitor;
use crate::links::{Link, LinkStore, LinkStoreError};
use crate::metrics::Metrics;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header::CACHE_CONTROL, header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub monitor: ResourceMonitor,
    pub links: Arc<LinkStore>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResourcesQuery {
    history: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteLinkRequest {
    url: String,
}

pub fn build_router(
    metrics: Arc<Metrics>,
    monitor: ResourceMonitor,
    links: Arc<LinkStore>,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/resources", get(resources_handler))
        .route(
            "/api/links",
            get(list_links).post(save_link).delete(delete_link),
        )
        .with_state(HttpAppState {
            metrics,
            monitor,
            links,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn resources_handler(
    State(state): State<HttpAppState>,
    Query(query): Query<ResourcesQuery>,
) -> impl IntoResponse {
    let include_history = query.history.as_deref() == Some("1");
    let snapshot = state.monitor.snapshot(include_history).await;
    (
        [(CACHE_CONTROL, HeaderValue::from_static("no-store"))],
        Json(snapshot),
    )
}

async fn list_links(State(state): State<HttpAppState>) -> Json<Vec<Link>> {
    Json(state.links.list().await)
}

async fn save_link(State(state): State<HttpAppState>, Json(link): Json<Link>) -> Response {
    match state.links.upsert(link).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => link_error(err),
    }
}

async fn delete_link(
    State(state): State<HttpAppState>,
    Json(req): Json<DeleteLinkRequest>,
) -> Response {
    match state.links.delete(&req.url).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => link_error(err),
    }
}

fn link_error(err: LinkStoreError) -> Response {
    match err {
        LinkStoreError::EmptyUrl => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        other => {
            error!(error = %other, "не удалось сохранить ссылки");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourcesConfig;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Metrics::new().expect("инициализация метрик");
        let monitor = ResourceMonitor::new(ResourcesConfig::default(), metrics.clone());
        let links = LinkStore::open(dir.path().join("links.db.json"))
            .await
            .expect("хранилище ссылок");
        (build_router(metrics, monitor, Arc::new(links)), dir)
    }

    fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (app, _dir) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn metrics_are_exposed_as_text() {
        let (app, _dir) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
        assert!(body_text(response).await.contains("linksd_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn resources_are_not_cached_and_history_is_opt_in() {
        let (app, _dir) = app().await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/resources")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CACHE_CONTROL).unwrap(), "no-store");
        let plain: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(plain.get("history").is_none());
        assert!(plain.get("hostIp").is_some());
        assert!(plain["errors"].get("gpus").is_some());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/resources?history=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let full: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(full["history"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn links_can_be_saved_listed_and_deleted() {
        let (app, _dir) = app().await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/links",
                r#"{"url":"https://example.org","title":"Example"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/links").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listed: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(
            listed,
            serde_json::json!([{"url": "https://example.org", "title": "Example"}])
        );

        let response = app
            .clone()
            .oneshot(json_request(
                "DELETE",
                "/api/links",
                r#"{"url":"https://example.org"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/api/links").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_text(response).await, "[]");
    }

    #[tokio::test]
    async fn malformed_link_body_is_rejected() {
        let (app, _dir) = app().await;
        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/links", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(json_request("POST", "/api/links", r#"{"url":""}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
