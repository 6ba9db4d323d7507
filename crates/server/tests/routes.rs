#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use dashlite_core::{Identity, ResourceKind};
use dashlite_server::config::RolePermissions;
use dashlite_server::{router, Config, Services, SyncMode};
use dashlite_kubehub::StaticSource;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const ADMIN: &str = "admin-token";

fn config(anonymous: bool) -> Config {
    let mut cfg = Config::default();
    cfg.kubernetes.mode = SyncMode::Poll;
    cfg.kubernetes.max_attempts = 1;
    cfg.auth.permissions.insert("admin".into(), RolePermissions { allowed_namespace_patterns: vec![".*".into()] });
    cfg.auth
        .permissions
        .insert("viewer".into(), RolePermissions { allowed_namespace_patterns: vec!["project-.*-staging$".into()] });
    cfg.auth.tokens.insert(ADMIN.into(), Identity::new("root", ["admin"]));
    if anonymous {
        cfg.auth.allow_anonymous_access = true;
        cfg.auth.anonymous_role = Some("viewer".into());
    }
    cfg
}

fn start(anonymous: bool) -> (Services, Router, CancellationToken) {
    let cfg = config(anonymous);
    cfg.validate().unwrap();
    let shutdown = CancellationToken::new();
    let services = Services::start(&cfg, Arc::new(StaticSource::demo()), &shutdown).unwrap();
    let app = router(services.state.clone());
    (services, app, shutdown)
}

async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(t) = token {
        req = req.header("authorization", format!("Bearer {t}"));
    }
    let resp = app.clone().oneshot(req.body(Body::empty()).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, body)
}

fn names(v: &Value, field: &str) -> Vec<String> {
    v.as_array().unwrap().iter().map(|x| x[field].as_str().unwrap().to_string()).collect()
}

#[tokio::test]
async fn health_is_public_and_reports_sync() {
    let (services, app, shutdown) = start(false);
    for _ in 0..100 {
        if services.state.store.is_synced(ResourceKind::Pod) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (status, body) = call(&app, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["kubernetes_connected"], true);
    assert_eq!(body["connections"], 0);
    assert!(body.get("watchers").is_none());
    services.stop(&shutdown).await;
}

#[tokio::test]
async fn missing_or_bad_credentials_are_rejected() {
    let (services, app, shutdown) = start(false);
    let (status, body) = call(&app, Method::GET, "/api/k8s/namespaces", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = call(&app, Method::GET, "/api/k8s/namespaces", Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::get("/api/k8s/namespaces").header("authorization", "Basic Zm9v").body(Body::empty()).unwrap();
    assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::UNAUTHORIZED);
    services.stop(&shutdown).await;
}

#[tokio::test]
async fn admin_sees_every_namespace() {
    let (services, app, shutdown) = start(false);
    let (status, body) = call(&app, Method::GET, "/api/k8s/namespaces", Some(ADMIN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(names(&body, "name"), vec!["default", "kube-system", "project-app1-staging", "project-app2-prod"]);
    services.stop(&shutdown).await;
}

#[tokio::test]
async fn anonymous_viewer_is_restricted() {
    let (services, app, shutdown) = start(true);
    let (status, body) = call(&app, Method::GET, "/api/k8s/namespaces", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(names(&body, "name"), vec!["project-app1-staging"]);

    let (_, body) = call(&app, Method::GET, "/api/k8s/controllers?namespace=project-app2-prod", None).await;
    assert_eq!(body, Value::Array(Vec::new()));

    let (status, _) = call(&app, Method::GET, "/api/k8s/controllers/project-app2-prod/api", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    services.stop(&shutdown).await;
}

#[tokio::test]
async fn controllers_and_detail() {
    let (services, app, shutdown) = start(false);
    let (_, body) =
        call(&app, Method::GET, "/api/k8s/controllers?namespace=project-app2-prod&pattern=api,post", Some(ADMIN)).await;
    assert_eq!(names(&body, "name"), vec!["api", "postgres"]);

    let (status, detail) = call(&app, Method::GET, "/api/k8s/controllers/project-app2-prod/api", Some(ADMIN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["status"], "healthy");
    assert_eq!(detail["pods"].as_array().unwrap().len(), 3);
    assert!(detail["usage"]["cpu_millicores"].as_u64().unwrap() > 0);

    let (status, body) = call(&app, Method::GET, "/api/k8s/controllers/project-app2-prod/nope", Some(ADMIN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
    services.stop(&shutdown).await;
}

#[tokio::test]
async fn pods_and_summaries() {
    let (services, app, shutdown) = start(false);
    let (status, body) = call(&app, Method::GET, "/api/k8s/pods?namespace=project-app1-staging", Some(ADMIN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 4);

    let (status, body) = call(&app, Method::GET, "/api/k8s/pods?label_selector=%3Dbad", Some(ADMIN)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");

    let (_, body) = call(&app, Method::GET, "/api/k8s/namespaces/summary", Some(ADMIN)).await;
    let prod = body.as_array().unwrap().iter().find(|r| r["namespace"] == "project-app2-prod").cloned().unwrap();
    assert_eq!(prod["controllers"], 3);
    assert_eq!(prod["status"], "healthy");
    services.stop(&shutdown).await;
}

#[tokio::test]
async fn cache_clear_requires_auth() {
    let (services, app, shutdown) = start(false);
    let (status, _) = call(&app, Method::POST, "/api/k8s/cache/clear", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, body) = call(&app, Method::POST, "/api/k8s/cache/clear", Some(ADMIN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    services.stop(&shutdown).await;
}
