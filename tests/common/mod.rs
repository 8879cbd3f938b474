#![allow(dead_code)]

use std::collections::HashSet;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use influence::{AppState, Config, app, db};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

pub const OPERATOR: &str = "root";

pub struct TestApp {
    _dir: TempDir,
    pub state: AppState,
    pub router: Router,
}

pub async fn spawn_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        database_url: format!("sqlite://{}", dir.path().join("app.db").display()),
        operators: HashSet::from([OPERATOR.to_owned()]),
        dev_login: true,
        ..Config::default()
    };

    let db_pool = db::connect(&config.database_url).await.unwrap();
    let state = AppState::new(db_pool, config);
    let router = app(state.clone());
    TestApp { _dir: dir, state, router }
}

impl TestApp {
    pub async fn call(&self, method: Method, uri: &str, cookie: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    /// Signs in through the dev shim and returns the session cookie.
    pub async fn login(&self, user_id: &str) -> String {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/session")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::json!({ "user_id": user_id }).to_string()))
            .unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .expect("login sets a session cookie")
            .to_str()
            .unwrap();
        cookie.split(';').next().unwrap().to_owned()
    }
}
