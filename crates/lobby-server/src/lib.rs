use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};
use axum::{
    Router, middleware,
    routing::{get, patch, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use lobby_api::auth::{self, AppStateInner};
use lobby_api::middleware::require_auth;
use lobby_api::{messages, rooms};
use lobby_gateway::{FramePolicy, Gateway, GatewayConfig, connection};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub gateway: GatewayConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = lookup("LOBBY_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("LOBBY_JWT_SECRET is unset or still a placeholder");
        }

        let db_path = lookup("LOBBY_DB_PATH").unwrap_or_else(|| "lobby.db".into()).into();
        let host = lookup("LOBBY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parsed(&lookup, "LOBBY_PORT", 3000)?;
        let addr = format!("{}:{}", host, port)
            .parse()
            .map_err(|e| anyhow!("invalid listen address {host}:{port}: {e}"))?;

        let defaults = GatewayConfig::default();
        let ttl_hours: i64 = parsed(&lookup, "LOBBY_TOKEN_TTL_HOURS", 720)?;
        let heartbeat_secs: u64 = parsed(&lookup, "LOBBY_HEARTBEAT_SECS", defaults.heartbeat_interval.as_secs())?;
        if ttl_hours <= 0 || heartbeat_secs == 0 {
            bail!("LOBBY_TOKEN_TTL_HOURS and LOBBY_HEARTBEAT_SECS must be positive");
        }

        let gateway = GatewayConfig {
            subscriber_queue_capacity: parsed(&lookup, "LOBBY_SUBSCRIBER_QUEUE", defaults.subscriber_queue_capacity)?,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            token_ttl: chrono::Duration::hours(ttl_hours),
            room_invalid_frame: parsed::<FramePolicy>(&lookup, "LOBBY_ROOM_INVALID_FRAME", defaults.room_invalid_frame)?,
            direct_invalid_frame: parsed::<FramePolicy>(&lookup, "LOBBY_DIRECT_INVALID_FRAME", defaults.direct_invalid_frame)?,
        };

        Ok(Self {
            jwt_secret,
            db_path,
            addr,
            gateway,
        })
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}")),
    }
}

/// All HTTP and WebSocket routes, sharing one gateway.
pub fn build_router(gateway: Gateway) -> Router {
    let app_state = AppStateInner::from_gateway(&gateway);

    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/rooms", post(rooms::create_room).get(rooms::list_public_rooms))
        .route("/rooms/direct", get(rooms::list_direct_rooms))
        .route("/rooms/{link}", get(rooms::get_room))
        .route("/rooms/{link}/members", post(rooms::join_room))
        .route("/rooms/{link}/messages", get(messages::get_messages).post(messages::send_message))
        .route("/messages/{id}", patch(messages::update_message).delete(messages::delete_message))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_routes = Router::new()
        .route("/ws/chat/{room_link}", get(connection::room_chat_ws))
        .route("/ws/chat/d/{username}", get(connection::direct_chat_ws))
        .with_state(gateway);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use lobby_db::Store;
    use lobby_types::events::ServerEvent;
    use lobby_types::models::UserIdentity;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let cfg = Config::from_lookup(lookup(&[("LOBBY_JWT_SECRET", "s3cret")])).unwrap();
        assert_eq!(cfg.addr.port(), 3000);
        assert_eq!(cfg.db_path, PathBuf::from("lobby.db"));
        assert_eq!(cfg.gateway.subscriber_queue_capacity, 256);
        assert_eq!(cfg.gateway.token_ttl, chrono::Duration::hours(720));
        assert_eq!(cfg.gateway.room_invalid_frame, FramePolicy::Drop);
        assert_eq!(cfg.gateway.direct_invalid_frame, FramePolicy::Close);
    }

    #[test]
    fn test_config_rejects_placeholder_secret() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
        assert!(Config::from_lookup(lookup(&[("LOBBY_JWT_SECRET", "dev-secret-change-me")])).is_err());
    }

    #[test]
    fn test_config_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("LOBBY_JWT_SECRET", "s3cret"),
            ("LOBBY_HOST", "127.0.0.1"),
            ("LOBBY_PORT", "8080"),
            ("LOBBY_SUBSCRIBER_QUEUE", "16"),
            ("LOBBY_HEARTBEAT_SECS", "5"),
            ("LOBBY_ROOM_INVALID_FRAME", "close"),
        ]))
        .unwrap();
        assert_eq!(cfg.addr.to_string(), "127.0.0.1:8080");
        assert_eq!(cfg.gateway.subscriber_queue_capacity, 16);
        assert_eq!(cfg.gateway.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.gateway.room_invalid_frame, FramePolicy::Close);

        let bad = Config::from_lookup(lookup(&[("LOBBY_JWT_SECRET", "s3cret"), ("LOBBY_PORT", "http")]));
        assert!(bad.is_err());
    }

    struct App {
        router: Router,
        gateway: Gateway,
    }

    fn app() -> App {
        let store = Store::open_in_memory().unwrap();
        let gateway = Gateway::new(store, "test-secret", GatewayConfig::default());
        App {
            router: build_router(gateway.clone()),
            gateway,
        }
    }

    impl App {
        fn user(&self, name: &str) -> (UserIdentity, String) {
            let identity = self
                .gateway
                .store
                .database()
                .create_user(uuid::Uuid::new_v4(), name, "unused")
                .unwrap();
            let token = self.gateway.verifier.issue(&identity).unwrap();
            (identity, token)
        }

        async fn call(&self, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
            let mut req = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
            }
            let body = match body {
                Some(value) => {
                    req = req.header(header::CONTENT_TYPE, "application/json");
                    Body::from(value.to_string())
                }
                None => Body::empty(),
            };

            let res = self.router.clone().oneshot(req.body(body).unwrap()).await.unwrap();
            let status = res.status();
            let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
            let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, value)
        }
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let app = app();
        let creds = json!({ "username": "alice", "password": "correct horse" });

        let (status, body) = app.call("POST", "/auth/register", None, Some(creds.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["token"].is_string());

        let (status, _) = app.call("POST", "/auth/register", None, Some(creds.clone())).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = app.call("POST", "/auth/login", None, Some(creds)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["username"], "alice");

        let wrong = json!({ "username": "alice", "password": "battery staple" });
        let (status, _) = app.call("POST", "/auth/login", None, Some(wrong)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let bad_name = json!({ "username": "a_b", "password": "long enough" });
        let (status, _) = app.call("POST", "/auth/register", None, Some(bad_name)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rooms_require_auth() {
        let app = app();
        let (status, _) = app.call("GET", "/rooms", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = app.call("GET", "/rooms", Some("garbage"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let app = app();
        let (_alice, alice_token) = app.user("alice");
        let (_bob, bob_token) = app.user("bob");

        let (status, body) = app
            .call("POST", "/rooms", Some(&alice_token), Some(json!({ "name": "General", "room_type": "PUBLIC", "link": "general" })))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["admin"], "alice");
        assert_eq!(body["room"]["link"], "general");

        let (status, _) = app
            .call("POST", "/rooms", Some(&bob_token), Some(json!({ "name": "Dup", "room_type": "PUBLIC", "link": "general" })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .call("POST", "/rooms", Some(&alice_token), Some(json!({ "name": "Secret", "room_type": "PRIVATE" })))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let private_link = body["room"]["link"].as_str().unwrap().to_string();
        assert_eq!(private_link.len(), 13);

        let (status, body) = app.call("GET", "/rooms", Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let uri = format!("/rooms/{private_link}");
        let (status, _) = app.call("GET", &uri, Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let members = format!("/rooms/{private_link}/members");
        let (status, body) = app.call("POST", &members, Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["role"], "MEMBER");
        let (status, _) = app.call("POST", &members, Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = app.call("GET", &uri, Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = app.call("GET", "/rooms/nowhere", Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rest_message_reaches_live_sessions() {
        let app = app();
        let (alice, alice_token) = app.user("alice");
        let (bob, bob_token) = app.user("bob");

        let (_, body) = app
            .call("POST", "/rooms", Some(&alice_token), Some(json!({ "name": "General", "room_type": "PUBLIC", "link": "general" })))
            .await;
        let room_id = body["room"]["id"].as_i64().unwrap();

        let (session, mut rx) = app.gateway.registry.open_session(alice.clone());
        app.gateway.registry.join(room_id, &session);

        let (status, body) = app
            .call("POST", "/rooms/general/messages", Some(&bob_token), Some(json!({ "content": "hello" })))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let message_id = body["id"].as_i64().unwrap();

        match &*rx.recv().await.unwrap() {
            ServerEvent::ChatMessage { user, message, .. } => {
                assert_eq!(user, &bob.username);
                assert_eq!(message, "hello");
            }
            other => panic!("unexpected {other:?}"),
        }

        let (status, body) = app.call("GET", "/rooms/general/messages", Some(&alice_token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let uri = format!("/messages/{message_id}");
        let (status, _) = app
            .call("PATCH", &uri, Some(&alice_token), Some(json!({ "content": "hijacked" })))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app
            .call("PATCH", &uri, Some(&bob_token), Some(json!({ "content": "hello again" })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"], "hello again");

        let (status, _) = app.call("DELETE", &uri, Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = app.call("DELETE", &uri, Some(&bob_token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_direct_rooms_listed_for_participants() {
        let app = app();
        let (alice, alice_token) = app.user("alice");
        let (bob, _) = app.user("bob");
        let (_, carol_token) = app.user("carol");

        app.gateway
            .store
            .database()
            .get_or_create_direct_room(&alice, &bob)
            .unwrap();

        let (_, body) = app.call("GET", "/rooms/direct", Some(&alice_token), None).await;
        assert_eq!(body[0]["link"], "link_alice_bob");
        assert_eq!(body[0]["room_type"], "DIRECT");

        let (_, body) = app.call("GET", "/rooms/direct", Some(&carol_token), None).await;
        assert!(body.as_array().unwrap().is_empty());

        let (status, _) = app
            .call("POST", "/rooms", Some(&alice_token), Some(json!({ "name": "x", "room_type": "DIRECT" })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
