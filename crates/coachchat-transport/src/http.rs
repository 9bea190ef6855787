//! HTTP client for the auth and inference API.

use async_trait::async_trait;
use coachchat_core::{
    AuthBackend, AuthError, ClientConfig, InferenceClient, Message, Registration, RelayError,
    TokenGrant, UserId,
};
use reqwest::{Client, Response, StatusCode};

use crate::protocol::{ErrorResponse, LoginRequest, NewMessageRequest, TokenResponse};

/// Transport construction error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// HTTP client for the companion API: `/auth/*` and `/ai/*`.
///
/// Every request carries the configured timeout, so no call can hang.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a client from configuration.
    ///
    /// # Errors
    /// Returns error if the underlying HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self::with_client(client, &config.api_base_url))
    }

    /// Wrap an existing `reqwest` client.
    #[must_use]
    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Base URL requests are resolved against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

async fn error_detail(response: Response) -> String {
    let status = response.status();
    response
        .json::<ErrorResponse>()
        .await
        .map_or_else(|_| status.to_string(), |body| body.message())
}

fn network_error(err: &reqwest::Error) -> AuthError {
    AuthError::NetworkError(err.to_string())
}

#[async_trait]
impl AuthBackend for ApiClient {
    #[tracing::instrument(skip(self, password))]
    async fn login(&self, username: &str, password: &str) -> Result<TokenGrant, AuthError> {
        tracing::info!("Attempting login");
        let start = std::time::Instant::now();

        let request = LoginRequest {
            username: username.to_owned(),
            password: password.to_owned(),
        };
        let response = self
            .client
            .post(self.url("/auth/login"))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Login network error");
                network_error(&e)
            })?;

        let status = response.status();
        if status.is_success() {
            let body = response.json::<TokenResponse>().await.map_err(|e| {
                tracing::error!(error = %e, "Login response parse error");
                AuthError::ServerError(format!("Failed to parse response: {e}"))
            })?;
            tracing::info!(duration_ms = start.elapsed().as_millis(), "Login accepted");
            return Ok(TokenGrant {
                access_token: body.access_token,
                user_id: body.user.map(|u| UserId::new(u.id)),
            });
        }

        let detail = error_detail(response).await;
        tracing::warn!(status = status.as_u16(), %detail, "Login rejected");
        if status == StatusCode::UNAUTHORIZED {
            Err(AuthError::InvalidCredentials)
        } else {
            Err(AuthError::ServerError(detail))
        }
    }

    #[tracing::instrument(skip(self, registration), fields(username = %registration.username))]
    async fn register(&self, registration: &Registration) -> Result<(), AuthError> {
        let response = self
            .client
            .post(self.url("/auth/register"))
            .json(registration)
            .send()
            .await
            .map_err(|e| network_error(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = error_detail(response).await;
        tracing::warn!(status = status.as_u16(), %detail, "Registration rejected");
        if status.is_client_error() {
            Err(AuthError::Rejected(detail))
        } else {
            Err(AuthError::ServerError(detail))
        }
    }
}

#[async_trait]
impl InferenceClient for ApiClient {
    async fn notify_new_message(&self, token: &str, message: &Message) -> Result<(), RelayError> {
        let body = NewMessageRequest::from_message(message);
        let response = self
            .client
            .post(self.url("/ai/new-message"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(message_id = %message.id, "Relayed message to inference backend");
            Ok(())
        } else {
            Err(RelayError::Status(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::{
        Json, Router,
        extract::State,
        http::{HeaderMap, StatusCode as AxumStatus, header::AUTHORIZATION},
        routing::post,
    };
    use chrono::Utc;
    use coachchat_core::{ChannelId, MessageId};
    use serde_json::{Value, json};
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    type Seen = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/api")
    }

    async fn login(Json(body): Json<Value>) -> (AxumStatus, Json<Value>) {
        match body["password"].as_str() {
            Some("pw") => (
                AxumStatus::OK,
                Json(json!({ "access_token": "tok", "token_type": "bearer", "user": { "id": body["username"] } })),
            ),
            Some("boom") => (AxumStatus::INTERNAL_SERVER_ERROR, Json(json!({ "detail": "db down" }))),
            Some("") => (
                AxumStatus::UNPROCESSABLE_ENTITY,
                Json(json!({ "detail": "password is required" })),
            ),
            Some("spam") => (AxumStatus::TOO_MANY_REQUESTS, Json(json!({ "detail": "slow down" }))),
            _ => (
                AxumStatus::UNAUTHORIZED,
                Json(json!({ "detail": "Incorrect username or password" })),
            ),
        }
    }

    async fn register(Json(body): Json<Value>) -> (AxumStatus, Json<Value>) {
        if body["username"] == "taken" {
            (AxumStatus::BAD_REQUEST, Json(json!({ "detail": "Username already registered" })))
        } else if body["username"] == "crash" {
            (AxumStatus::SERVICE_UNAVAILABLE, Json(json!({ "detail": "maintenance" })))
        } else {
            (AxumStatus::OK, Json(json!({ "message": "ok" })))
        }
    }

    async fn new_message(State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>) -> AxumStatus {
        let auth = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        seen.lock().unwrap().push((auth, body.clone()));
        if body["message"]["text"] == "fail" {
            AxumStatus::BAD_GATEWAY
        } else {
            AxumStatus::OK
        }
    }

    async fn client_for(seen: Seen) -> ApiClient {
        let router = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/auth/register", post(register))
            .route("/api/ai/new-message", post(new_message))
            .with_state(seen);
        let base = serve(router).await;
        let config = ClientConfig::new(base, "key").with_request_timeout(Duration::from_secs(5));
        ApiClient::new(&config).unwrap()
    }

    fn message(text: &str) -> Message {
        Message {
            id: MessageId::new("m1"),
            channel_id: ChannelId::new("c1"),
            author_id: UserId::new("alice"),
            text: text.to_owned(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_login_status_mapping() {
        let client = client_for(Seen::default()).await;

        let grant = assert_ok!(client.login("alice", "pw").await);
        assert_eq!(grant.access_token, "tok");
        assert_eq!(grant.user_id, Some(UserId::new("alice")));

        assert_eq!(client.login("alice", "nope").await, Err(AuthError::InvalidCredentials));
        assert_eq!(
            client.login("alice", "boom").await,
            Err(AuthError::ServerError("db down".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_login_other_client_errors_are_not_bad_credentials() {
        let client = client_for(Seen::default()).await;

        assert_eq!(
            client.login("alice", "").await,
            Err(AuthError::ServerError("password is required".to_owned()))
        );
        assert_eq!(
            client.login("alice", "spam").await,
            Err(AuthError::ServerError("slow down".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_login_network_error() {
        let client = ApiClient::with_client(Client::new(), "http://127.0.0.1:9/api");
        let err = assert_err!(client.login("alice", "pw").await);
        assert!(matches!(err, AuthError::NetworkError(_)));
    }

    #[tokio::test]
    async fn test_register() {
        let client = client_for(Seen::default()).await;
        let mut registration = Registration {
            username: "dave".to_owned(),
            email: "dave@example.com".to_owned(),
            password: "pw".to_owned(),
            full_name: String::new(),
        };
        assert_ok!(client.register(&registration).await);

        registration.username = "taken".to_owned();
        assert_eq!(
            client.register(&registration).await,
            Err(AuthError::Rejected("Username already registered".to_owned()))
        );

        registration.username = "crash".to_owned();
        assert_eq!(
            client.register(&registration).await,
            Err(AuthError::ServerError("maintenance".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_relay_sends_bearer_and_event_type() {
        let seen = Seen::default();
        let client = client_for(Arc::clone(&seen)).await;

        assert_ok!(client.notify_new_message("tok", &message("hello")).await);
        assert_eq!(
            client.notify_new_message("tok", &message("fail")).await,
            Err(RelayError::Status(502))
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let (auth, body) = &seen[0];
        assert_eq!(auth.as_deref(), Some("Bearer tok"));
        assert_eq!(body["type"], "message.new");
        assert_eq!(body["cid"], "messaging:c1");
        assert_eq!(body["user"]["id"], "alice");
    }
}
