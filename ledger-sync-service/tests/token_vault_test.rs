//! Token vault behavior against a mock provider token endpoint.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ledger_sync_service::config::BankFeedConfig;
use ledger_sync_service::services::ingest::bank_feed::BankFeedClient;
use ledger_sync_service::services::token_vault::{StoredTokens, TokenStore, TokenVault};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// In-memory token store standing in for the connections table.
struct MemoryStore {
    tokens: Mutex<StoredTokens>,
    expired_reason: Mutex<Option<String>>,
}

impl MemoryStore {
    fn new(access: &str, refresh: &str, expires_utc: DateTime<Utc>) -> Self {
        Self {
            tokens: Mutex::new(StoredTokens {
                access_token: access.to_string(),
                refresh_token: refresh.to_string(),
                expires_utc,
            }),
            expired_reason: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn load_tokens(&self, _connection_id: Uuid) -> Result<StoredTokens, AppError> {
        Ok(self.tokens.lock().await.clone())
    }

    async fn save_tokens(
        &self,
        _connection_id: Uuid,
        access_token: &str,
        refresh_token: &str,
        expires_utc: DateTime<Utc>,
    ) -> Result<(), AppError> {
        *self.tokens.lock().await = StoredTokens {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_utc,
        };
        Ok(())
    }

    async fn mark_auth_expired(
        &self,
        _connection_id: Uuid,
        reason: &str,
    ) -> Result<(), AppError> {
        *self.expired_reason.lock().await = Some(reason.to_string());
        Ok(())
    }
}

fn client_for(server: &MockServer) -> Arc<BankFeedClient> {
    Arc::new(BankFeedClient::new(BankFeedConfig {
        api_base_url: server.uri(),
        client_id: "client-1".to_string(),
        client_secret: Secret::new("secret".to_string()),
        request_timeout_secs: 5,
    }))
}

#[tokio::test]
async fn valid_token_is_returned_without_a_refresh() {
    let server = MockServer::start().await;
    // Any call to the token endpoint would fail the expectation.
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new(
        "cached-token",
        "refresh-1",
        Utc::now() + Duration::hours(1),
    ));
    let vault = TokenVault::new(store, client_for(&server), 60);

    let token = vault.get_valid_token(Uuid::new_v4()).await.unwrap();
    assert_eq!(token.expose_secret(), "cached-token");
}

#[tokio::test]
async fn concurrent_callers_spend_the_refresh_token_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "fresh-token",
            "refresh_token": "refresh-2",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    // Expires inside the 60s validity floor, so every caller wants a refresh.
    let store = Arc::new(MemoryStore::new(
        "stale-token",
        "refresh-1",
        Utc::now() + Duration::seconds(10),
    ));
    let vault = Arc::new(TokenVault::new(store.clone(), client_for(&server), 60));
    let connection_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let vault = vault.clone();
        handles.push(tokio::spawn(
            async move { vault.get_valid_token(connection_id).await },
        ));
    }

    for handle in handles {
        let token = handle.await.unwrap().unwrap();
        assert_eq!(token.expose_secret(), "fresh-token");
    }

    // The rotated refresh token was persisted.
    let tokens = store.load_tokens(connection_id).await.unwrap();
    assert_eq!(tokens.refresh_token, "refresh-2");
    // MockServer verifies expect(1) on drop.
}

#[tokio::test]
async fn provider_keeping_refresh_token_leaves_it_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "fresh-token",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new(
        "stale-token",
        "refresh-1",
        Utc::now() - Duration::seconds(5),
    ));
    let vault = TokenVault::new(store.clone(), client_for(&server), 60);
    let connection_id = Uuid::new_v4();

    vault.get_valid_token(connection_id).await.unwrap();

    let tokens = store.load_tokens(connection_id).await.unwrap();
    assert_eq!(tokens.refresh_token, "refresh-1");
}

#[tokio::test]
async fn rejected_refresh_surfaces_auth_expired_and_marks_the_connection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "access revoked by institution"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new(
        "stale-token",
        "refresh-1",
        Utc::now() - Duration::seconds(5),
    ));
    let vault = TokenVault::new(store.clone(), client_for(&server), 60);
    let connection_id = Uuid::new_v4();

    let err = vault.get_valid_token(connection_id).await.unwrap_err();
    match err {
        AppError::AuthExpired {
            connection_id: id,
            reason,
        } => {
            assert_eq!(id, connection_id);
            assert!(reason.contains("revoked"));
        }
        other => panic!("expected AuthExpired, got {:?}", other),
    }

    let marked = store.expired_reason.lock().await.clone();
    assert!(marked.unwrap().contains("revoked"));
}

#[tokio::test]
async fn transient_refresh_failure_is_not_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new(
        "stale-token",
        "refresh-1",
        Utc::now() - Duration::seconds(5),
    ));
    let vault = TokenVault::new(store.clone(), client_for(&server), 60);

    let err = vault.get_valid_token(Uuid::new_v4()).await.unwrap_err();
    assert!(err.is_transient(), "503 should map to a transient error");
    // Connection must not be marked expired for a transient failure.
    assert!(store.expired_reason.lock().await.is_none());
}
