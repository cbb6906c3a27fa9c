//! Bank-feed client behavior against a mock provider API.

use ledger_sync_service::config::BankFeedConfig;
use ledger_sync_service::services::ingest::bank_feed::BankFeedClient;
use secrecy::Secret;
use service_core::error::AppError;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> BankFeedClient {
    BankFeedClient::new(BankFeedConfig {
        api_base_url: server.uri(),
        client_id: "client-1".to_string(),
        client_secret: Secret::new("secret".to_string()),
        request_timeout_secs: 5,
    })
}

#[tokio::test]
async fn paginated_sync_reports_cursor_and_has_more() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/transactions/sync"))
        .and(query_param("cursor", "c0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "transactions": [
                {
                    "transaction_id": "t1",
                    "account_id": "acc-1",
                    "amount_minor": -4250,
                    "currency": "GBP",
                    "posted_at": "2025-03-01T09:30:00Z",
                    "merchant": "TESCO STORES 3027"
                },
                {
                    "transaction_id": "t2",
                    "account_id": "acc-1",
                    "amount_minor": -320,
                    "currency": "GBP",
                    "posted_at": "2025-03-01T11:00:00Z",
                    "merchant": "COSTA COFFEE"
                }
            ],
            "next_cursor": "c1",
            "has_more": true
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/transactions/sync"))
        .and(query_param("cursor", "c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "transactions": [
                {
                    "transaction_id": "t3",
                    "account_id": "acc-1",
                    "amount_minor": -1200,
                    "currency": "GBP",
                    "posted_at": "2025-03-02T08:00:00Z",
                    "merchant": "TFL TRAVEL CH"
                }
            ],
            "next_cursor": "c2",
            "has_more": false
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);

    let first = client
        .fetch_transactions_page("token", Some("c0"))
        .await
        .unwrap();
    assert_eq!(first.transactions.len(), 2);
    assert!(first.has_more);
    assert_eq!(first.next_cursor, "c1");

    let second = client
        .fetch_transactions_page("token", Some(&first.next_cursor))
        .await
        .unwrap();
    assert_eq!(second.transactions.len(), 1);
    assert!(!second.has_more);
}

#[tokio::test]
async fn rate_limit_maps_to_transient_error_with_hint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/transactions/sync"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .fetch_transactions_page("token", None)
        .await
        .unwrap_err();

    match err {
        AppError::UpstreamUnavailable {
            retry_after_secs, ..
        } => assert!(retry_after_secs.is_some()),
        other => panic!("expected UpstreamUnavailable, got {:?}", other),
    }
}

#[tokio::test]
async fn server_error_maps_to_transient_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.fetch_accounts("token").await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn accounts_parse_with_balances() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "accounts": [
                {
                    "account_id": "acc-1",
                    "currency": "GBP",
                    "balance_minor": 92000,
                    "balance_as_of": "2025-03-03T00:00:00Z"
                }
            ]
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let accounts = client.fetch_accounts("token").await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].balance_minor, 92000);
}

#[tokio::test]
async fn code_exchange_yields_initial_token_pair() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "initial-access",
            "refresh_token": "initial-refresh",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let pair = client.exchange_code("auth-code-1").await.unwrap();
    assert_eq!(pair.access_token, "initial-access");
    assert_eq!(pair.refresh_token.as_deref(), Some("initial-refresh"));
    assert_eq!(pair.expires_in_secs, 3600);
}
