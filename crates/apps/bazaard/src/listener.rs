//! HTTP endpoint for marketplace notifications
//!
//! Only `POST /webhooks` is routed. The dispatcher does blocking network and
//! database work, so each notification is processed on the blocking pool and
//! the response is written once it has been handled.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::post;
use log::{error, info};
use market::{Acknowledgement, WebhookDispatcher};

const WEBHOOK_PATH: &str = "/webhooks";
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Status returned to the platform for a dispatcher decision
fn status_for(ack: Acknowledgement) -> StatusCode {
    match ack {
        Acknowledgement::Accepted => StatusCode::OK,
        Acknowledgement::Rejected => StatusCode::BAD_REQUEST,
        // 5xx so the platform retries
        Acknowledgement::Redeliver => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn receive(State(dispatcher): State<Arc<WebhookDispatcher>>, body: Bytes) -> StatusCode {
    match tokio::task::spawn_blocking(move || dispatcher.process(&body)).await {
        Ok(ack) => status_for(ack),
        Err(e) => {
            error!("[WEBHOOK] Handler did not complete: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub fn router(dispatcher: Arc<WebhookDispatcher>) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(receive))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(dispatcher)
}

/// Serve notifications until `shutdown` resolves
pub async fn serve(
    listener: tokio::net::TcpListener,
    dispatcher: Arc<WebhookDispatcher>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Webhook listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use market::remote::api::TokenResponse;
    use market::{
        ApiError, InMemoryMarketStore, MarketStore, MarketplaceApi, ResourceKind, SearchPage,
        SearchQuery, SyncSettings, SystemClock, TokenEndpoint, TokenGrant, TokenRefresher, UserId,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    struct Tokens;

    impl TokenEndpoint for Tokens {
        fn exchange(&self, _: TokenGrant<'_>) -> Result<TokenResponse, ApiError> {
            Ok(TokenResponse {
                access_token: "access".into(),
                refresh_token: Some("refresh".into()),
                expires_in: 21_600,
                user_id: None,
            })
        }
    }

    struct Items;

    impl MarketplaceApi for Items {
        fn search(&self, _: &str, _: &SearchQuery) -> Result<SearchPage, ApiError> {
            Ok(SearchPage::default())
        }

        fn get(&self, _: &str, _: ResourceKind, id: &str) -> Result<serde_json::Value, ApiError> {
            Ok(serde_json::json!({ "id": id, "title": "Lamp" }))
        }
    }

    fn dispatcher() -> (Arc<WebhookDispatcher>, Arc<InMemoryMarketStore>) {
        let store = Arc::new(InMemoryMarketStore::new());
        let refresher = Arc::new(TokenRefresher::new(
            store.clone(),
            Arc::new(Tokens),
            Arc::new(SystemClock),
        ));
        refresher
            .exchange_code(&UserId::new("7"), "code", "https://cb")
            .unwrap();
        let dispatcher =
            WebhookDispatcher::new(refresher, Arc::new(Items), &SyncSettings::default());
        (Arc::new(dispatcher), store)
    }

    fn notification(resource: &str) -> Vec<u8> {
        serde_json::json!({
            "_id": "n-1",
            "resource": resource,
            "user_id": 7,
            "topic": "items",
            "application_id": 99,
            "attempts": 1,
        })
        .to_string()
        .into_bytes()
    }

    async fn send(app: Router, method: &str, uri: &str, body: Vec<u8>) -> StatusCode {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_notification_is_acknowledged() {
        let (dispatcher, store) = dispatcher();
        let status = send(router(dispatcher), "POST", "/webhooks", notification("/items/MLB1")).await;
        assert_eq!(status, StatusCode::OK);

        let stored = store
            .get_resource(&UserId::new("7"), ResourceKind::Catalog, "MLB1")
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_routing() {
        let (dispatcher, _store) = dispatcher();
        let app = router(dispatcher);

        let status = send(app.clone(), "GET", "/webhooks", Vec::new()).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        let status = send(app.clone(), "POST", "/other", notification("/items/MLB1")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let status = send(app.clone(), "POST", "/webhooks", b"{ nope".to_vec()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let status = send(app, "POST", "/webhooks", vec![b' '; MAX_BODY_BYTES + 1]).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_redelivery_asks_for_retry() {
        assert_eq!(status_for(Acknowledgement::Accepted), StatusCode::OK);
        assert_eq!(status_for(Acknowledgement::Rejected), StatusCode::BAD_REQUEST);
        assert!(status_for(Acknowledgement::Redeliver).is_server_error());
    }

    #[tokio::test]
    async fn test_chunked_delivery_is_processed() {
        let (dispatcher, store) = dispatcher();
        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        tokio::spawn(serve(tcp, dispatcher, std::future::pending()));

        let body = notification("/items/MLB7");
        let mut raw = format!(
            "POST /webhooks HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\n\
             Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            addr
        )
        .into_bytes();
        let (head, tail) = body.split_at(body.len() / 2);
        for chunk in [head, tail] {
            raw.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            raw.extend_from_slice(chunk);
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"0\r\n\r\n");

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(&raw).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        let stored = store
            .get_resource(&UserId::new("7"), ResourceKind::Catalog, "MLB7")
            .unwrap();
        assert!(stored.is_some());
    }
}
