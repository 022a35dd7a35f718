//! REST configuration of the witness policy.
//!
//! `POST /policy` validates and stores a new policy; `GET /policy` returns
//! the stored source text. Policy changes reach the evaluator on the next
//! cache refresh.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tracing::{debug, warn};

use super::parser;
use super::store::{PolicyStore, PolicyStoreError};

/// Endpoint path for policy configuration.
pub const ENDPOINT: &str = "/policy";

/// Router exposing the policy endpoints; register with the node's HTTP
/// server.
pub fn router(store: Arc<dyn PolicyStore>) -> Router {
    Router::new()
        .route(ENDPOINT, get(get_policy).post(update_policy))
        .with_state(store)
}

async fn update_policy(State(store): State<Arc<dyn PolicyStore>>, body: String) -> StatusCode {
    if let Err(e) = parser::parse(&body) {
        warn!(error = %e, "invalid witness policy");
        return StatusCode::BAD_REQUEST;
    }

    if let Err(e) = store.put_policy(&body).await {
        warn!(error = %e, "error storing witness policy");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    debug!(policy = %body, "stored witness policy");

    StatusCode::OK
}

async fn get_policy(State(store): State<Arc<dyn PolicyStore>>) -> (StatusCode, String) {
    match store.get_policy().await {
        Ok(policy) => (StatusCode::OK, policy),
        Err(PolicyStoreError::NotFound) => (StatusCode::NOT_FOUND, String::new()),
        Err(e) => {
            warn!(error = %e, "error retrieving witness policy");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::super::store::MemoryPolicyStore;
    use super::*;

    fn post_policy(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(ENDPOINT)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn stores_valid_policy() {
        let store = Arc::new(MemoryPolicyStore::new());
        let app = router(Arc::clone(&store) as Arc<dyn PolicyStore>);

        let resp = app
            .oneshot(post_policy("OutOf(1,system) LogRequired"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        assert_eq!(
            store.get_policy().await.unwrap(),
            "OutOf(1,system) LogRequired"
        );
    }

    #[tokio::test]
    async fn rejects_invalid_policy() {
        let store = Arc::new(MemoryPolicyStore::new());
        let app = router(store);

        let resp = app.oneshot(post_policy("Test(a,b)")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_returns_stored_policy() {
        let store = Arc::new(MemoryPolicyStore::with_policy("OutOf(2,batch)"));
        let app = router(store as Arc<dyn PolicyStore>);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(ENDPOINT)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"OutOf(2,batch)");
    }

    #[tokio::test]
    async fn get_without_stored_policy_is_not_found() {
        let store = Arc::new(MemoryPolicyStore::new());
        let app = router(store as Arc<dyn PolicyStore>);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(ENDPOINT)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
