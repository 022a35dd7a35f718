use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use super::auth::{AuthError, StaticTokenManager, Verification};
use super::*;

/// Signature verifier with a scripted outcome.
struct MockVerifier {
    outcome: MockOutcome,
}

enum MockOutcome {
    Verified(String),
    Unverified,
    Error,
}

#[async_trait::async_trait]
impl SignatureVerifier for MockVerifier {
    async fn verify_request(
        &self,
        _parts: &axum::http::request::Parts,
        _body: &[u8],
    ) -> Result<Verification, AuthError> {
        match &self.outcome {
            MockOutcome::Verified(actor) => Ok(Verification::Verified {
                actor_iri: actor.clone(),
            }),
            MockOutcome::Unverified => Ok(Verification::Unverified),
            MockOutcome::Error => Err(AuthError("injected verifier error".to_string())),
        }
    }
}

fn subscriber_with(outcome: MockOutcome, tokens: Vec<String>) -> HttpSubscriber {
    let manager = StaticTokenManager::new(tokens);
    let token_verifier = TokenVerifier::new(&manager, "/inbox", "POST").unwrap();

    HttpSubscriber::new(
        Config::default(),
        Arc::new(MockVerifier { outcome }),
        token_verifier,
    )
}

fn post_inbox(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/inbox")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Consume every queued message with the given disposition.
fn consume_all(mut rx: tokio::sync::mpsc::Receiver<Message>, ack: bool) {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ack {
                msg.ack();
            } else {
                msg.nack();
            }
        }
    });
}

#[tokio::test]
async fn no_auth_required_ack_responds_ok() {
    let sub = subscriber_with(MockOutcome::Unverified, vec![]);
    consume_all(sub.subscribe().unwrap(), true);

    let resp = sub.router().oneshot(post_inbox("activity")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn nack_responds_internal_server_error() {
    let sub = subscriber_with(MockOutcome::Unverified, vec![]);
    consume_all(sub.subscribe().unwrap(), false);

    let resp = sub.router().oneshot(post_inbox("activity")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn invalid_signature_responds_unauthorized() {
    let sub = subscriber_with(MockOutcome::Unverified, vec!["s3cr3t".to_string()]);

    let resp = sub.router().oneshot(post_inbox("activity")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signature_error_responds_internal_server_error() {
    let sub = subscriber_with(MockOutcome::Error, vec!["s3cr3t".to_string()]);

    let resp = sub.router().oneshot(post_inbox("activity")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn verified_signature_records_actor_iri() {
    let sub = subscriber_with(
        MockOutcome::Verified("https://w.example/svc".to_string()),
        vec!["s3cr3t".to_string()],
    );

    let mut rx = sub.subscribe().unwrap();
    let reader = tokio::spawn(async move {
        let msg = rx.recv().await.expect("message");
        let actor = msg.metadata.get(ACTOR_IRI_KEY).cloned();
        msg.ack();
        (msg.payload.clone(), actor)
    });

    let resp = sub.router().oneshot(post_inbox("activity")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let (payload, actor) = reader.await.unwrap();
    assert_eq!(payload, b"activity");
    assert_eq!(actor.as_deref(), Some("https://w.example/svc"));
}

#[tokio::test]
async fn matching_bearer_token_skips_signature_verification() {
    // The verifier would error; the token must short-circuit it.
    let sub = subscriber_with(MockOutcome::Error, vec!["s3cr3t".to_string()]);
    consume_all(sub.subscribe().unwrap(), true);

    let req = Request::builder()
        .method("POST")
        .uri("/inbox")
        .header("Authorization", "Bearer s3cr3t")
        .body(Body::from("activity"))
        .unwrap();

    let resp = sub.router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn stopped_service_responds_service_unavailable() {
    let sub = subscriber_with(MockOutcome::Unverified, vec![]);
    sub.close().await;

    let resp = sub.router().oneshot(post_inbox("activity")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn full_buffer_rejects_publish() {
    let manager = StaticTokenManager::new(vec![]);
    let token_verifier = TokenVerifier::new(&manager, "/inbox", "POST").unwrap();

    let sub = HttpSubscriber::new(
        Config {
            buffer_size: 1,
            ..Default::default()
        },
        Arc::new(MockVerifier {
            outcome: MockOutcome::Unverified,
        }),
        token_verifier,
    );

    // Nobody consumes: the subscriber channel, the shovel, and the publish
    // buffer fill up in turn, then publishes are rejected.
    let mut rejected = false;
    for _ in 0..10 {
        if sub.inner.publish(Message::new("p")).is_err() {
            rejected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(rejected, "expected a BufferFull rejection");
}

#[tokio::test]
async fn close_drains_shovel_before_closing_channel() {
    let sub = subscriber_with(MockOutcome::Unverified, vec![]);
    let mut rx = sub.subscribe().unwrap();

    let router = sub.router();
    let pending = tokio::spawn(async move { router.oneshot(post_inbox("activity")).await });

    // The message reaches the subscriber channel but is never acked.
    let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");

    sub.close().await;

    // The held response resolves as unavailable and the channel closes
    // without a send-on-closed panic.
    let resp = pending.await.unwrap().unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(rx.recv().await.is_none());

    drop(msg);
}

#[tokio::test]
async fn subscribe_is_single_consumer() {
    let sub = subscriber_with(MockOutcome::Unverified, vec![]);

    assert!(sub.subscribe().is_ok());
    assert!(matches!(
        sub.subscribe(),
        Err(IngressError::AlreadySubscribed)
    ));
}
