//! anchorage-node: witness-network anchoring node
//!
//! Accepts activities on the authenticated HTTP ingress endpoint, forwards
//! them onto the AMQP bus, and serves the witness-policy configuration
//! endpoints. Shuts down cleanly on ctrl-c, draining in-flight requests.
//!
//! ## Configuration
//! - `config.yaml` in the working directory, or `ANCHORAGE_CONFIG`
//! - `ANCHORAGE__`-prefixed environment variables
//!   (e.g. `ANCHORAGE__AMQP__URI=amqp://broker:5672`)
//! - `ANCHORAGE_LOG` controls the log filter

use std::sync::Arc;

use tracing::{error, info, warn};

use anchorage::config::Config;
use anchorage::ingress::auth::{RejectAllVerifier, StaticTokenManager, TokenVerifier};
use anchorage::ingress::HttpSubscriber;
use anchorage::policy::store::MemoryPolicyStore;
use anchorage::policy::{resthandler, WitnessPolicy};
use anchorage::pubsub::{AmqpPubSub, PubSub};
use anchorage::store::expiry;
use anchorage::utils::bootstrap::init_tracing;

/// Topic onto which accepted ingress messages are published.
const ACTIVITIES_TOPIC: &str = "activities";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load().map_err(|e| {
        error!("failed to load configuration: {}", e);
        e
    })?;

    info!("starting anchorage node");

    // Connect retries exhausted is fatal at startup.
    let pubsub = Arc::new(AmqpPubSub::new(config.amqp.clone()).await?);

    let token_manager = StaticTokenManager::new(config.http.auth_tokens.clone());
    let tokens = TokenVerifier::new(
        &token_manager,
        &config.http.ingress.service_endpoint,
        "POST",
    )?;

    let ingress = Arc::new(HttpSubscriber::new(
        config.http.ingress.clone(),
        Arc::new(RejectAllVerifier),
        tokens,
    ));

    // Forward accepted ingress messages onto the bus; the HTTP response is
    // held until the publish settles.
    let mut inbox = ingress.subscribe()?;
    let bus = Arc::clone(&pubsub);
    tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            match bus.publish(ACTIVITIES_TOPIC, vec![msg.clone()]).await {
                Ok(()) => {
                    msg.ack();
                }
                Err(e) => {
                    warn!(message_id = %msg.uuid, error = %e, "failed to publish inbox message");
                    msg.nack();
                }
            }
        }
    });

    let policy_store = Arc::new(MemoryPolicyStore::new());

    // Fails fast when the stored policy cannot be loaded or parsed.
    let _policy = WitnessPolicy::new(
        Arc::clone(&policy_store) as Arc<dyn anchorage::policy::store::PolicyStore>,
        config.policy.cache_expiry,
    )
    .await?;

    let _expiry_service = expiry::Service::new(&expiry::TokioTaskManager, config.expiry.interval);

    let app = ingress
        .router()
        .merge(resthandler::router(policy_store));

    let listener = tokio::net::TcpListener::bind(&config.http.listen).await?;
    info!(listen = %config.http.listen, "HTTP server listening");

    let server_ingress = Arc::clone(&ingress);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            server_ingress.close().await;
        })
        .await?;

    pubsub.close().await?;

    info!("anchorage node stopped");

    Ok(())
}
