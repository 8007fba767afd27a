//! HandlerTransport: the coordinator's channel to per-vertex handlers.
//!
//! The channel is treated as unreliable. [`deliver_with_retry`] retries with
//! bounded exponential backoff plus jitter and surfaces exhaustion as
//! [`TransportError::Unreachable`], which the coordinator reports as a
//! distinct `HandlerUnreachable` condition.

use std::sync::Arc;

use acton_reactive::prelude::*;
use dashmap::DashMap;
use futures::future::BoxFuture;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::TransportError;
use crate::messages::HandlerCommand;

/// Delivers commands to the handler owning a vertex.
///
/// Implementations only report whether one delivery attempt succeeded;
/// retries belong to [`deliver_with_retry`].
pub trait HandlerTransport: Send + Sync {
    /// Record where a vertex's handler lives.
    fn register(&self, vertex: &str, handle: ActorHandle);

    /// One delivery attempt.
    fn send(&self, vertex: &str, command: HandlerCommand)
    -> BoxFuture<'_, Result<(), TransportError>>;
}

/// In-process transport over actor handles.
#[derive(Debug, Default, Clone)]
pub struct ActorTransport {
    routes: Arc<DashMap<String, ActorHandle>>,
}

impl ActorTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routes(&self) -> usize {
        self.routes.len()
    }
}

impl HandlerTransport for ActorTransport {
    fn register(&self, vertex: &str, handle: ActorHandle) {
        self.routes.insert(vertex.to_string(), handle);
    }

    fn send(
        &self,
        vertex: &str,
        command: HandlerCommand,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let route = self.routes.get(vertex).map(|h| h.value().clone());
        let vertex = vertex.to_string();
        Box::pin(async move {
            let Some(handle) = route else {
                return Err(TransportError::NoRoute(vertex));
            };
            handle.send(command).await;
            Ok(())
        })
    }
}

/// Deliver `command`, retrying transient failures per `policy`.
pub async fn deliver_with_retry(
    transport: &dyn HandlerTransport,
    policy: &RetryPolicy,
    vertex: &str,
    command: HandlerCommand,
) -> Result<(), TransportError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match transport.send(vertex, command.clone()).await {
            Ok(()) => {
                debug!(vertex = %vertex, command = command.label(), attempt, "Command delivered");
                return Ok(());
            }
            Err(error) => error,
        };

        if attempt >= max_attempts {
            warn!(
                vertex = %vertex,
                command = command.label(),
                attempts = attempt,
                error = %error,
                "Handler unreachable, giving up"
            );
            return Err(TransportError::Unreachable {
                vertex: vertex.to_string(),
                attempts: attempt,
                reason: error.to_string(),
            });
        }

        let jitter = if policy.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=policy.jitter_ms)
        } else {
            0
        };
        let wait = policy.backoff(attempt) + std::time::Duration::from_millis(jitter);
        warn!(
            vertex = %vertex,
            command = command.label(),
            attempt,
            wait_ms = wait.as_millis() as u64,
            error = %error,
            "Delivery failed, retrying"
        );
        tokio::time::sleep(wait).await;
    }
}
