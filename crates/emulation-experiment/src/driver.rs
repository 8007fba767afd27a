//! Observer actors bridging coordinator broadcasts to the runner.
//!
//! The coordinator broadcasts `HandlersReady` and `StatusUpdate` through the
//! broker; these actors subscribe and forward each message to an mpsc
//! channel so the runner can await them outside the actor system.

use acton_reactive::prelude::*;
use tokio::sync::mpsc;

use emulation_kernel::messages::{HandlersReady, StatusUpdate};

/// State for the status observer actor.
#[derive(Default, Clone)]
pub struct StatusObserverState {
    tx: Option<mpsc::Sender<StatusUpdate>>,
}

impl std::fmt::Debug for StatusObserverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusObserverState")
            .field("has_tx", &self.tx.is_some())
            .finish()
    }
}

/// Forwards every `StatusUpdate` broadcast to a channel.
pub struct StatusObserver {
    tx: mpsc::Sender<StatusUpdate>,
}

impl StatusObserver {
    pub fn new(tx: mpsc::Sender<StatusUpdate>) -> Self {
        Self { tx }
    }

    pub async fn spawn(self, runtime: &mut ActorRuntime) -> ActorHandle {
        let mut actor =
            runtime.new_actor_with_name::<StatusObserverState>("StatusObserver".to_string());
        actor.model.tx = Some(self.tx);

        actor.handle().subscribe::<StatusUpdate>().await;

        actor.act_on::<StatusUpdate>(|actor, context| {
            let update = context.message().clone();
            let tx = actor.model.tx.clone();
            Reply::pending(async move {
                if let Some(tx) = tx {
                    // receiver may already be gone after the run finished
                    let _ = tx.send(update).await;
                }
            })
        });

        actor.start().await
    }
}

/// Spawn an observer that forwards the `HandlersReady` broadcast.
pub async fn spawn_ready_observer(runtime: &mut ActorRuntime, tx: mpsc::Sender<HandlersReady>) {
    #[derive(Default, Clone, Debug)]
    struct State {
        tx: Option<mpsc::Sender<HandlersReady>>,
    }

    let mut actor = runtime.new_actor_with_name::<State>("HandlersReadyObserver".to_string());
    actor.model.tx = Some(tx);

    actor.handle().subscribe::<HandlersReady>().await;

    actor.act_on::<HandlersReady>(|actor, context| {
        let msg = context.message().clone();
        let tx = actor.model.tx.clone();
        Reply::pending(async move {
            if let Some(tx) = tx {
                let _ = tx.send(msg).await;
            }
        })
    });

    actor.start().await;
}
