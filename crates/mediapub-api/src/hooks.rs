//! Hook event fan-out.
//!
//! Each [`HookKind`] has its own channel and a single listener task, so
//! events of one kind are applied in the order they were received. All
//! listeners stop when the dispatcher's cancellation token fires.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use mediapub_core::models::{HookEvent, HookKind};
use mediapub_core::AppError;

pub const DEFAULT_HOOK_BUFFER: usize = 256;

#[async_trait]
pub trait HookListener: Send + Sync + 'static {
    async fn on_hook(&self, event: HookEvent);
}

pub struct HookDispatcher {
    senders: HashMap<HookKind, mpsc::Sender<HookEvent>>,
    cancel: CancellationToken,
    listeners: Mutex<JoinSet<()>>,
}

impl HookDispatcher {
    /// Spawn one listener task per hook kind. Must be called inside a tokio runtime.
    pub fn start(listener: Arc<dyn HookListener>, buffer: usize) -> Self {
        let cancel = CancellationToken::new();
        let mut senders = HashMap::new();
        let mut listeners = JoinSet::new();

        for kind in HookKind::ALL {
            let (tx, rx) = mpsc::channel(buffer.max(1));
            senders.insert(kind, tx);
            listeners.spawn(listen(kind, rx, listener.clone(), cancel.clone()));
        }

        Self {
            senders,
            cancel,
            listeners: Mutex::new(listeners),
        }
    }

    /// Queue `event` for its listener. Waits while the listener's buffer is full.
    pub async fn dispatch(&self, event: HookEvent) -> Result<(), AppError> {
        let kind = event.kind;
        let sender = self
            .senders
            .get(&kind)
            .ok_or_else(|| AppError::Internal(format!("no listener for {kind} hooks")))?;
        sender
            .send(event)
            .await
            .map_err(|_| AppError::Internal(format!("{kind} hook listener stopped")))
    }

    /// Stop all listeners and wait for them to exit. Queued events are dropped.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut listeners = self.listeners.lock().await;
        while listeners.join_next().await.is_some() {}
        tracing::info!("Hook listeners stopped");
    }
}

async fn listen(
    kind: HookKind,
    mut rx: mpsc::Receiver<HookEvent>,
    listener: Arc<dyn HookListener>,
    cancel: CancellationToken,
) {
    tracing::debug!(hook = %kind, "Hook listener started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => listener.on_hook(event).await,
                None => break,
            },
        }
    }
}
