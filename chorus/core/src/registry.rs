//! Conversation Registry
//!
//! Routes inbound messages to per-conversation workers, creating them lazily
//! and retiring them opportunistically. The registry is an explicit object
//! with an explicit shutdown; nothing about the worker fleet lives in global
//! state.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::worker::{ChannelKey, ConversationWorker, InboundMessage, WorkerDeps};

/// Registry tuning
#[derive(Clone, Debug)]
pub struct RegistrySettings {
    /// Workers idle longer than this are retired on the next sweep
    pub idle_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Owner of all live conversation workers
pub struct ConversationRegistry {
    workers: DashMap<ChannelKey, Arc<ConversationWorker>>,
    deps: Arc<WorkerDeps>,
    cancel: CancellationToken,
    idle_timeout: Duration,
}

impl ConversationRegistry {
    /// Create a registry; workers spawn on first message per key
    #[must_use]
    pub fn new(deps: Arc<WorkerDeps>, settings: RegistrySettings) -> Self {
        Self {
            workers: DashMap::new(),
            deps,
            cancel: CancellationToken::new(),
            idle_timeout: settings.idle_timeout,
        }
    }

    /// Number of workers currently held (including any not yet swept)
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Route one message to its conversation
    ///
    /// Sweeps retired workers, finds or creates the worker for `key`, and
    /// queues the message. A worker that completed between lookup and enqueue
    /// is replaced once.
    pub fn dispatch(&self, key: &ChannelKey, message: InboundMessage) {
        let worker = self.get_or_create(key);
        if worker.enqueue(message.clone()) {
            return;
        }

        tracing::debug!(%key, "worker completed during dispatch, replacing");
        let replacement = self.replace(key);
        if !replacement.enqueue(message) {
            tracing::warn!(%key, "message dropped, replacement worker rejected it");
        }
    }

    /// Find the live worker for `key`, creating one if none exists or the
    /// existing one has completed
    pub fn get_or_create(&self, key: &ChannelKey) -> Arc<ConversationWorker> {
        self.sweep();

        match self.workers.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_complete() {
                    let worker = self.spawn_worker(key);
                    occupied.insert(worker.clone());
                    worker
                } else {
                    occupied.get().clone()
                }
            }
            Entry::Vacant(vacant) => {
                let worker = self.spawn_worker(key);
                vacant.insert(worker.clone());
                worker
            }
        }
    }

    fn replace(&self, key: &ChannelKey) -> Arc<ConversationWorker> {
        let worker = self.spawn_worker(key);
        self.workers.insert(key.clone(), worker.clone());
        worker
    }

    fn spawn_worker(&self, key: &ChannelKey) -> Arc<ConversationWorker> {
        tracing::info!(%key, "starting conversation worker");
        Arc::new(ConversationWorker::spawn(
            key.clone(),
            self.deps.clone(),
            self.cancel.child_token(),
        ))
    }

    /// Retire completed and long-idle workers
    ///
    /// Runs opportunistically on every dispatch, so no background janitor
    /// task is needed.
    fn sweep(&self) {
        let stale: Vec<ChannelKey> = self
            .workers
            .iter()
            .filter(|entry| {
                let worker = entry.value();
                worker.is_complete() || worker.last_updated().elapsed() > self.idle_timeout
            })
            .map(|entry| entry.key().clone())
            .collect();

        for key in stale {
            if let Some((_, worker)) = self.workers.remove(&key) {
                tracing::debug!(%key, "retiring conversation worker");
                // The worker persists its transcript on its own task.
                worker.stop();
            }
        }
    }

    /// Stop every worker and wait for their final persists
    pub async fn shutdown(&self) {
        tracing::info!(workers = self.workers.len(), "registry shutting down");
        self.cancel.cancel();

        let workers: Vec<Arc<ConversationWorker>> = self
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.workers.clear();

        for worker in workers {
            worker.join().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::store::{MemoryStore, TranscriptStore};
    use crate::test_utils::{make_pool, FakeBackend, NoTools};
    use crate::transcript::GenerationSettings;
    use crate::worker::{OutboundReply, WorkerSettings};

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        store: Arc<MemoryStore>,
        deps: Arc<WorkerDeps>,
        outbound: mpsc::UnboundedReceiver<OutboundReply>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(FakeBackend::healthy("fake"));
        let store = Arc::new(MemoryStore::new());
        let pool = make_pool(vec![("fake", "test-model", 2, backend)]);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let deps = Arc::new(WorkerDeps {
            pool,
            tools: Arc::new(NoTools),
            store: store.clone(),
            outbound: out_tx,
            settings: WorkerSettings::default(),
            generation: GenerationSettings {
                model: "test-model".to_string(),
                lease_timeout: Duration::from_millis(200),
            },
            system_prompt: "be brief".to_string(),
        });
        Fixture {
            store,
            deps,
            outbound: out_rx,
        }
    }

    fn msg(text: &str) -> InboundMessage {
        InboundMessage {
            sender: "alice".to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn workers_are_created_lazily_and_reused() {
        let fx = fixture();
        let registry = ConversationRegistry::new(fx.deps.clone(), RegistrySettings::default());
        assert_eq!(registry.active_workers(), 0);

        let first = registry.get_or_create(&ChannelKey::from("a"));
        let again = registry.get_or_create(&ChannelKey::from("a"));
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.active_workers(), 1);

        registry.get_or_create(&ChannelKey::from("b"));
        assert_eq!(registry.active_workers(), 2);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn completed_worker_is_replaced_on_next_message() {
        let mut fx = fixture();
        let registry = ConversationRegistry::new(fx.deps.clone(), RegistrySettings::default());

        let worker = registry.get_or_create(&ChannelKey::from("a"));
        worker.stop();
        worker.join().await;
        assert!(worker.is_complete());

        registry.dispatch(&ChannelKey::from("a"), msg("hello again"));
        let reply = timeout(WAIT, fx.outbound.recv()).await.unwrap().unwrap();
        assert_eq!(reply.channel, ChannelKey::from("a"));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn idle_workers_are_swept() {
        let fx = fixture();
        let registry = ConversationRegistry::new(
            fx.deps.clone(),
            RegistrySettings {
                idle_timeout: Duration::from_millis(50),
            },
        );

        registry.get_or_create(&ChannelKey::from("old"));
        tokio::time::sleep(Duration::from_millis(120)).await;

        // Next lookup sweeps the idle worker before creating the new one.
        registry.get_or_create(&ChannelKey::from("fresh"));
        assert_eq!(registry.active_workers(), 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn conversations_are_isolated() {
        let mut fx = fixture();
        let registry = ConversationRegistry::new(fx.deps.clone(), RegistrySettings::default());

        registry.dispatch(&ChannelKey::from("room-a"), msg("for a"));
        registry.dispatch(&ChannelKey::from("room-b"), msg("for b"));

        let mut channels = vec![
            timeout(WAIT, fx.outbound.recv()).await.unwrap().unwrap().channel,
            timeout(WAIT, fx.outbound.recv()).await.unwrap().unwrap().channel,
        ];
        channels.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(channels, vec![ChannelKey::from("room-a"), ChannelKey::from("room-b")]);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_persists_every_conversation() {
        let mut fx = fixture();
        let registry = ConversationRegistry::new(fx.deps.clone(), RegistrySettings::default());

        registry.dispatch(&ChannelKey::from("a"), msg("one"));
        registry.dispatch(&ChannelKey::from("b"), msg("two"));
        timeout(WAIT, fx.outbound.recv()).await.unwrap().unwrap();
        timeout(WAIT, fx.outbound.recv()).await.unwrap().unwrap();

        registry.shutdown().await;

        assert!(fx.store.get("a").await.unwrap().is_some());
        assert!(fx.store.get("b").await.unwrap().is_some());
        assert_eq!(registry.active_workers(), 0);
    }
}
