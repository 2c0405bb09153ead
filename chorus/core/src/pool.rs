//! Endpoint Pool
//!
//! Admission control for a fixed fleet of LLM backends. Each backend carries
//! a small number of generation slots; callers lease one slot, run a single
//! generation, and release it. Capacity pressure shows up as waiting, never
//! as an error.
//!
//! # Architecture
//!
//! ```text
//!   lease(model, timeout)
//!        │
//!        ▼
//!   ┌──────────────┐   concurrent probes   ┌───────────┐
//!   │ candidates    │ ────────────────────▶ │ live set  │
//!   │ (model match) │                       └─────┬─────┘
//!   └──────────────┘                              │ preference order
//!                                                 ▼
//!                                        try_acquire per backend
//!                                                 │ none free
//!                                                 ▼
//!                                        sleep, re-probe, retry
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::ChatBackend;

/// Per-probe timeout; a backend that cannot answer this fast is treated as
/// down for the current lease attempt
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Static description of one pooled backend
#[derive(Clone, Debug)]
pub struct BackendDescriptor {
    /// Unique backend ID
    pub id: String,
    /// Model this backend serves
    pub model: String,
    /// Maximum concurrent generations
    pub total_slots: usize,
}

/// Point-in-time slot counts for one backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotSnapshot {
    /// Backend ID
    pub id: String,
    /// Model served
    pub model: String,
    /// Configured slot count
    pub total: usize,
    /// Currently free slots
    pub available: usize,
}

struct Endpoint {
    descriptor: BackendDescriptor,
    backend: Arc<dyn ChatBackend>,
    slots: Arc<Semaphore>,
}

/// RAII claim on one generation slot
///
/// The slot is returned when [`Lease::release`] is called or when the lease
/// is dropped; since `release` consumes the lease, a slot can never be
/// returned twice.
pub struct Lease {
    backend_id: String,
    backend: Arc<dyn ChatBackend>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// The backend this lease grants access to
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    /// ID of the leased backend
    #[must_use]
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Return the slot to the pool
    ///
    /// Dropping the lease has the same effect; this form just makes the
    /// release point explicit at call sites.
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("backend_id", &self.backend_id)
            .finish()
    }
}

/// Fixed fleet of backends with slot-based admission control
pub struct EndpointPool {
    endpoints: Vec<Endpoint>,
    /// Pause between acquisition passes while waiting for a free slot
    retry_interval: Duration,
}

impl EndpointPool {
    /// Create an empty pool
    #[must_use]
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            endpoints: Vec::new(),
            retry_interval,
        }
    }

    /// Register a backend; registration order is preference order
    pub fn register(&mut self, descriptor: BackendDescriptor, backend: Arc<dyn ChatBackend>) {
        tracing::info!(
            id = %descriptor.id,
            model = %descriptor.model,
            slots = descriptor.total_slots,
            "registered backend"
        );
        let slots = Arc::new(Semaphore::new(descriptor.total_slots));
        self.endpoints.push(Endpoint {
            descriptor,
            backend,
            slots,
        });
    }

    /// Number of registered backends
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether the pool has no backends
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Slot counts for every registered backend
    #[must_use]
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.endpoints
            .iter()
            .map(|ep| SlotSnapshot {
                id: ep.descriptor.id.clone(),
                model: ep.descriptor.model.clone(),
                total: ep.descriptor.total_slots,
                available: ep.slots.available_permits(),
            })
            .collect()
    }

    /// Lease one generation slot for the given model
    ///
    /// Probes all candidate backends concurrently, then walks the healthy
    /// ones in preference order trying to claim a slot. When every healthy
    /// backend is saturated, sleeps briefly, re-probes the surviving set, and
    /// retries until `timeout` elapses or `cancel` fires.
    ///
    /// Returns `None` when no slot could be claimed; lack of capacity is an
    /// expected condition, not an error.
    pub async fn lease(
        &self,
        model: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<Lease> {
        let candidates: Vec<&Endpoint> = self
            .endpoints
            .iter()
            .filter(|ep| ep.descriptor.model == model)
            .collect();
        if candidates.is_empty() {
            tracing::warn!(%model, "no backend serves requested model");
            return None;
        }

        let deadline = Instant::now() + timeout;
        let mut live = probe_pass(&candidates).await;

        loop {
            if live.is_empty() {
                tracing::debug!(%model, "no healthy backend for lease");
                return None;
            }

            for ep in &live {
                match ep.slots.clone().try_acquire_owned() {
                    Ok(permit) => {
                        tracing::debug!(
                            backend = %ep.descriptor.id,
                            available = ep.slots.available_permits(),
                            "leased generation slot"
                        );
                        return Some(Lease {
                            backend_id: ep.descriptor.id.clone(),
                            backend: ep.backend.clone(),
                            _permit: permit,
                        });
                    }
                    Err(TryAcquireError::NoPermits) => {}
                    Err(TryAcquireError::Closed) => {
                        // Semaphores are never closed; treat as saturated.
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(%model, "lease timed out waiting for a free slot");
                return None;
            }
            let pause = self.retry_interval.min(deadline - now);

            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(pause) => {}
            }

            // Only re-probe backends that answered last time; a backend that
            // went dark mid-wait drops out of the live set.
            live = probe_pass(&live).await;
        }
    }
}

/// Probe a set of endpoints concurrently, keeping those that answer in time
async fn probe_pass<'a>(endpoints: &[&'a Endpoint]) -> Vec<&'a Endpoint> {
    let probes = endpoints.iter().map(|ep| async move {
        tokio::time::timeout(PROBE_TIMEOUT, ep.backend.health_check())
            .await
            .unwrap_or(false)
    });
    let results = futures::future::join_all(probes).await;

    endpoints
        .iter()
        .zip(results)
        .filter_map(|(ep, healthy)| {
            if !healthy {
                tracing::debug!(backend = %ep.descriptor.id, "backend failed health probe");
            }
            healthy.then_some(*ep)
        })
        .collect()
}
