//! Two-phase cache hydration.
//!
//! On startup an application first renders from cache, then refreshes from
//! the network. [`Hydrator::run`] drives that:
//!
//! 1. **LOAD_CACHE**: cache lookups ignore TTL; every call answered from cache
//!    is remembered in `cached_calls_done`.
//! 2. **HYDRATE**: the live-data loader is started without being awaited;
//!    every live answer (or cache hit) whose signature was remembered in
//!    phase 1 bumps `hydrated_calls_done_amount`.
//!
//! Observers compare the counter against `cached_calls_done.len()` to know
//! when everything shown from cache has been refreshed.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

/// Current hydration phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HydrationMode {
    /// Answering from cache regardless of age.
    LoadCache,
    /// Refreshing from the network.
    Hydrate,
}

/// Observable hydration state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HydrationState {
    /// Current phase.
    pub mode: HydrationMode,
    /// Untruncated signatures (`namespace/event(args)`) answered from cache
    /// in LOAD_CACHE.
    pub cached_calls_done: Vec<String>,
    /// Calls from `cached_calls_done` that completed during HYDRATE.
    pub hydrated_calls_done_amount: usize,
}

impl HydrationState {
    fn loading() -> Self {
        Self {
            mode: HydrationMode::LoadCache,
            cached_calls_done: Vec::new(),
            hydrated_calls_done_amount: 0,
        }
    }

    /// Whether every call served from cache has since been refreshed.
    pub fn is_complete(&self) -> bool {
        self.mode == HydrationMode::Hydrate
            && self.hydrated_calls_done_amount >= self.cached_calls_done.len()
    }
}

/// Handle to the hydration state machine. Clones share state.
#[derive(Debug, Clone)]
pub struct Hydrator {
    state: Arc<watch::Sender<Option<HydrationState>>>,
}

impl Default for Hydrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Hydrator {
    /// A hydrator that has never run.
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    /// Snapshot of the state; `None` before the first run.
    pub fn state(&self) -> Option<HydrationState> {
        self.state.borrow().clone()
    }

    /// Current phase, if a run has started.
    pub fn mode(&self) -> Option<HydrationMode> {
        self.state.borrow().as_ref().map(|s| s.mode)
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<HydrationState>> {
        self.state.subscribe()
    }

    /// Run both phases.
    ///
    /// Awaits `load_cached` under LOAD_CACHE, switches to HYDRATE with the
    /// counter reset, then calls `load_real` and spawns its future. Returns
    /// once the live loader has been started, not when it finishes.
    pub async fn run<C, CFut, R, RFut>(&self, load_cached: C, load_real: R)
    where
        C: FnOnce() -> CFut,
        CFut: Future<Output = ()>,
        R: FnOnce() -> RFut,
        RFut: Future<Output = ()> + Send + 'static,
    {
        self.state.send_replace(Some(HydrationState::loading()));
        log::debug!("[Hydrator] Loading cache...");
        load_cached().await;

        self.state.send_modify(|state| {
            let state = state.get_or_insert_with(HydrationState::loading);
            state.mode = HydrationMode::Hydrate;
            state.hydrated_calls_done_amount = 0;
        });
        if let Some(state) = self.state() {
            log::debug!(
                "[Hydrator] Hydrating {} cached calls...",
                state.cached_calls_done.len()
            );
        }

        tokio::spawn(load_real());
    }

    /// A call was answered from cache.
    pub(crate) fn record_cache_hit(&self, signature: &str) {
        self.state.send_if_modified(|state| match state {
            Some(state) if state.mode == HydrationMode::LoadCache => {
                if state.cached_calls_done.iter().any(|s| s == signature) {
                    return false;
                }
                state.cached_calls_done.push(signature.to_string());
                true
            }
            Some(state) => Self::count_hydrated(state, signature),
            None => false,
        });
    }

    /// A call was answered by the server.
    pub(crate) fn record_live_result(&self, signature: &str) {
        self.state.send_if_modified(|state| match state {
            Some(state) if state.mode == HydrationMode::Hydrate => {
                Self::count_hydrated(state, signature)
            }
            _ => false,
        });
    }

    fn count_hydrated(state: &mut HydrationState, signature: &str) -> bool {
        if state.cached_calls_done.iter().any(|s| s == signature) {
            state.hydrated_calls_done_amount += 1;
            true
        } else {
            false
        }
    }
}
