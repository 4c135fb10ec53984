//! TTL response cache.
//!
//! Before a call the plugin looks the call up by `namespace/event [args]`.
//! A usable entry answers the call directly. After a successful live call
//! the result is stored with the configured TTL.
//!
//! TTL is ignored (any entry is usable, however old) while the connection is
//! offline and while a [`Hydrator`] is in its LOAD_CACHE phase.

pub mod hydrator;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{BeforeEmit, CallContext, Plugin};
use crate::client::SocketClient;
use crate::signature::{cache_key, untruncated_signature};

pub use hydrator::{HydrationMode, HydrationState, Hydrator};
pub use storage::{CacheStorage, FileStorage, MemoryStorage, StorageState, StorageValue};

/// Name the pipeline uses to skip this plugin for `disable_cache` calls.
pub const CACHE_PLUGIN_NAME: &str = "cache";

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Per-call TTL function.
pub type TtlFn = Arc<dyn Fn(&str, &[Value]) -> Duration + Send + Sync>;

/// Predicate excluding events from caching.
pub type DisableFor = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// How long entries stay fresh.
#[derive(Clone)]
pub enum Ttl {
    /// Same lifetime for every call.
    Fixed(Duration),
    /// Lifetime computed from the event name and arguments.
    PerCall(TtlFn),
}

impl Ttl {
    /// TTL computed per call.
    pub fn per_call<F>(f: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Duration + Send + Sync + 'static,
    {
        Self::PerCall(Arc::new(f))
    }

    /// TTL for one call.
    pub fn resolve(&self, event: &str, args: &[Value]) -> Duration {
        match self {
            Self::Fixed(ttl) => *ttl,
            Self::PerCall(f) => f(event, args),
        }
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self::Fixed(DEFAULT_TTL)
    }
}

impl std::fmt::Debug for Ttl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(ttl) => f.debug_tuple("Fixed").field(ttl).finish(),
            Self::PerCall(_) => f.write_str("PerCall(..)"),
        }
    }
}

/// Cache configuration.
#[derive(Clone)]
pub struct CacheOptions {
    /// Backing store.
    pub storage: Arc<dyn CacheStorage>,
    /// Entry lifetime.
    pub ttl: Ttl,
    /// Events that must never be cached.
    pub disable_for: Option<DisableFor>,
}

impl CacheOptions {
    /// Options with the default TTL.
    pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
        Self {
            storage,
            ttl: Ttl::default(),
            disable_for: None,
        }
    }

    /// Set the TTL.
    pub fn ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Never cache events matching `predicate`.
    pub fn disable_for<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.disable_for = Some(Arc::new(predicate));
        self
    }
}

impl std::fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheOptions")
            .field("ttl", &self.ttl)
            .field("disable_for", &self.disable_for.is_some())
            .finish_non_exhaustive()
    }
}

/// Cache participant of the call pipeline.
#[derive(Debug, Clone)]
pub struct CachePlugin {
    options: Option<CacheOptions>,
    hydrator: Hydrator,
}

impl CachePlugin {
    /// Cache backed by `options`.
    pub fn new(options: CacheOptions) -> Self {
        Self {
            options: Some(options),
            hydrator: Hydrator::new(),
        }
    }

    /// A plugin with no store; every call passes straight through.
    pub fn disabled() -> Self {
        Self {
            options: None,
            hydrator: Hydrator::new(),
        }
    }

    /// Handle to this cache's hydration state machine.
    pub fn hydrator(&self) -> Hydrator {
        self.hydrator.clone()
    }

    fn ignores_ttl(&self, context: &CallContext) -> bool {
        context.is_offline || self.hydrator.mode() == Some(HydrationMode::LoadCache)
    }
}

#[async_trait]
impl Plugin for CachePlugin {
    fn name(&self) -> &str {
        CACHE_PLUGIN_NAME
    }

    fn install(&self, client: &SocketClient) {
        client.attach_hydrator(self.hydrator());
    }

    async fn before_emit(
        &self,
        namespace: &str,
        event: &str,
        args: &[Value],
        context: &mut CallContext,
    ) -> BeforeEmit {
        let Some(cache) = &self.options else {
            return BeforeEmit::Continue;
        };
        if cache.disable_for.as_ref().is_some_and(|skip| skip(event)) {
            return BeforeEmit::Continue;
        }

        let key = cache_key(namespace, event, args);
        context.cache_key = Some(key.clone());

        let ttl = if self.ignores_ttl(context) {
            None
        } else {
            Some(cache.ttl.resolve(event, args))
        };

        let entry = match cache.storage.get(&key, ttl).await {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("[CachePlugin] Lookup of {} failed: {}", key, e);
                None
            }
        };

        match entry {
            Some(value) if value.is_hit() => {
                log::debug!("[CachePlugin] {} served from cache", context.signature);
                self.hydrator
                    .record_cache_hit(&untruncated_signature(namespace, event, args));
                BeforeEmit::ShortCircuit(value.data)
            }
            _ => BeforeEmit::Continue,
        }
    }

    async fn after_emit(
        &self,
        namespace: &str,
        event: &str,
        args: &[Value],
        result: Value,
        context: &mut CallContext,
    ) -> Value {
        let (Some(cache), Some(key)) = (&self.options, context.cache_key.as_deref()) else {
            return result;
        };

        let ttl = cache.ttl.resolve(event, args);
        if let Err(e) = cache.storage.set(key, result.clone(), ttl).await {
            log::warn!("[CachePlugin] Storing {} failed: {}", key, e);
        }
        self.hydrator
            .record_live_result(&untruncated_signature(namespace, event, args));
        result
    }
}
