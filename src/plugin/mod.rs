//! Hook pipeline around every remote call.
//!
//! A [`Plugin`] implements only the hooks it cares about; every hook has a
//! no-op default. The [`Pipeline`] runs plugins strictly in registration
//! order:
//!
//! ```text
//! call ──▶ before_emit(p1) ──▶ before_emit(p2) ──▶ … ──▶ transport
//!              │ ShortCircuit(v)                           │
//!              ▼                                           ▼
//!           return v              after_emit(p1) ──▶ after_emit(p2) ──▶ caller
//! ```
//!
//! The first plugin that short-circuits ends the chain: later `before_emit`
//! hooks do not run, no remote call happens, and no `after_emit` hook runs.

pub mod cache;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::client::SocketClient;
use crate::error::ConnectionError;
use crate::signature::CallSignature;

pub use cache::{CacheOptions, CachePlugin, Ttl, CACHE_PLUGIN_NAME};

/// Per-call state shared between plugins, discarded when the call completes.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Signature of the call, computed once at call start.
    pub signature: CallSignature,
    /// Whether the namespace connection was flagged offline at call start.
    pub is_offline: bool,
    /// Whether the caller asked to bypass the cache for this call.
    pub disable_cache: bool,
    /// Cache key, set by the cache plugin when it consulted the cache.
    pub cache_key: Option<String>,
}

impl CallContext {
    /// Fresh context for one call.
    pub fn new(signature: CallSignature, is_offline: bool, disable_cache: bool) -> Self {
        Self {
            signature,
            is_offline,
            disable_cache,
            cache_key: None,
        }
    }
}

/// Decision of a `before_emit` hook.
#[derive(Debug, Clone, PartialEq)]
pub enum BeforeEmit {
    /// Let the call proceed to the next plugin (and eventually the transport).
    Continue,
    /// Answer the call with this value without contacting the transport.
    ShortCircuit(Value),
}

/// A participant in the call pipeline.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable plugin name.
    fn name(&self) -> &str;

    /// Called once per namespace the plugin is installed on, at setup time.
    fn install(&self, _client: &SocketClient) {}

    /// Runs before the remote call.
    async fn before_emit(
        &self,
        _namespace: &str,
        _event: &str,
        _args: &[Value],
        _context: &mut CallContext,
    ) -> BeforeEmit {
        BeforeEmit::Continue
    }

    /// Runs after a successful remote call; returns the (possibly
    /// transformed) result handed to the next plugin.
    async fn after_emit(
        &self,
        _namespace: &str,
        _event: &str,
        _args: &[Value],
        result: Value,
        _context: &mut CallContext,
    ) -> Value {
        result
    }

    /// The namespace connection was established.
    fn on_connect(&self, _namespace: &str) {}

    /// The namespace connection failed.
    fn on_connect_error(&self, _error: &ConnectionError) {}
}

/// Ordered list of plugins.
#[derive(Clone, Default)]
pub struct Pipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name().to_string()))
            .finish()
    }
}

impl Pipeline {
    /// Pipeline running `plugins` in the given order.
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    /// Installed plugins, in order.
    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Plugins taking part in this call. The cache plugin sits out calls
    /// that asked to bypass the cache.
    fn participants<'a>(
        &'a self,
        context: &CallContext,
    ) -> impl Iterator<Item = &'a Arc<dyn Plugin>> + 'a {
        let skip_cache = context.disable_cache;
        self.plugins
            .iter()
            .filter(move |plugin| !(skip_cache && plugin.name() == CACHE_PLUGIN_NAME))
    }

    /// Run `before_emit` hooks. Returns the short-circuit value, if any.
    pub async fn before_emit(
        &self,
        namespace: &str,
        event: &str,
        args: &[Value],
        context: &mut CallContext,
    ) -> Option<Value> {
        let participants: Vec<_> = self.participants(context).cloned().collect();
        for plugin in participants {
            if let BeforeEmit::ShortCircuit(result) =
                plugin.before_emit(namespace, event, args, context).await
            {
                log::debug!(
                    "[Pipeline] {} answered by plugin {}",
                    context.signature,
                    plugin.name()
                );
                return Some(result);
            }
        }
        None
    }

    /// Run `after_emit` hooks, threading the result through each.
    pub async fn after_emit(
        &self,
        namespace: &str,
        event: &str,
        args: &[Value],
        result: Value,
        context: &mut CallContext,
    ) -> Value {
        let participants: Vec<_> = self.participants(context).cloned().collect();
        let mut result = result;
        for plugin in participants {
            result = plugin
                .after_emit(namespace, event, args, result, context)
                .await;
        }
        result
    }

    /// Notify every plugin of a successful connect.
    pub fn on_connect(&self, namespace: &str) {
        for plugin in &self.plugins {
            plugin.on_connect(namespace);
        }
    }

    /// Notify every plugin of a connect failure.
    pub fn on_connect_error(&self, error: &ConnectionError) {
        for plugin in &self.plugins {
            plugin.on_connect_error(error);
        }
    }
}
