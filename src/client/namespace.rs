//! Typed proxy for one remote namespace.

use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;

use super::connection::ConnectionManager;
use super::{EventSchema, OngoingCalls, SessionProvider};
use crate::error::{CallError, ConnectionError, RemoteError, TransportError};
use crate::plugin::{CallContext, Pipeline};
use crate::signature::CallSignature;
use crate::transport::Connection;

/// Per-call switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Skip the cache for this call only.
    pub disable_cache: bool,
}

struct NamespaceInner {
    name: String,
    manager: ConnectionManager,
    pipeline: Pipeline,
    ongoing: OngoingCalls,
    session: Option<Arc<dyn SessionProvider>>,
    schema: Option<EventSchema>,
}

/// Handle to a remote namespace. Cheap to clone.
#[derive(Clone)]
pub struct Namespace {
    inner: Arc<NamespaceInner>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.inner.name)
            .field("manager", &self.inner.manager)
            .field("pipeline", &self.inner.pipeline)
            .finish_non_exhaustive()
    }
}

impl Namespace {
    pub(crate) fn new(
        name: &str,
        manager: ConnectionManager,
        pipeline: Pipeline,
        session: Option<Arc<dyn SessionProvider>>,
        schema: Option<EventSchema>,
    ) -> Self {
        Self {
            inner: Arc::new(NamespaceInner {
                name: name.to_string(),
                manager,
                pipeline,
                ongoing: OngoingCalls::new(),
                session,
                schema,
            }),
        }
    }

    /// Namespace name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The underlying connection, once created.
    pub fn socket(&self) -> Option<Arc<dyn Connection>> {
        self.inner.manager.connection()
    }

    /// Connect now instead of on the first call. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime the first time, since the
    /// transport spawns the connection task.
    pub fn connect(&self) {
        self.inner.manager.ensure_connected();
    }

    /// Close the connection; the next call reconnects.
    pub fn disconnect(&self) {
        self.inner.manager.reset();
    }

    /// Calls awaiting their acknowledgment.
    pub fn ongoing_calls(&self) -> &OngoingCalls {
        &self.inner.ongoing
    }

    /// Session provider, if configured.
    pub fn session(&self) -> Option<&Arc<dyn SessionProvider>> {
        self.inner.session.as_ref()
    }

    /// `None` until the first lifecycle notification, then whether the
    /// last one was a failure.
    pub fn is_offline(&self) -> Option<bool> {
        self.inner.manager.is_offline()
    }

    /// Watch the offline flag.
    pub fn offline_state(&self) -> watch::Receiver<Option<bool>> {
        self.inner.manager.offline_state()
    }

    /// Callable handle for `event`. Fails for events outside the schema.
    pub fn method(&self, event: &str) -> Result<RemoteMethod, CallError> {
        self.check_emit(event)?;
        Ok(RemoteMethod {
            namespace: self.clone(),
            event: event.to_string(),
        })
    }

    /// Call `event`. A trailing `{"disableCache": true}` argument is removed
    /// and bypasses the cache.
    pub async fn call(&self, event: &str, args: Vec<Value>) -> Result<Value, CallError> {
        self.call_with(event, args, CallOptions::default()).await
    }

    /// Call `event` and decode the result.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        event: &str,
        args: Vec<Value>,
    ) -> Result<T, CallError> {
        let value = self.call(event, args).await?;
        serde_json::from_value(value).map_err(|e| CallError::Decode(e.to_string()))
    }

    /// Call `event` with explicit options.
    ///
    /// # Panics
    ///
    /// Panics when polled outside a Tokio runtime and the connection does
    /// not exist yet. See [`Namespace::connect`].
    pub async fn call_with(
        &self,
        event: &str,
        mut args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value, CallError> {
        self.check_emit(event)?;
        let inner = &self.inner;
        let connection = inner.manager.ensure_connected();
        let started = Instant::now();

        let disable_cache = strip_disable_cache(&mut args) || options.disable_cache;
        let signature = CallSignature::new(&inner.name, event, &args);
        let mut context = CallContext::new(
            signature.clone(),
            inner.manager.is_offline() == Some(true),
            disable_cache,
        );

        if let Some(result) = inner
            .pipeline
            .before_emit(&inner.name, event, &args, &mut context)
            .await
        {
            return Ok(result);
        }

        let has_token = match &inner.session {
            Some(session) => session.get_token().await.is_some(),
            None => false,
        };
        log::debug!(
            "{} called {} at {}",
            signature,
            if has_token { "with token" } else { "without token" },
            chrono::Utc::now().to_rfc3339()
        );

        let pending = inner.ongoing.begin(signature.short());
        let data = connection
            .emit_with_ack(event, args.clone())
            .await
            .map_err(|e| self.transport_failure(event, e))?;
        drop(pending);

        if let Some(error) = RemoteError::from_payload(&data) {
            log::debug!("{} failed: {}", signature, error);
            return Err(CallError::Remote(error));
        }
        log::debug!(
            "{} responded in {}ms at {}",
            signature,
            started.elapsed().as_millis(),
            chrono::Utc::now().to_rfc3339()
        );

        Ok(inner
            .pipeline
            .after_emit(&inner.name, event, &args, data, &mut context)
            .await)
    }

    /// Route server pushes of `event` to `handler`, replacing any previous
    /// handler for the same event.
    ///
    /// May be called before the connection exists; the handler is attached
    /// when it is created.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Result<(), CallError>
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        if let Some(schema) = &self.inner.schema {
            if !schema.can_listen(event) {
                return Err(CallError::UnknownEvent(event.to_string()));
            }
        }
        self.inner.manager.subscribe(event, Arc::new(handler));
        Ok(())
    }

    /// Stop routing pushes of `event`. Returns whether a handler was set.
    pub fn unsubscribe(&self, event: &str) -> bool {
        self.inner.manager.unsubscribe(event)
    }

    fn check_emit(&self, event: &str) -> Result<(), CallError> {
        match &self.inner.schema {
            Some(schema) if !schema.can_emit(event) => {
                Err(CallError::UnknownEvent(event.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn transport_failure(&self, event: &str, error: TransportError) -> CallError {
        match error {
            TransportError::ConnectFailed(message) => CallError::Connection(
                ConnectionError::from_transport(&message, &self.inner.name, Some(event)),
            ),
            other => CallError::Transport(other),
        }
    }
}

/// Remove a trailing `{"disableCache": true}` argument.
fn strip_disable_cache(args: &mut Vec<Value>) -> bool {
    let marked = args
        .last()
        .and_then(Value::as_object)
        .and_then(|last| last.get("disableCache"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if marked {
        args.pop();
    }
    marked
}

/// A single remote event bound to its namespace.
#[derive(Debug, Clone)]
pub struct RemoteMethod {
    namespace: Namespace,
    event: String,
}

impl RemoteMethod {
    /// Event name.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Call the event.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value, CallError> {
        self.namespace.call(&self.event, args).await
    }

    /// Call the event and decode the result.
    pub async fn call_as<T: DeserializeOwned>(&self, args: Vec<Value>) -> Result<T, CallError> {
        self.namespace.call_as(&self.event, args).await
    }

    /// Call the event with explicit options.
    pub async fn call_with(
        &self,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value, CallError> {
        self.namespace.call_with(&self.event, args, options).await
    }
}
