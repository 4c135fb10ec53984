//! Client side: one [`SocketClient`] per server, one [`Namespace`] per
//! remote service.
//!
//! ```ignore
//! let cache = CachePlugin::new(CacheOptions::new(Arc::new(MemoryStorage::new())));
//! let client = SocketClient::new("http://localhost:3000");
//! let user = client.add_namespace(
//!     "/user",
//!     NamespaceOptions::new().plugin(cache.clone()),
//! );
//!
//! let greeting: String = user.call_as("login", vec![json!("alice")]).await?;
//! user.subscribe("showReminder", |args| println!("{args:?}"))?;
//! ```

mod connection;
pub mod namespace;
mod ongoing;

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::FutureExt;

use crate::error::ConnectionError;
use crate::plugin::cache::Hydrator;
use crate::plugin::{Pipeline, Plugin};
use crate::transport::{AuthCallback, ConnectOptions, Credentials, Transport, WsTransport};
use connection::{ConnectionManager, LifecycleObservers};

pub use namespace::{CallOptions, Namespace, RemoteMethod};
pub use ongoing::OngoingCalls;

/// Callback for connect failures.
pub type ConnectErrorCallback = Arc<dyn Fn(&ConnectionError) + Send + Sync>;

/// Callback for successful connects; receives the namespace name.
pub type ConnectedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Source of the handshake token.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Current token, if logged in.
    async fn get_token(&self) -> Option<String>;

    /// Forget the session.
    async fn clear_session(&self) {}

    /// Whether a session exists.
    async fn session_exists(&self) -> bool {
        self.get_token().await.is_some()
    }
}

/// Session with a fixed token.
#[derive(Debug, Clone, Default)]
pub struct StaticSession {
    token: Option<String>,
}

impl StaticSession {
    /// Session holding `token`.
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn get_token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Events a namespace may emit and listen to.
///
/// Without a schema every event name is accepted.
#[derive(Debug, Clone, Default)]
pub struct EventSchema {
    emits: BTreeSet<String>,
    listens: BTreeSet<String>,
}

impl EventSchema {
    /// Empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare callable events.
    pub fn emits<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.emits.extend(events.into_iter().map(Into::into));
        self
    }

    /// Declare server-pushed events.
    pub fn listens<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.listens.extend(events.into_iter().map(Into::into));
        self
    }

    /// Whether `event` may be called.
    pub fn can_emit(&self, event: &str) -> bool {
        self.emits.contains(event)
    }

    /// Whether `event` may be subscribed to.
    pub fn can_listen(&self, event: &str) -> bool {
        self.listens.contains(event)
    }
}

/// Per-namespace configuration.
#[derive(Clone, Default)]
pub struct NamespaceOptions {
    /// Plugins, in pipeline order.
    pub plugins: Vec<Arc<dyn Plugin>>,
    /// Token source for the handshake.
    pub session: Option<Arc<dyn SessionProvider>>,
    /// Overrides the client's connect-failure callback.
    pub on_connect_error: Option<ConnectErrorCallback>,
    /// Overrides the client's connected callback.
    pub on_connected: Option<ConnectedCallback>,
    /// Declared events.
    pub schema: Option<EventSchema>,
}

impl std::fmt::Debug for NamespaceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceOptions")
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            )
            .field("session", &self.session.is_some())
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl NamespaceOptions {
    /// Default options: no plugins, no session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin.
    pub fn plugin<P: Plugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Set the session provider.
    pub fn session<S: SessionProvider + 'static>(mut self, session: S) -> Self {
        self.session = Some(Arc::new(session));
        self
    }

    /// Set the connect-failure callback.
    pub fn on_connect_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ConnectionError) + Send + Sync + 'static,
    {
        self.on_connect_error = Some(Arc::new(callback));
        self
    }

    /// Set the connected callback.
    pub fn on_connected<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_connected = Some(Arc::new(callback));
        self
    }

    /// Restrict the namespace to declared events.
    pub fn schema(mut self, schema: EventSchema) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// Entry point: connects namespaces of one server.
pub struct SocketClient {
    root_url: String,
    transport: Arc<dyn Transport>,
    connect_options: ConnectOptions,
    on_connect_error: ConnectErrorCallback,
    on_connected: ConnectedCallback,
    hydrator: RwLock<Option<Hydrator>>,
}

impl std::fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketClient")
            .field("root_url", &self.root_url)
            .field("connect_options", &self.connect_options)
            .finish_non_exhaustive()
    }
}

impl SocketClient {
    /// Client for the server at `root_url`, over WebSocket.
    pub fn new(root_url: impl Into<String>) -> Self {
        Self::with_transport(root_url, Arc::new(WsTransport::new()))
    }

    /// Client using a custom transport.
    pub fn with_transport(root_url: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            root_url: root_url.into(),
            transport,
            connect_options: ConnectOptions::default(),
            on_connect_error: Arc::new(|e| log::error!("{}", e)),
            on_connected: Arc::new(|namespace| log::info!("{}: connected", namespace)),
            hydrator: RwLock::new(None),
        }
    }

    /// Base connect options for every namespace added afterwards.
    pub fn connect_options(mut self, options: ConnectOptions) -> Self {
        self.connect_options = options;
        self
    }

    /// Default connect-failure callback.
    pub fn on_connect_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ConnectionError) + Send + Sync + 'static,
    {
        self.on_connect_error = Arc::new(callback);
        self
    }

    /// Default connected callback.
    pub fn on_connected<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_connected = Arc::new(callback);
        self
    }

    /// Server root URL.
    pub fn root_url(&self) -> &str {
        &self.root_url
    }

    /// Hydrator of the cache plugin installed on this client, if any.
    pub fn hydrator(&self) -> Option<Hydrator> {
        self.hydrator.read().expect("hydrator lock poisoned").clone()
    }

    pub(crate) fn attach_hydrator(&self, hydrator: Hydrator) {
        *self.hydrator.write().expect("hydrator lock poisoned") = Some(hydrator);
    }

    /// Add a namespace. No connection is made until the first call or an
    /// explicit [`Namespace::connect`].
    pub fn add_namespace(&self, name: &str, options: NamespaceOptions) -> Namespace {
        for plugin in &options.plugins {
            plugin.install(self);
        }

        let mut connect_options = self.connect_options.clone();
        connect_options
            .extra_headers
            .push(("X-Namespace".to_string(), name.to_string()));
        connect_options.auth = Some(auth_callback(options.session.clone()));

        let pipeline = Pipeline::new(options.plugins);
        let observers = LifecycleObservers {
            pipeline: pipeline.clone(),
            on_connect_error: options
                .on_connect_error
                .unwrap_or_else(|| Arc::clone(&self.on_connect_error)),
            on_connected: options
                .on_connected
                .unwrap_or_else(|| Arc::clone(&self.on_connected)),
        };
        let manager = ConnectionManager::new(
            name,
            namespace_url(&self.root_url, name),
            Arc::clone(&self.transport),
            connect_options,
            observers,
        );

        log::debug!("[SocketClient] Added namespace {}", name);
        Namespace::new(name, manager, pipeline, options.session, options.schema)
    }
}

/// Handshake credentials: `{"token": ...}` when a token exists, else `{}`.
fn auth_callback(session: Option<Arc<dyn SessionProvider>>) -> AuthCallback {
    Arc::new(move || {
        let session = session.clone();
        async move {
            let mut credentials = Credentials::new();
            if let Some(session) = session {
                if let Some(token) = session.get_token().await {
                    credentials.insert("token".to_string(), token.into());
                }
            }
            credentials
        }
        .boxed()
    })
}

fn namespace_url(root_url: &str, name: &str) -> String {
    format!(
        "{}/{}",
        root_url.trim_end_matches('/'),
        name.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_url_joins_with_single_slash() {
        assert_eq!(namespace_url("http://localhost:3000", "/user"), "http://localhost:3000/user");
        assert_eq!(namespace_url("http://test.com/", "test-namespace"), "http://test.com/test-namespace");
    }

    #[tokio::test]
    async fn test_auth_callback_credentials() {
        let anonymous = auth_callback(None)().await;
        assert!(anonymous.is_empty());

        let no_token = auth_callback(Some(Arc::new(StaticSession::new(None))))().await;
        assert!(no_token.is_empty());

        let with_token =
            auth_callback(Some(Arc::new(StaticSession::new(Some("t".into())))))().await;
        assert_eq!(with_token.get("token"), Some(&serde_json::json!("t")));
    }

    #[test]
    fn test_schema_membership() {
        let schema = EventSchema::new().emits(["login"]).listens(["showReminder"]);
        assert!(schema.can_emit("login"));
        assert!(!schema.can_emit("showReminder"));
        assert!(schema.can_listen("showReminder"));
    }
}
