// src/core/client.rs

//! `RealtimeClient` is the composition root of the realtime core: one
//! connection manager, one subscription registry and one send path, shared by
//! every clone of the client.

use crate::config::Config;
use crate::core::RealtimeError;
use crate::core::connection::{
    ActiveConnection, ConnectionManager, ConnectionSettings, ConnectionStatus,
};
use crate::core::credentials::{AesGcmDecryptor, CookieJarStore, CredentialProvider};
use crate::core::dispatch::{Dispatcher, OutboundBody};
use crate::core::pubsub::{InboundMessage, Listener, SubscriptionHandle, SubscriptionRegistry};
use crate::core::transport::{Connector, WebSocketConnector};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RealtimeClient {
    manager: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
}

impl RealtimeClient {
    pub fn new(
        settings: ConnectionSettings,
        credentials: Arc<CredentialProvider>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let manager = ConnectionManager::new(settings, credentials, connector, registry.clone());
        let dispatcher = Dispatcher::new(manager.clone());
        Self {
            manager,
            registry,
            dispatcher,
        }
    }

    /// Builds a WebSocket client reading its session from the configured
    /// cookie file.
    pub fn from_config(config: &Config) -> Result<Self, RealtimeError> {
        let key = config.session.encryption_key.as_deref().ok_or_else(|| {
            RealtimeError::Config(
                "no session encryption key (set session.encryption_key or ORDERFEED_SESSION_KEY)"
                    .to_string(),
            )
        })?;
        let decryptor = AesGcmDecryptor::new(key)?;
        let store = CookieJarStore::new(&config.session.cookie_file);
        let credentials = CredentialProvider::new(
            Arc::new(store),
            Arc::new(decryptor),
            config.session.cookie_name.clone(),
        );
        let connector = WebSocketConnector::new(config.connect_timeout);
        Ok(Self::new(
            ConnectionSettings::from(config),
            Arc::new(credentials),
            Arc::new(connector),
        ))
    }

    pub async fn connect(&self) -> Result<Arc<ActiveConnection>, RealtimeError> {
        self.manager.connect().await
    }

    pub fn disconnect(&self) {
        self.manager.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn state(&self) -> ConnectionStatus {
        self.manager.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionStatus> {
        self.manager.watch_state()
    }

    /// Registers `listener` for `topic`, connecting first if necessary.
    ///
    /// Either the listener is registered and the topic has a protocol
    /// subscription, or an error is returned and nothing is left behind.
    pub async fn subscribe<F>(
        &self,
        topic: &str,
        listener: F,
    ) -> Result<SubscriptionHandle, RealtimeError>
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let connection = self.manager.connect().await?;
        let listener: Listener = Arc::new(listener);
        let listener_id = self
            .registry
            .register(topic, listener, &connection)
            .await?;
        debug!("Listener {} registered on '{}'.", listener_id, topic);
        Ok(SubscriptionHandle::new(
            topic.to_string(),
            listener_id,
            Arc::downgrade(&self.registry),
        ))
    }

    pub async fn send(
        &self,
        destination: &str,
        body: impl Into<OutboundBody>,
    ) -> Result<(), RealtimeError> {
        self.dispatcher.send(destination, body).await
    }

    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        value: &T,
    ) -> Result<(), RealtimeError> {
        self.dispatcher.send_json(destination, value).await
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}
