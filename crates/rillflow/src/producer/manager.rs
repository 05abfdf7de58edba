//! Topic-indexed producer ownership.
//!
//! [`ProducerManager`] maps each topic name to exactly one
//! [`ProducerEngine`] and owns shutdown. Registration is only legal
//! before [`start`](ProducerManager::start); lookups are cheap and
//! thread-safe afterwards. Typed sending goes through the
//! [`ProducerHandle`] returned at registration.

use std::sync::Arc;

use async_trait::async_trait;
use fxhash::FxHashMap;
use tracing::info;

use crate::client::ProducerClient;
use crate::config::{ConnectorConfig, ProducerConfig};
use crate::error::Error;
use crate::message::DeliveryReport;
use crate::metadata::ProducerMetadata;
use crate::producer::engine::{build_engine, DeliveryFuture, ProducerEngine, ProducerMessage};
use crate::runtime::Dispatcher;

/// Type-erased per-topic engine operations the manager fans out to.
#[async_trait]
trait ManagedProducer: Send + Sync {
    fn topic(&self) -> &str;
    fn start(&self);
    async fn flush(&self) -> Result<(), Error>;
    async fn shutdown(&self) -> Result<(), Error>;
    fn metadata(&self) -> ProducerMetadata;
}

#[async_trait]
impl<K: 'static, V: 'static> ManagedProducer for ProducerEngine<K, V> {
    fn topic(&self) -> &str {
        ProducerEngine::topic(self)
    }

    fn start(&self) {
        self.ensure_started();
    }

    async fn flush(&self) -> Result<(), Error> {
        ProducerEngine::flush(self).await
    }

    async fn shutdown(&self) -> Result<(), Error> {
        ProducerEngine::shutdown(self).await
    }

    fn metadata(&self) -> ProducerMetadata {
        ProducerEngine::metadata(self)
    }
}

/// Cloneable typed handle to one topic's producer engine.
pub struct ProducerHandle<K, V> {
    engine: Arc<ProducerEngine<K, V>>,
}

impl<K, V> Clone for ProducerHandle<K, V> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<K, V> ProducerHandle<K, V> {
    /// Returns the topic this handle produces to.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.engine.topic()
    }

    /// Sends a record; see [`ProducerEngine::send`].
    ///
    /// # Errors
    ///
    /// As for [`ProducerEngine::send`].
    pub async fn send(&self, message: ProducerMessage<K, V>) -> Result<DeliveryFuture, Error> {
        self.engine.send(message).await
    }

    /// Sends a record and waits for its report; see
    /// [`ProducerEngine::send_sync`].
    ///
    /// # Errors
    ///
    /// As for [`ProducerEngine::send_sync`].
    pub async fn send_sync(
        &self,
        message: ProducerMessage<K, V>,
    ) -> Result<DeliveryReport, Error> {
        self.engine.send_sync(message).await
    }

    /// Flushes buffered records; see [`ProducerEngine::flush`].
    ///
    /// # Errors
    ///
    /// As for [`ProducerEngine::flush`].
    pub async fn flush(&self) -> Result<(), Error> {
        self.engine.flush().await
    }

    /// Returns a point-in-time metadata facade.
    #[must_use]
    pub fn metadata(&self) -> ProducerMetadata {
        self.engine.metadata()
    }
}

impl<K, V> std::fmt::Debug for ProducerHandle<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("topic", &self.topic())
            .finish()
    }
}

/// Owns every producer engine of one connector, indexed by topic.
pub struct ProducerManager {
    connector: ConnectorConfig,
    dispatcher: Dispatcher,
    entries: FxHashMap<String, Arc<dyn ManagedProducer>>,
    started: bool,
}

impl ProducerManager {
    /// Creates a manager with a fresh dispatcher.
    #[must_use]
    pub fn new(connector: ConnectorConfig) -> Self {
        Self::with_dispatcher(connector, Dispatcher::new())
    }

    /// Creates a manager sharing an existing dispatcher (and its
    /// interrupt flag).
    #[must_use]
    pub fn with_dispatcher(connector: ConnectorConfig, dispatcher: Dispatcher) -> Self {
        Self {
            connector,
            dispatcher,
            entries: FxHashMap::default(),
            started: false,
        }
    }

    /// Returns the shared dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Registers a topic and returns its typed handle.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error after `start`, for duplicate
    /// topics, or when the configuration fails validation.
    pub fn register<K: 'static, V: 'static>(
        &mut self,
        config: ProducerConfig<K, V>,
        client: Arc<dyn ProducerClient>,
    ) -> Result<ProducerHandle<K, V>, Error> {
        if self.started {
            return Err(Error::configuration(
                "producer topics cannot be added after start",
            ));
        }
        let topic = config.topic().to_string();
        if self.entries.contains_key(&topic) {
            return Err(Error::configuration(format!(
                "topic '{topic}' is already registered"
            )));
        }

        let engine = Arc::new(build_engine(
            config,
            self.connector.clone(),
            client,
            self.dispatcher.clone(),
        )?);
        self.entries
            .insert(topic, Arc::clone(&engine) as Arc<dyn ManagedProducer>);
        Ok(ProducerHandle { engine })
    }

    /// Starts every registered engine's drain task.
    pub fn start(&mut self) {
        for entry in self.entries.values() {
            entry.start();
        }
        self.started = true;
        info!(topics = self.entries.len(), "producer manager started");
    }

    /// Returns `true` once `start` has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Returns the registered topic names.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Returns a metadata facade for one topic.
    #[must_use]
    pub fn metadata(&self, topic: &str) -> Option<ProducerMetadata> {
        self.entries.get(topic).map(|e| e.metadata())
    }

    /// Flushes every registered engine.
    ///
    /// # Errors
    ///
    /// Returns the first flush error encountered.
    pub async fn flush_all(&self) -> Result<(), Error> {
        for entry in self.entries.values() {
            entry.flush().await?;
        }
        Ok(())
    }

    /// Shuts every engine down, draining in-flight records.
    ///
    /// # Errors
    ///
    /// Returns the first shutdown error encountered; remaining engines
    /// are still shut down.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        let mut first_error = None;
        for entry in self.entries.values() {
            if let Err(e) = entry.shutdown().await {
                first_error.get_or_insert(e);
            }
        }
        info!(topics = self.entries.len(), "producer manager shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ProducerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerManager")
            .field("topics", &self.entries.len())
            .field("started", &self.started)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicOptions;
    use crate::serde::BytesSerde;
    use crate::testing::MockProducerClient;
    use bytes::Bytes;

    fn config(topic: &str) -> ProducerConfig<Bytes, Bytes> {
        ProducerConfig::new(topic)
            .with_options(TopicOptions::new())
            .unwrap()
            .key_serializer(Arc::new(BytesSerde::new()))
            .value_serializer(Arc::new(BytesSerde::new()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_register_and_send_through_handle() {
        let mut manager = ProducerManager::new(ConnectorConfig::default());
        let client = Arc::new(MockProducerClient::new(4));
        let handle = manager
            .register(config("events"), client as Arc<dyn ProducerClient>)
            .unwrap();
        manager.start();

        let report = handle
            .send_sync(ProducerMessage::new(Bytes::from_static(b"v")))
            .await
            .unwrap();
        assert!(report.success());
        assert_eq!(manager.topics(), vec!["events".to_string()]);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_topic_rejected() {
        let mut manager = ProducerManager::new(ConnectorConfig::default());
        let client = Arc::new(MockProducerClient::new(4));
        manager
            .register(config("events"), Arc::clone(&client) as Arc<dyn ProducerClient>)
            .unwrap();
        let err = manager
            .register(config("events"), client as Arc<dyn ProducerClient>)
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_registration_closed_after_start() {
        let mut manager = ProducerManager::new(ConnectorConfig::default());
        manager.start();
        let client = Arc::new(MockProducerClient::new(4));
        let err = manager
            .register(config("late"), client as Arc<dyn ProducerClient>)
            .unwrap_err();
        assert!(err.to_string().contains("after start"));
    }

    #[tokio::test]
    async fn test_metadata_lookup() {
        let mut manager = ProducerManager::new(ConnectorConfig::default());
        let client = Arc::new(MockProducerClient::new(4));
        manager
            .register(config("events"), client as Arc<dyn ProducerClient>)
            .unwrap();
        assert!(manager.metadata("events").is_some());
        assert!(manager.metadata("missing").is_none());
    }
}
