//! Topic-indexed consumer ownership.
//!
//! [`ConsumerManager`] maps each topic name to exactly one
//! [`ConsumerEngine`], fans user calls (subscribe, pause, resume,
//! preprocessing, commit) to the right engine, and owns shutdown.
//! Registration is only legal before [`start`](ConsumerManager::start).

use std::sync::Arc;

use async_trait::async_trait;
use fxhash::FxHashMap;
use tracing::info;

use crate::client::ConsumerClient;
use crate::config::{ConnectorConfig, ConsumerConfig};
use crate::consumer::engine::{build_engine, ConsumerEngine};
use crate::consumer::entry::ConsumerState;
use crate::error::Error;
use crate::message::{Opaque, TopicPartitionOffset};
use crate::metadata::ConsumerMetadata;
use crate::runtime::Dispatcher;

/// Type-erased per-topic engine operations the manager fans out to.
#[async_trait]
trait ManagedConsumer: Send + Sync {
    fn topic(&self) -> &str;
    fn state(&self) -> ConsumerState;
    async fn subscribe(&self) -> Result<(), Error>;
    async fn unsubscribe(&self);
    async fn pause(&self) -> Result<(), Error>;
    async fn resume(&self) -> Result<(), Error>;
    fn set_preprocessing(&self, enable: bool);
    async fn commit(&self, offsets: &[TopicPartitionOffset], opaque: Opaque)
        -> Result<(), Error>;
    fn metadata(&self) -> ConsumerMetadata;
    async fn shutdown(&self) -> Result<(), Error>;
}

#[async_trait]
impl<K: Send + Sync + 'static, V: Send + Sync + 'static> ManagedConsumer
    for ConsumerEngine<K, V>
{
    fn topic(&self) -> &str {
        ConsumerEngine::topic(self)
    }

    fn state(&self) -> ConsumerState {
        ConsumerEngine::state(self)
    }

    async fn subscribe(&self) -> Result<(), Error> {
        ConsumerEngine::subscribe(self).await
    }

    async fn unsubscribe(&self) {
        ConsumerEngine::unsubscribe(self).await;
    }

    async fn pause(&self) -> Result<(), Error> {
        ConsumerEngine::pause(self).await
    }

    async fn resume(&self) -> Result<(), Error> {
        ConsumerEngine::resume(self).await
    }

    fn set_preprocessing(&self, enable: bool) {
        ConsumerEngine::set_preprocessing(self, enable);
    }

    async fn commit(
        &self,
        offsets: &[TopicPartitionOffset],
        opaque: Opaque,
    ) -> Result<(), Error> {
        ConsumerEngine::commit(self, offsets, opaque).await
    }

    fn metadata(&self) -> ConsumerMetadata {
        ConsumerEngine::metadata(self)
    }

    async fn shutdown(&self) -> Result<(), Error> {
        ConsumerEngine::shutdown(self).await
    }
}

/// Cloneable typed handle to one topic's consumer engine.
pub struct ConsumerHandle<K, V> {
    engine: Arc<ConsumerEngine<K, V>>,
}

impl<K, V> Clone for ConsumerHandle<K, V> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<K: Send + 'static, V: Send + 'static> ConsumerHandle<K, V> {
    /// Returns the topic this handle consumes.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.engine.topic()
    }

    /// Returns the entry's lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.engine.state()
    }

    /// Subscribes; see [`ConsumerEngine::subscribe`].
    ///
    /// # Errors
    ///
    /// As for [`ConsumerEngine::subscribe`].
    pub async fn subscribe(&self) -> Result<(), Error> {
        self.engine.subscribe().await
    }

    /// Installs an explicit assignment; see [`ConsumerEngine::assign`].
    ///
    /// # Errors
    ///
    /// As for [`ConsumerEngine::assign`].
    pub async fn assign(&self, partitions: Vec<TopicPartitionOffset>) -> Result<(), Error> {
        self.engine.assign(partitions).await
    }

    /// Commits offsets; see [`ConsumerEngine::commit`].
    ///
    /// # Errors
    ///
    /// As for [`ConsumerEngine::commit`].
    pub async fn commit(
        &self,
        offsets: &[TopicPartitionOffset],
        opaque: Opaque,
    ) -> Result<(), Error> {
        self.engine.commit(offsets, opaque).await
    }

    /// Returns a point-in-time metadata facade.
    #[must_use]
    pub fn metadata(&self) -> ConsumerMetadata {
        self.engine.metadata()
    }
}

impl<K, V> std::fmt::Debug for ConsumerHandle<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle").finish_non_exhaustive()
    }
}

/// Owns every consumer engine of one connector, indexed by topic.
pub struct ConsumerManager {
    connector: ConnectorConfig,
    dispatcher: Dispatcher,
    entries: FxHashMap<String, Arc<dyn ManagedConsumer>>,
    started: bool,
}

impl ConsumerManager {
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
    pub fn register<K: Send + Sync + 'static, V: Send + Sync + 'static>(
        &mut self,
        config: ConsumerConfig<K, V>,
        client: Arc<dyn ConsumerClient>,
    ) -> Result<ConsumerHandle<K, V>, Error> {
        if self.started {
            return Err(Error::configuration(
                "consumer topics cannot be added after start",
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
            .insert(topic, Arc::clone(&engine) as Arc<dyn ManagedConsumer>);
        Ok(ConsumerHandle { engine })
    }

    /// Subscribes every registered topic and marks the manager started.
    ///
    /// # Errors
    ///
    /// Returns the first subscription error encountered.
    pub async fn start(&mut self) -> Result<(), Error> {
        for entry in self.entries.values() {
            entry.subscribe().await?;
        }
        self.started = true;
        info!(topics = self.entries.len(), "consumer manager started");
        Ok(())
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

    /// Returns the lifecycle state of one topic.
    #[must_use]
    pub fn state(&self, topic: &str) -> Option<ConsumerState> {
        self.entries.get(topic).map(|e| e.state())
    }

    /// Returns a metadata facade for one topic.
    #[must_use]
    pub fn metadata(&self, topic: &str) -> Option<ConsumerMetadata> {
        self.entries.get(topic).map(|e| e.metadata())
    }

    /// Pauses one topic.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error for unknown topics or bad state.
    pub async fn pause(&self, topic: &str) -> Result<(), Error> {
        self.entry(topic)?.pause().await
    }

    /// Pauses every topic that is currently subscribed.
    ///
    /// # Errors
    ///
    /// Returns the first pause error encountered.
    pub async fn pause_all(&self) -> Result<(), Error> {
        for entry in self.entries.values() {
            if entry.state() == ConsumerState::Subscribed {
                entry.pause().await?;
            }
        }
        Ok(())
    }

    /// Resumes one topic.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error for unknown topics or bad state.
    pub async fn resume(&self, topic: &str) -> Result<(), Error> {
        self.entry(topic)?.resume().await
    }

    /// Resumes every paused topic.
    ///
    /// # Errors
    ///
    /// Returns the first resume error encountered.
    pub async fn resume_all(&self) -> Result<(), Error> {
        for entry in self.entries.values() {
            if entry.state() == ConsumerState::Paused {
                entry.resume().await?;
            }
        }
        Ok(())
    }

    /// Toggles preprocessing for one topic.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error for unknown topics.
    pub fn set_preprocessing(&self, topic: &str, enable: bool) -> Result<(), Error> {
        self.entry(topic)?.set_preprocessing(enable);
        Ok(())
    }

    /// Toggles preprocessing for every topic.
    pub fn set_preprocessing_all(&self, enable: bool) {
        for entry in self.entries.values() {
            entry.set_preprocessing(enable);
        }
    }

    /// Commits offsets on one topic.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error for unknown topics, or the
    /// engine's commit error.
    pub async fn commit(
        &self,
        topic: &str,
        offsets: &[TopicPartitionOffset],
        opaque: Opaque,
    ) -> Result<(), Error> {
        self.entry(topic)?.commit(offsets, opaque).await
    }

    /// Unsubscribes one topic.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error for unknown topics.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        self.entry(topic)?.unsubscribe().await;
        Ok(())
    }

    /// Shuts every engine down, draining in-flight receivers.
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
        info!(topics = self.entries.len(), "consumer manager shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn entry(&self, topic: &str) -> Result<&Arc<dyn ManagedConsumer>, Error> {
        self.entries
            .get(topic)
            .ok_or_else(|| Error::configuration(format!("unknown consumer topic '{topic}'")))
    }
}

impl std::fmt::Debug for ConsumerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerManager")
            .field("topics", &self.entries.len())
            .field("started", &self.started)
            .finish()
    }
}
