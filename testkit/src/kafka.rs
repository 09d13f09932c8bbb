//! In-process Kafka clusters for tests.
//!
//! [`TestScope::requires_kafka`] starts a mock cluster for the scope. Every
//! other operation finds the cluster of the scope it is called in, or of the
//! nearest parent scope, so a cluster started in `setup_suite` serves the
//! whole suite.

use crate::{
    errors::{Error, Result},
    suite::{Suite, TestScope},
};
use dashmap::{mapref::entry::Entry, DashMap};
use rdkafka::{
    config::ClientConfig,
    consumer::{Consumer, StreamConsumer},
    message::{Header, Headers, OwnedHeaders},
    mocking::MockCluster,
    producer::{DefaultProducerContext, FutureProducer, FutureRecord},
};
use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{instrument::WithSubscriber, Instrument};

/// A Kafka message, either to produce or as it was consumed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// The topic the message is sent to or came from.
    pub topic: String,
    /// The message key.
    pub key: Option<Vec<u8>>,
    /// The payload.
    pub value: Option<Vec<u8>>,
    /// Headers in order, as name and value.
    pub headers: Vec<(String, Vec<u8>)>,
    /// Milliseconds since the Unix epoch. When producing, `None` lets the
    /// producer pick the current time.
    pub timestamp: Option<i64>,
    /// Only set on consumed messages.
    pub partition: Option<i32>,
    /// Only set on consumed messages.
    pub offset: Option<i64>,
}

impl Message {
    /// The key as text, if it is valid UTF-8.
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|key| std::str::from_utf8(key).ok())
    }

    /// The value as text, if it is valid UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        self.value
            .as_deref()
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    /// The value of the first header called `key`.
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_slice())
    }
}

impl<M: rdkafka::Message> From<&M> for Message {
    fn from(message: &M) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| {
                        (
                            header.key.to_string(),
                            header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: message.topic().to_string(),
            key: message.key().map(<[u8]>::to_vec),
            value: message.payload().map(<[u8]>::to_vec),
            headers,
            timestamp: message.timestamp().to_millis(),
            partition: Some(message.partition()),
            offset: Some(message.offset()),
        }
    }
}

/// The Kafka clusters and consumers of a suite.
#[derive(Default)]
pub(crate) struct KafkaResources {
    /// Mock clusters by the scope that started them.
    clusters: DashMap<String, MockCluster<'static, DefaultProducerContext>>,

    /// Background consumers started by [`TestScope::consume`].
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl TestScope {
    /// Start a mock Kafka cluster for this scope with `topics` created, and
    /// return its bootstrap servers.
    ///
    /// If this scope already started a cluster, that one is returned as it
    /// is. Clusters stop when the suite finishes.
    ///
    /// # Errors
    /// If the cluster or a topic cannot be created.
    pub fn requires_kafka(&self, topics: &[&str]) -> Result<String> {
        let kafka = &self.settings().kafka;

        let entry = self
            .suite()
            .inner
            .kafka
            .clusters
            .entry(self.name().to_string());
        let cluster = match entry {
            Entry::Occupied(existing) => {
                let servers = existing.get().bootstrap_servers();
                tracing::trace!(%servers, "Kafka cluster already exists");
                return Ok(servers);
            }
            Entry::Vacant(vacant) => {
                tracing::trace!("Creating new Kafka cluster");
                let cluster = MockCluster::new(kafka.broker_count)?;
                for topic in topics {
                    cluster.create_topic(topic, kafka.partitions, 1)?;
                }
                tracing::info!(?topics, "Topics created");
                vacant.insert(cluster)
            }
        };

        Ok(cluster.bootstrap_servers())
    }

    /// The bootstrap servers of the cluster for this scope.
    ///
    /// # Errors
    /// If neither this scope nor a parent called
    /// [`requires_kafka`](Self::requires_kafka).
    pub fn kafka_bootstrap_servers(&self) -> Result<String> {
        self.lookup(&self.suite().inner.kafka.clusters)
            .map(|cluster| cluster.bootstrap_servers())
            .ok_or(Error::KafkaClusterNotFound)
    }

    /// Client settings for the cluster of this scope. Consumers join a group
    /// named after the scope and start from the earliest offset.
    ///
    /// # Errors
    /// If there is no cluster for this scope.
    pub fn kafka_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.kafka_bootstrap_servers()?)
            .set("group.id", self.name())
            .set("auto.offset.reset", "earliest");
        Ok(config)
    }

    /// Produce a message to `topic`.
    ///
    /// # Errors
    /// If there is no cluster for this scope, or delivery is not confirmed
    /// in time.
    pub async fn produce(
        &self,
        topic: &str,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        headers: &[(&str, &[u8])],
    ) -> Result<()> {
        self.produce_message(Message {
            topic: topic.to_string(),
            key: Some(key.as_ref().to_vec()),
            value: Some(value.as_ref().to_vec()),
            headers: headers
                .iter()
                .map(|(name, value)| ((*name).to_string(), value.to_vec()))
                .collect(),
            ..Message::default()
        })
        .await
    }

    /// Produce `message`, and wait for the cluster to confirm it.
    ///
    /// # Errors
    /// If there is no cluster for this scope, or delivery is not confirmed
    /// in time.
    pub async fn produce_message(&self, message: Message) -> Result<()> {
        let delivery_timeout = self.settings().kafka.delivery_timeout;
        let producer: FutureProducer = self
            .kafka_config()?
            .set(
                "message.timeout.ms",
                delivery_timeout.as_millis().to_string(),
            )
            .create()?;

        let headers = message
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key,
                    value: Some(value.as_slice()),
                })
            });
        let mut record = FutureRecord::<[u8], [u8]>::to(&message.topic).headers(headers);
        if let Some(key) = &message.key {
            record = record.key(key.as_slice());
        }
        if let Some(value) = &message.value {
            record = record.payload(value.as_slice());
        }
        if let Some(timestamp) = message.timestamp {
            record = record.timestamp(timestamp);
        }

        tracing::debug!(topic = %message.topic, "Producing message");
        let delivery = tokio::time::timeout(
            delivery_timeout,
            producer.send(record, delivery_timeout),
        )
        .await
        .map_err(|_| Error::DeliveryTimeout(message.topic.clone()))?;

        match delivery {
            Ok((partition, offset)) => {
                tracing::debug!(topic = %message.topic, partition, offset, "Delivered");
                Ok(())
            }
            Err((error, _)) => Err(error.into()),
        }
    }

    /// Consume `topics` in the background, passing each message to
    /// `callback` until it returns `true`.
    ///
    /// Receive errors are logged and skipped. The consumer stops when the
    /// suite finishes, if it has not already.
    ///
    /// # Errors
    /// If there is no cluster for this scope, or the consumer cannot
    /// subscribe.
    pub fn consume<F>(&self, topics: &[&str], mut callback: F) -> Result<()>
    where
        F: FnMut(&Message) -> bool + Send + 'static,
    {
        let consumer: StreamConsumer = self.kafka_config()?.create()?;
        consumer.subscribe(topics)?;

        let poll_timeout = self.settings().kafka.poll_timeout;
        let span = tracing::debug_span!("consume", test = %self.name(), ?topics);
        let handle = tokio::spawn(
            async move {
                loop {
                    match tokio::time::timeout(poll_timeout, consumer.recv()).await {
                        Err(_) => tracing::trace!("No message yet"),
                        Ok(Err(error)) => tracing::warn!(%error, "Received error from kafka"),
                        Ok(Ok(received)) => {
                            tracing::trace!("Received message");
                            if callback(&Message::from(&received)) {
                                break;
                            }
                        }
                    }
                }
                tracing::debug!("Consumer finished");
            }
            .instrument(span)
            .with_current_subscriber(),
        );

        self.suite()
            .inner
            .kafka
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    /// Wait up to `timeout` for the next message on `topic`.
    ///
    /// # Errors
    /// If there is no cluster for this scope, or no message arrives in time.
    pub async fn wait_for_message(&self, topic: &str, timeout: Duration) -> Result<Message> {
        let (sender, receiver) = oneshot::channel();
        let mut sender = Some(sender);
        self.consume(&[topic], move |message| {
            if let Some(sender) = sender.take() {
                let _ = sender.send(message.clone());
            }
            true
        })?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(message)) => Ok(message),
            _ => Err(Error::WaitTimeout(topic.to_string())),
        }
    }
}

impl Suite {
    /// Stop every consumer, then every cluster.
    pub(crate) async fn cleanup_kafka(&self) {
        let kafka = &self.inner.kafka;
        let consumers =
            std::mem::take(&mut *kafka.consumers.lock().unwrap_or_else(PoisonError::into_inner));
        for consumer in consumers {
            consumer.abort();
            // Dropping the consumer closes it.
            let _ = consumer.await;
        }

        let clusters = kafka.clusters.len();
        kafka.clusters.clear();
        if clusters > 0 {
            tracing::debug!(clusters, "Stopped Kafka clusters");
        }
    }
}
