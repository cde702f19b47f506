use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use envconfig::Envconfig;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext};
use tracing::{debug, error, info, warn};

use crate::channel::{
    ChannelError, Delivery, KeyMessage, Polled, PublishError, TopicPublisher, TopicSubscriber,
    ATTEMPT_HEADER, ORIGIN_HEADER,
};
use crate::health::HealthHandle;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "0")]
    pub kafka_producer_linger_ms: u32, // Keys are sent one by one and awaited, don't wait for a batch

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:29092")]
    pub kafka_hosts: String,

    #[envconfig(default = "crawler")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "6000")]
    pub kafka_session_timeout_ms: u32,
}

impl KafkaConfig {
    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("broker.address.family", "v4")
            .set("statistics.interval.ms", "10000");

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        client_config
    }
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = config.client_config();
    client_config
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(liveness.into())?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

/// Publishes keys to a single topic. Cloning is cheap, clones share the underlying producer.
#[derive(Clone)]
pub struct KafkaTopicPublisher {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaTopicPublisher {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: &str) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
        }
    }
}

#[async_trait]
impl TopicPublisher for KafkaTopicPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, message: &KeyMessage) -> Result<(), PublishError> {
        let attempt = message.attempt.to_string();
        let mut headers = OwnedHeaders::new().insert(Header {
            key: ATTEMPT_HEADER,
            value: Some(attempt.as_str()),
        });
        if let Some(origin) = &message.origin {
            headers = headers.insert(Header {
                key: ORIGIN_HEADER,
                value: Some(origin.as_str()),
            });
        }

        // Keying by entity means every copy of a key lands on the same partition.
        let record = FutureRecord {
            topic: &self.topic,
            key: Some(message.key.as_str()),
            payload: Some(message.key.as_str()),
            timestamp: None,
            partition: None,
            headers: Some(headers),
        };

        let delivery = match self.producer.send_result(record) {
            Ok(future) => future,
            Err((error, _)) => {
                return Err(PublishError::Kafka {
                    topic: self.topic.clone(),
                    error,
                })
            }
        };

        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((error, _))) => Err(PublishError::Kafka {
                topic: self.topic.clone(),
                error,
            }),
            Err(_) => Err(PublishError::Canceled {
                topic: self.topic.clone(),
            }),
        }
    }
}

/// Consumer context that remembers when librdkafka gave up on every broker.
#[derive(Default)]
pub struct CrawlConsumerContext {
    brokers_down: AtomicBool,
}

impl CrawlConsumerContext {
    pub fn brokers_down(&self) -> bool {
        self.brokers_down.load(Ordering::SeqCst)
    }
}

impl ClientContext for CrawlConsumerContext {
    fn error(&self, error: KafkaError, reason: &str) {
        if error.rdkafka_error_code() == Some(RDKafkaErrorCode::AllBrokersDown) {
            self.brokers_down.store(true, Ordering::SeqCst);
        }
        error!("librdkafka: {}: {}", error, reason);
    }
}

impl ConsumerContext for CrawlConsumerContext {}

/// Subscribes to a single topic. Offsets are only stored once a delivery is acknowledged, and
/// never past a message of the same partition that is still in flight.
#[derive(Clone)]
pub struct KafkaTopicSubscriber {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer<CrawlConsumerContext>,
    topic: String,
    offsets: Mutex<OffsetTracker>,
}

impl KafkaTopicSubscriber {
    pub fn new(config: &KafkaConfig, topic: &str) -> Result<Self, KafkaError> {
        let mut client_config = config.client_config();
        client_config
            .set("group.id", &config.kafka_consumer_group)
            .set(
                "session.timeout.ms",
                config.kafka_session_timeout_ms.to_string(),
            )
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("enable.auto.offset.store", "false");

        let consumer: StreamConsumer<CrawlConsumerContext> =
            client_config.create_with_context(CrawlConsumerContext::default())?;
        consumer.subscribe(&[topic])?;

        info!(
            topic,
            group_id = config.kafka_consumer_group,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                topic: topic.to_owned(),
                offsets: Default::default(),
            }),
        })
    }
}

#[async_trait]
impl TopicSubscriber for KafkaTopicSubscriber {
    fn topic(&self) -> &str {
        &self.inner.topic
    }

    async fn poll(&self, timeout: Duration) -> Polled {
        if self.inner.consumer.context().brokers_down() {
            return Polled::Fatal(ChannelError::AllBrokersDown);
        }

        let message = match tokio::time::timeout(timeout, self.inner.consumer.recv()).await {
            Err(_) => return Polled::Empty,
            Ok(Err(error))
                if error.rdkafka_error_code() == Some(RDKafkaErrorCode::AllBrokersDown) =>
            {
                return Polled::Fatal(ChannelError::AllBrokersDown)
            }
            Ok(Err(error)) => return Polled::Transient(ChannelError::Kafka(error)),
            Ok(Ok(message)) => message,
        };

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
        };
        self.inner
            .offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .track(offset.partition, offset.offset);

        let key = match message.payload().map(std::str::from_utf8) {
            Some(Ok(key)) if !key.is_empty() => key.to_owned(),
            invalid => {
                let reason = match invalid {
                    Some(Err(_)) => "payload is not valid utf-8",
                    _ => "payload is empty",
                };
                // We auto-store poison pills, nothing will ever make them valid
                if let Err(error) = offset.store() {
                    warn!(topic = self.inner.topic, "failed to store offset: {}", error);
                }
                return Polled::Transient(ChannelError::InvalidPayload(reason.to_owned()));
            }
        };

        let mut key_message = KeyMessage::new(key);
        if let Some(headers) = message.headers() {
            for header in headers.iter() {
                let value = header.value.and_then(|v| std::str::from_utf8(v).ok());
                match (header.key, value) {
                    (ATTEMPT_HEADER, Some(attempt)) => {
                        key_message.attempt = attempt.parse().unwrap_or_default()
                    }
                    (ORIGIN_HEADER, Some(origin)) => key_message.origin = Some(origin.to_owned()),
                    _ => {}
                }
            }
        }

        Polled::Message(Delivery::with_offset(key_message, offset))
    }

    async fn close(&self) {
        self.inner.consumer.unsubscribe();
        info!(topic = self.inner.topic, "Closing consumer");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

#[derive(Debug)]
pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Offset {
    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        let watermark = inner
            .offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ack(self.partition, self.offset);

        if let Some(next) = watermark {
            inner.consumer.store_offset(&inner.topic, self.partition, next)?;
        }
        Ok(())
    }
}

/// Keys of one partition are handled concurrently and finish in any order. The offset stored
/// for a partition is its low watermark: the first offset not acknowledged yet, so that a
/// restart never skips a message that was still in flight.
#[derive(Debug, Default)]
struct OffsetTracker {
    partitions: HashMap<i32, PartitionOffsets>,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    /// One past the highest acknowledged offset.
    next: i64,
    /// The last offset handed to the consumer for committing.
    stored: i64,
}

impl OffsetTracker {
    fn track(&mut self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .or_default()
            .in_flight
            .insert(offset);
    }

    /// Acknowledge an offset. Returns the offset to store when the partition's watermark moved.
    fn ack(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let offsets = self.partitions.entry(partition).or_default();
        offsets.in_flight.remove(&offset);
        offsets.next = offsets.next.max(offset + 1);

        // Committed offsets point at the next message to read.
        let watermark = offsets.in_flight.first().copied().unwrap_or(offsets.next);
        if watermark > offsets.stored {
            offsets.stored = watermark;
            Some(watermark)
        } else {
            None
        }
    }
}
