//! Kafka engine: consumes the topics a Debezium connector writes to.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{interruptible_sleep, ChangeEngine, ChangeEvent, ChangeHandler, EngineErrorState};
use crate::config::Properties;
use crate::error::{LoaderError, Result};

const DEFAULT_MAX_BATCH_SIZE: usize = 2048;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_GROUP_ID: &str = "cdc-loader";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    /// `kafka.*` properties with the prefix stripped
    pub client: Vec<(String, String)>,
    pub topics: Vec<String>,
    pub max_batch_size: usize,
    pub poll_interval: Duration,
}

impl KafkaSettings {
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let mut client: Vec<(String, String)> = props
            .with_prefix("kafka.")
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        if !client.iter().any(|(key, _)| key == "bootstrap.servers") {
            return Err(LoaderError::Properties(
                "Missing required property 'kafka.bootstrap.servers'".to_string(),
            ));
        }
        if !client.iter().any(|(key, _)| key == "group.id") {
            client.push(("group.id".to_string(), DEFAULT_GROUP_ID.to_string()));
        }

        let topics: Vec<String> = props
            .require("topics")?
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_string)
            .collect();
        if topics.is_empty() {
            return Err(LoaderError::Properties("'topics' lists no topic".to_string()));
        }

        let max_batch_size: usize = props.get_parsed("max.batch.size", DEFAULT_MAX_BATCH_SIZE)?;
        if max_batch_size == 0 {
            return Err(LoaderError::Properties(
                "max.batch.size must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            client,
            topics,
            max_batch_size,
            poll_interval: Duration::from_millis(
                props.get_parsed("poll.interval.ms", DEFAULT_POLL_INTERVAL_MS)?,
            ),
        })
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        for (key, value) in &self.client {
            config.set(key, value);
        }
        config
    }
}

impl ChangeEvent for BorrowedMessage<'_> {
    fn key(&self) -> Result<Option<&[u8]>> {
        Ok(Message::key(self))
    }

    fn value(&self) -> Result<Option<&[u8]>> {
        Ok(self.payload())
    }

    fn destination(&self) -> Result<Option<&str>> {
        Ok(Some(self.topic()))
    }
}

pub struct KafkaEngine {
    settings: KafkaSettings,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KafkaEngine {
    pub fn new(settings: KafkaSettings) -> Self {
        Self {
            settings,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn from_properties(props: &Properties) -> Result<Self> {
        Ok(Self::new(KafkaSettings::from_properties(props)?))
    }
}

impl ChangeEngine for KafkaEngine {
    fn start(&mut self, handler: Arc<dyn ChangeHandler>) -> Result<()> {
        if self.handle.is_some() {
            return Err(LoaderError::Engine("kafka engine already started".to_string()));
        }

        let consumer: BaseConsumer = self.settings.client_config().create().map_err(|e| {
            error!("Failed to create Kafka consumer: {}", e);
            LoaderError::Engine(format!("Failed to create Kafka consumer: {}", e))
        })?;

        let topics: Vec<&str> = self.settings.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics).map_err(|e| {
            LoaderError::Engine(format!("Failed to subscribe to {:?}: {}", topics, e))
        })?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let settings = self.settings.clone();

        let handle = thread::Builder::new()
            .name("cdc-engine".to_string())
            .spawn(move || {
                info!(topics = ?settings.topics, "Kafka engine started");
                let consumed = panic::catch_unwind(AssertUnwindSafe(|| {
                    consume_loop(&consumer, &settings, handler.as_ref(), &running)
                }));
                if consumed.is_err() {
                    error!("Kafka engine crashed");
                }
                running.store(false, Ordering::SeqCst);
                info!("Kafka engine stopped");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                LoaderError::Engine(format!("Failed to spawn kafka engine thread: {}", e))
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                return Err(LoaderError::Engine("kafka engine thread panicked".to_string()));
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for KafkaEngine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn consume_loop(
    consumer: &BaseConsumer,
    settings: &KafkaSettings,
    handler: &dyn ChangeHandler,
    running: &AtomicBool,
) {
    let errors = EngineErrorState::new();
    let keep_going = || running.load(Ordering::SeqCst);

    while keep_going() {
        let (messages, failure) = poll_batch(consumer, settings);

        if !messages.is_empty() {
            let handles: Vec<&dyn ChangeEvent> =
                messages.iter().map(|m| m as &dyn ChangeEvent).collect();
            debug!(records = handles.len(), "Delivering Kafka batch");
            handler.handle_batch(&handles);
        }

        match failure {
            None => errors.record_success(),
            Some(e) => {
                let consecutive = errors.record_error();
                let backoff = errors.calculate_backoff();
                warn!(
                    error = %e,
                    consecutive_errors = consecutive,
                    backoff_secs = backoff.as_secs(),
                    "Kafka consumer error, backing off"
                );
                interruptible_sleep(backoff, keep_going);
            }
        }
    }
}

/// Poll until the batch is full or no message arrives within the interval
fn poll_batch<'c>(
    consumer: &'c BaseConsumer,
    settings: &KafkaSettings,
) -> (Vec<BorrowedMessage<'c>>, Option<KafkaError>) {
    let mut messages = Vec::new();
    let mut timeout = settings.poll_interval;

    while messages.len() < settings.max_batch_size {
        match consumer.poll(timeout) {
            None => break,
            Some(Ok(message)) => {
                messages.push(message);
                timeout = Duration::ZERO;
            }
            Some(Err(e)) => return (messages, Some(e)),
        }
    }

    (messages, None)
}
