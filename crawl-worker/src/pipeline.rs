use std::sync::Arc;
use std::time;

use crawl_common::channel::{Delivery, KeyMessage, Polled, TopicPublisher, TopicSubscriber};
use crawl_common::health::{ComponentStatus, HealthHandle};
use crawl_common::retry::RetryPolicy;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use crate::error::HandleError;
use crate::handler::{KeyHandler, Outcome};

/// What happened to a key whose handling failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retried,
    DeadLettered,
    Dropped,
}

/// Decides the fate of keys that failed. Retryable failures are re-published to the pipeline's
/// own topic with their attempt bumped, after a backoff. Keys claimed by another consumer come
/// back with the same attempt, for as long as the claim lives. Keys out of attempts, or
/// failing for good, go to the dead letter topic if there is one, and are dropped otherwise.
#[derive(Clone)]
pub struct FailurePolicy {
    retry_policy: RetryPolicy,
    retry_topic: Arc<dyn TopicPublisher>,
    dead_letter: Option<Arc<dyn TopicPublisher>>,
}

impl FailurePolicy {
    pub fn new(
        retry_policy: RetryPolicy,
        retry_topic: Arc<dyn TopicPublisher>,
        dead_letter: Option<Arc<dyn TopicPublisher>>,
    ) -> Self {
        Self {
            retry_policy,
            retry_topic,
            dead_letter,
        }
    }

    pub async fn handle_failure(
        &self,
        message: &KeyMessage,
        failure: &HandleError,
        mut shutdown: watch::Receiver<bool>,
    ) -> FailureAction {
        let has_attempts_left =
            !failure.consumes_attempt() || self.retry_policy.should_retry(message.attempt);

        if failure.is_retryable() && has_attempts_left {
            let interval = self
                .retry_policy
                .time_until_next_retry(message.attempt, failure.retry_after());
            let retry = if failure.consumes_attempt() {
                message.next_attempt()
            } else {
                message.clone()
            };

            // A shutdown cuts the backoff short, the key is re-published right away.
            if !*shutdown.borrow() {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {}
                }
            }

            match self.retry_topic.publish(&retry).await {
                Ok(()) => return FailureAction::Retried,
                Err(error) => error!(key = message.key, "failed to re-publish key: {}", error),
            }
        }

        if let Some(dead_letter) = &self.dead_letter {
            match dead_letter.publish(message).await {
                Ok(()) => return FailureAction::DeadLettered,
                Err(error) => error!(key = message.key, "failed to dead letter key: {}", error),
            }
        }

        warn!(
            key = message.key,
            attempt = message.attempt,
            "dropping key: {}",
            failure
        );
        FailureAction::Dropped
    }
}

/// Why a pipeline stopped polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    Shutdown,
    BrokersDown,
}

/// One consuming side of the crawl: polls a topic and hands every key to a `KeyHandler`, with at
/// most `max_concurrent_jobs` keys in flight.
pub struct Pipeline {
    subscriber: Arc<dyn TopicSubscriber>,
    handler: Arc<dyn KeyHandler>,
    failures: FailurePolicy,
    /// How long a single poll waits for a message before checking for shutdown again.
    poll_timeout: time::Duration,
    max_concurrent_jobs: usize,
    /// The liveness check handle, to call on every poll to report healthy.
    liveness: HealthHandle,
}

impl Pipeline {
    pub fn new(
        subscriber: Arc<dyn TopicSubscriber>,
        handler: Arc<dyn KeyHandler>,
        failures: FailurePolicy,
        poll_timeout: time::Duration,
        max_concurrent_jobs: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            subscriber,
            handler,
            failures,
            poll_timeout,
            max_concurrent_jobs: max_concurrent_jobs.clamp(1, u32::MAX as usize),
            liveness,
        }
    }

    pub fn topic(&self) -> &str {
        self.subscriber.topic()
    }

    /// Poll until `shutdown` flips to true or the brokers are gone. A poll in progress is
    /// abandoned on shutdown. Keys in flight are waited for before the subscription is closed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> PipelineExit {
        let topic = self.topic().to_owned();
        let labels = [("topic", topic.clone())];
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_jobs));
        let report_semaphore_utilization = || {
            metrics::gauge!("crawl_worker_saturation_percent", &labels)
                .set(1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64);
        };

        info!(topic, "starting pipeline");

        let exit = loop {
            if *shutdown.borrow() {
                info!(topic, "shutdown requested, stopping pipeline");
                break PipelineExit::Shutdown;
            }

            self.liveness.report_healthy();
            report_semaphore_utilization();

            let polled = tokio::select! {
                polled = self.subscriber.poll(self.poll_timeout) => polled,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!(topic, "shutdown sender dropped, stopping pipeline");
                        break PipelineExit::Shutdown;
                    }
                    continue;
                }
            };

            let delivery = match polled {
                Polled::Message(delivery) => delivery,
                Polled::Empty => continue,
                Polled::Transient(error) => {
                    warn!(topic, "error polling topic: {}", error);
                    continue;
                }
                Polled::Fatal(error) => {
                    error!(topic, "stopping pipeline: {}", error);
                    break PipelineExit::BrokersDown;
                }
            };

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break PipelineExit::Shutdown;
            };
            metrics::counter!("crawl_messages_total", &labels).increment(1);

            let handler = self.handler.clone();
            let failures = self.failures.clone();
            let shutdown = shutdown.clone();
            let topic = topic.clone();
            tokio::spawn(async move {
                process_delivery(handler.as_ref(), &failures, delivery, &topic, shutdown).await;
                drop(permit);
            });
        };

        // Every permit back means every spawned key was acknowledged.
        let _drained = semaphore
            .acquire_many(self.max_concurrent_jobs as u32)
            .await;
        self.subscriber.close().await;
        match exit {
            PipelineExit::Shutdown => self.liveness.report_stopped(),
            PipelineExit::BrokersDown => self.liveness.report_status(ComponentStatus::Unhealthy),
        }
        info!(topic, ?exit, "pipeline stopped");

        exit
    }
}

async fn process_delivery(
    handler: &dyn KeyHandler,
    failures: &FailurePolicy,
    delivery: Delivery,
    topic: &str,
    shutdown: watch::Receiver<bool>,
) {
    let labels = [("topic", topic.to_owned())];

    match handler.handle(&delivery.message).await {
        Ok(Outcome::AlreadySeen) => {
            metrics::counter!("crawl_keys_skipped_total", &labels).increment(1);
        }
        Ok(Outcome::Processed { .. }) => {
            metrics::counter!("crawl_keys_processed_total", &labels).increment(1);
        }
        Err(failure) => {
            error!(
                key = delivery.key(),
                kind = %handler.kind(),
                "failed to handle key: {}",
                failure
            );
            metrics::counter!("crawl_handle_failures_total", &labels).increment(1);

            let counter = match failures
                .handle_failure(&delivery.message, &failure, shutdown)
                .await
            {
                FailureAction::Retried => "crawl_keys_retried_total",
                FailureAction::DeadLettered => "crawl_keys_dead_lettered_total",
                FailureAction::Dropped => "crawl_keys_dropped_total",
            };
            metrics::counter!(counter, &labels).increment(1);
        }
    }

    delivery.ack();
}
