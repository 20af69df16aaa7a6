//! NATS JetStream bus plumbing.
//!
//! Provides durable, at-least-once delivery for the deployer subjects:
//! a work-queue stream for start requests (so a request is executed by
//! exactly one runner replica), and limits-retention streams for phase
//! events and job output (so independent consumers can each replay them
//! from the start).

use std::time::Duration;

use async_nats::jetstream::consumer::pull::Config as PullConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy, PullConsumer};
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, StorageType};
use async_nats::jetstream::Context as JetStreamContext;
use async_nats::{Client, ConnectOptions};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::NatsConfig;
use crate::deployment::{DeploymentStatusEvent, JobOutput};
use crate::error::BusError;
use crate::subjects;

/// Connection plus JetStream context shared by the services.
#[derive(Clone)]
pub struct DeployerBus {
    client: Client,
    jetstream: JetStreamContext,
}

impl DeployerBus {
    /// Connects to NATS and opens a JetStream context.
    ///
    /// # Errors
    /// Returns `BusError::Connection` if the server is unreachable.
    pub async fn connect(config: &NatsConfig) -> Result<Self, BusError> {
        let mut options = ConnectOptions::default()
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .name(&config.client_name);

        if let Some((user, pass)) = config.credentials() {
            options = options.user_and_password(user.to_string(), pass.to_string());
        }

        let client = async_nats::connect_with_options(config.url.as_str(), options)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let jetstream = async_nats::jetstream::new(client.clone());

        info!(url = %config.url, client = %config.client_name, "connected to NATS");
        Ok(Self { client, jetstream })
    }

    /// Core client, for plain (non-durable) subscriptions and request-reply.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Ensures the three deployer streams exist.
    pub async fn ensure_streams(&self) -> Result<(), BusError> {
        self.ensure_stream(StreamConfig {
            name: subjects::JOBS_STREAM.to_string(),
            subjects: vec![subjects::START.to_string()],
            retention: RetentionPolicy::WorkQueue,
            max_age: Duration::from_secs(24 * 60 * 60),
            storage: StorageType::File,
            ..Default::default()
        })
        .await?;

        self.ensure_stream(StreamConfig {
            name: subjects::STATUS_STREAM.to_string(),
            subjects: vec![subjects::STATUS.to_string()],
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(24 * 60 * 60),
            storage: StorageType::File,
            ..Default::default()
        })
        .await?;

        self.ensure_stream(StreamConfig {
            name: subjects::OUTPUT_STREAM.to_string(),
            subjects: vec![
                format!("{}.>", subjects::OUTPUT_PREFIX),
                subjects::DONE.to_string(),
            ],
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(24 * 60 * 60),
            storage: StorageType::File,
            ..Default::default()
        })
        .await
    }

    async fn ensure_stream(&self, config: StreamConfig) -> Result<(), BusError> {
        let name = config.name.clone();
        match self.jetstream.get_stream(&name).await {
            Ok(_) => {
                debug!(stream = %name, "stream already exists");
                Ok(())
            }
            Err(_) => {
                info!(stream = %name, "creating stream");
                self.jetstream
                    .create_stream(config)
                    .await
                    .map(|_| ())
                    .map_err(|e| BusError::Connection(e.to_string()))
            }
        }
    }

    /// Durable pull consumer for start requests.
    ///
    /// `max_ack_pending = 1` keeps at most one start request in flight
    /// across every replica sharing the durable name; acceptance pacing on
    /// top of that is the runner's capacity-1 pull loop.
    pub async fn jobs_consumer(&self, durable: &str) -> Result<PullConsumer, BusError> {
        self.pull_consumer(
            subjects::JOBS_STREAM,
            PullConsumerConfig {
                durable_name: Some(durable.to_string()),
                description: Some("deployment start-request queue".to_string()),
                ack_policy: AckPolicy::Explicit,
                deliver_policy: DeliverPolicy::All,
                ack_wait: Duration::from_secs(30),
                max_deliver: 5,
                max_ack_pending: 1,
                filter_subject: subjects::START.to_string(),
                ..Default::default()
            },
        )
        .await
    }

    /// Durable pull consumer on the phase-event stream.
    ///
    /// Each service uses its own durable name, so the router and the TTL
    /// tracker consume the same events independently.
    pub async fn status_consumer(&self, durable: &str) -> Result<PullConsumer, BusError> {
        self.pull_consumer(
            subjects::STATUS_STREAM,
            PullConsumerConfig {
                durable_name: Some(durable.to_string()),
                description: Some("deployment phase events".to_string()),
                ack_policy: AckPolicy::Explicit,
                deliver_policy: DeliverPolicy::All,
                ack_wait: Duration::from_secs(30),
                max_deliver: 5,
                filter_subject: subjects::STATUS.to_string(),
                ..Default::default()
            },
        )
        .await
    }

    async fn pull_consumer(
        &self,
        stream_name: &str,
        config: PullConsumerConfig,
    ) -> Result<PullConsumer, BusError> {
        let mut stream = self
            .jetstream
            .get_stream(stream_name)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let durable = config
            .durable_name
            .clone()
            .unwrap_or_else(|| "ephemeral".to_string());

        match stream.get_consumer(&durable).await {
            Ok(consumer) => {
                debug!(consumer = %durable, stream = %stream_name, "consumer already exists");
                Ok(consumer)
            }
            Err(_) => {
                info!(consumer = %durable, stream = %stream_name, "creating consumer");
                self.jetstream
                    .create_consumer_on_stream(config, stream_name)
                    .await
                    .map_err(|e| BusError::Subscribe(e.to_string()))
            }
        }
    }

    /// Publishes a phase event on `deployer.status` with ack confirmation.
    pub async fn publish_status(&self, event: &DeploymentStatusEvent) -> Result<(), BusError> {
        self.publish_json(subjects::STATUS.to_string(), event).await
    }

    /// Publishes a streamed line or completion marker on the job's output
    /// subject.
    pub async fn publish_output(&self, output: &JobOutput) -> Result<(), BusError> {
        self.publish_json(subjects::output_subject(&output.id), output)
            .await
    }

    /// Publishes a completion marker on the global done subject.
    pub async fn publish_done(&self, output: &JobOutput) -> Result<(), BusError> {
        self.publish_json(subjects::DONE.to_string(), output).await
    }

    async fn publish_json<T: Serialize>(&self, subject: String, value: &T) -> Result<(), BusError> {
        let payload = serde_json::to_vec(value).map_err(|e| BusError::Serialization(e.to_string()))?;

        let ack = self
            .jetstream
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        // Wait for the ack so the message is confirmed stored.
        ack.await.map_err(|e| BusError::Publish(e.to_string()))?;

        debug!(subject = %subject, "published");
        Ok(())
    }
}
