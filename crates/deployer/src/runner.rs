//! Job lifecycle: acceptance, launch, completion and stop handling.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::PullConsumer;
use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stampede_shared::deployment::{DeploymentRequest, DeploymentStatusEvent, JobOutput, StreamType};
use stampede_shared::error::BusError;
use stampede_shared::lifecycle::JobPhase;
use stampede_shared::nats::DeployerBus;
use stampede_shared::subjects;

use crate::executor::{ExecError, Executor, ExitDisposition};
use crate::registry::{JobHandle, JobKey, JobRegistry};

/// Everything a running job publishes: output lines, completion markers
/// and phase events.
#[async_trait]
pub trait JobEvents: Send + Sync {
    async fn output(&self, output: &JobOutput) -> Result<(), BusError>;
    async fn done(&self, output: &JobOutput) -> Result<(), BusError>;
    async fn status(&self, event: &DeploymentStatusEvent) -> Result<(), BusError>;
}

/// Bus-backed event publisher used in production.
pub struct BusJobEvents {
    bus: DeployerBus,
}

impl BusJobEvents {
    pub fn new(bus: DeployerBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl JobEvents for BusJobEvents {
    async fn output(&self, output: &JobOutput) -> Result<(), BusError> {
        self.bus.publish_output(output).await
    }

    async fn done(&self, output: &JobOutput) -> Result<(), BusError> {
        self.bus.publish_done(output).await
    }

    async fn status(&self, event: &DeploymentStatusEvent) -> Result<(), BusError> {
        self.bus.publish_status(event).await
    }
}

/// Accepts start requests one at a time, launches their processes and
/// publishes the resulting lifecycle events.
#[derive(Clone)]
pub struct JobRunner {
    registry: Arc<JobRegistry>,
    executor: Arc<dyn Executor>,
    events: Arc<dyn JobEvents>,
}

impl JobRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        executor: Arc<dyn Executor>,
        events: Arc<dyn JobEvents>,
    ) -> Self {
        Self {
            registry,
            executor,
            events,
        }
    }

    /// Registers and runs a job to completion. Output streams on the job's
    /// own tasks; the caller is blocked only on the process itself. A
    /// request whose composite key is already registered is dropped without
    /// side effects.
    pub async fn start_job(&self, request: DeploymentRequest) {
        let key = JobKey::derive(&request);
        let cancel = CancellationToken::new();
        let handle = JobHandle {
            id: request.id.clone(),
            deployment_type: request.deployment_type,
            cancel: cancel.clone(),
        };

        if !self.registry.try_register(key.clone(), handle).await {
            debug!(id = %request.id, key = %key.as_str(), "duplicate start request ignored");
            return;
        }

        info!(
            id = %request.id,
            deployment_type = %request.deployment_type,
            "starting job"
        );
        let started = DeploymentStatusEvent::new(
            &request.id,
            request.deployment_type,
            JobPhase::Started,
            request.params.clone(),
        );
        if let Err(e) = self.events.status(&started).await {
            warn!(id = %request.id, error = %e, "failed to publish initial status");
        }

        self.run_to_completion(request, key, cancel).await;
    }

    /// Requests cooperative termination of a running job, or reports that
    /// none exists for the key.
    pub async fn stop_job(&self, request: DeploymentRequest) {
        let key = JobKey::derive(&request);
        match self.registry.get(&key).await {
            Some(handle) => {
                info!(id = %handle.id, key = %key.as_str(), "stopping job");
                handle.cancel.cancel();
                let notice = JobOutput::line(
                    &handle.id,
                    handle.deployment_type,
                    StreamType::None,
                    "Stopping job...",
                );
                if let Err(e) = self.events.output(&notice).await {
                    warn!(id = %handle.id, error = %e, "failed to publish stop notice");
                }
            }
            None => {
                debug!(id = %request.id, key = %key.as_str(), "no job registered for stop request");
                let notice = JobOutput {
                    output: "No running process".to_string(),
                    ..JobOutput::completed(&request.id, request.deployment_type)
                };
                if let Err(e) = self.events.output(&notice).await {
                    warn!(id = %request.id, error = %e, "failed to publish stop notice");
                }
            }
        }
    }

    async fn run_to_completion(
        &self,
        request: DeploymentRequest,
        key: JobKey,
        cancel: CancellationToken,
    ) {
        let outcome = self
            .executor
            .execute(&request, cancel, Arc::clone(&self.events))
            .await;
        self.registry.remove(&key).await;

        let final_event = match outcome {
            Ok(ExitDisposition::Success) => {
                info!(id = %request.id, "job completed");
                DeploymentStatusEvent::new(
                    &request.id,
                    request.deployment_type,
                    JobPhase::Completed,
                    request.params.clone(),
                )
            }
            Ok(ExitDisposition::Cancelled) => {
                // Operator cancellation is a clean completion of the cancel
                // counterpart, not an error.
                let cancelled_type = request.deployment_type.cancelled();
                info!(id = %request.id, deployment_type = %cancelled_type, "job cancelled");
                DeploymentStatusEvent::new(
                    &request.id,
                    cancelled_type,
                    JobPhase::Completed,
                    request.params.clone(),
                )
            }
            Ok(ExitDisposition::Failed(code)) => {
                error!(id = %request.id, code, "job failed");
                DeploymentStatusEvent::new(
                    &request.id,
                    request.deployment_type,
                    JobPhase::Error,
                    request.params.clone(),
                )
            }
            Err(ref e) => {
                error!(id = %request.id, error = %e, "job could not run");
                DeploymentStatusEvent::new(
                    &request.id,
                    request.deployment_type,
                    JobPhase::Error,
                    request.params.clone(),
                )
            }
        };

        let completed = JobOutput::completed(&request.id, final_event.deployment_type);
        if let Err(e) = self.events.output(&completed).await {
            warn!(id = %request.id, error = %e, "failed to publish completion marker");
        }
        if let Err(e) = self.events.done(&completed).await {
            warn!(id = %request.id, error = %e, "failed to publish done notification");
        }
        if let Err(e) = self.events.status(&final_event).await {
            warn!(id = %request.id, error = %e, "failed to publish final status");
        }
    }
}

/// Pulls start requests one at a time from the durable queue.
///
/// Each request is acked on acceptance and run to completion before the
/// next fetch, so a replica executes one job at a time while its output
/// streams concurrently. The capacity-1 pull replaces the original
/// subscribe/wait/unsubscribe cycle without the subscription churn.
pub async fn accept_loop(runner: JobRunner, consumer: PullConsumer, shutdown: CancellationToken) {
    info!("accepting start requests");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let batch = tokio::select! {
            _ = shutdown.cancelled() => break,
            batch = consumer
                .fetch()
                .max_messages(1)
                .expires(Duration::from_secs(30))
                .messages() => batch,
        };

        let mut messages = match batch {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "fetching start request failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "start request delivery failed");
                    continue;
                }
            };

            // Ack before launch; the registry guard absorbs redeliveries.
            if let Err(e) = message.ack().await {
                warn!(error = %e, "failed to ack start request");
            }

            match serde_json::from_slice::<DeploymentRequest>(&message.payload) {
                Ok(request) => runner.start_job(request).await,
                Err(e) => warn!(error = %e, "discarding malformed start request"),
            }
        }
    }
    info!("accept loop stopped");
}

/// Handles stop requests from plain pub/sub; stops must reach the replica
/// that owns the process, so every replica listens.
pub async fn stop_loop(
    runner: JobRunner,
    bus: DeployerBus,
    shutdown: CancellationToken,
) -> Result<(), BusError> {
    let mut subscriber = bus
        .client()
        .subscribe(subjects::STOP)
        .await
        .map_err(|e| BusError::Subscribe(e.to_string()))?;

    info!("listening for stop requests");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            message = subscriber.next() => {
                let Some(message) = message else { break };
                match serde_json::from_slice::<DeploymentRequest>(&message.payload) {
                    Ok(request) => runner.stop_job(request).await,
                    Err(e) => warn!(error = %e, "discarding malformed stop request"),
                }
            }
        }
    }
    info!("stop loop stopped");
    Ok(())
}
