//! Listen activities: wait for correlated events.
//!
//! The processor never blocks on events itself. On first run it registers an
//! ephemeral correlation whose outcome targets this activity and reports
//! `Waiting`; the correlator later stores the satisfied context on the
//! instance and wakes it, and the next run completes with that context.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use synapse_types::activity::{metadata_keys, Activity};
use synapse_types::correlation::{
    Correlation, CorrelationLifetime, CorrelationOutcome, CorrelationSpec, EventConsumptionStrategy,
};
use synapse_types::error::{RepositoryError, WorkflowError};
use synapse_types::resource::{labels, ResourceMetadata};
use tokio_util::sync::CancellationToken;

use crate::repository::ResourceRepository;
use crate::runtime::context::WorkflowRuntimeContext;

use super::{short_id, ActivityOutcome, ProcessError};

pub struct ListenProcessor<R: ResourceRepository + 'static> {
    pub(super) ctx: Arc<WorkflowRuntimeContext<R>>,
    pub(super) activity: Activity,
    events: EventConsumptionStrategy,
    timeout_ms: Option<u64>,
}

impl<R: ResourceRepository + 'static> ListenProcessor<R> {
    pub fn new(
        ctx: Arc<WorkflowRuntimeContext<R>>,
        events: EventConsumptionStrategy,
        timeout_ms: Option<u64>,
        activity: Activity,
    ) -> Self {
        Self {
            ctx,
            activity,
            events,
            timeout_ms,
        }
    }

    /// Name of the correlation registered for this activity.
    pub fn correlation_name(&self) -> String {
        format!("{}-{}", self.ctx.name(), short_id(&self.activity.id))
    }

    pub(super) async fn run(&mut self, _cancel: &CancellationToken) -> Result<ActivityOutcome, ProcessError> {
        let snapshot = self.ctx.snapshot().await;
        if let Some(context) = snapshot.status.correlation_contexts.get(&self.activity.id) {
            tracing::info!(
                instance = %self.ctx.qualified_name(),
                activity_id = %self.activity.id,
                context = %context.id,
                "correlated events received"
            );
            return Ok(ActivityOutcome::Completed(context.to_value()));
        }

        if let Some(deadline) = self.deadline() {
            if Utc::now() >= deadline {
                self.discard_correlation().await;
                return Err(ProcessError::fault(
                    WorkflowError::TIMEOUT,
                    "listen timed out",
                    format!("no correlated events before {}", deadline.to_rfc3339()),
                ));
            }
        }

        if self.activity.meta(metadata_keys::CORRELATION).is_none() {
            self.register_correlation().await?;
        }
        Ok(ActivityOutcome::Waiting)
    }

    /// Instant after which the activity times out: the recorded one, or the
    /// start time plus the timeout.
    fn deadline(&self) -> Option<DateTime<Utc>> {
        if let Some(recorded) = self.activity.meta(metadata_keys::DEADLINE) {
            return DateTime::parse_from_rfc3339(recorded)
                .ok()
                .map(|d| d.with_timezone(&Utc));
        }
        let timeout_ms = self.timeout_ms?;
        let started_at = self.activity.started_at?;
        started_at.checked_add_signed(chrono::Duration::milliseconds(timeout_ms.min(u32::MAX as u64) as i64))
    }

    async fn register_correlation(&mut self) -> Result<(), ProcessError> {
        let name = self.correlation_name();
        let metadata = ResourceMetadata::new(name.clone(), self.ctx.namespace())
            .with_label(labels::PARENT_INSTANCE, self.ctx.name())
            .with_label(labels::PARENT_ACTIVITY, self.activity.id.clone());
        let correlation = Correlation::new(
            metadata,
            CorrelationSpec {
                lifetime: CorrelationLifetime::Ephemeral,
                selector: None,
                events: self.events.clone(),
                outcome: CorrelationOutcome::Correlate {
                    instance: self.ctx.name().to_string(),
                    namespace: Some(self.ctx.namespace().to_string()),
                    task: self.activity.id.clone(),
                },
            },
        );
        match self.ctx.repository().add(&correlation).await {
            Ok(_) | Err(RepositoryError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let mut entries = BTreeMap::from([(metadata_keys::CORRELATION.to_string(), name.clone())]);
        if let Some(deadline) = self.deadline() {
            entries.insert(metadata_keys::DEADLINE.to_string(), deadline.to_rfc3339());
        }
        self.activity = self.ctx.annotate_activity(&self.activity.id, entries).await?;
        tracing::info!(
            instance = %self.ctx.qualified_name(),
            activity_id = %self.activity.id,
            correlation = name.as_str(),
            "listening for correlated events"
        );
        Ok(())
    }

    async fn discard_correlation(&self) {
        let name = self.correlation_name();
        if let Err(e) = self
            .ctx
            .repository()
            .delete::<Correlation>(&name, self.ctx.namespace())
            .await
        {
            tracing::warn!(correlation = name.as_str(), error = %e, "failed to delete correlation");
        }
    }
}
