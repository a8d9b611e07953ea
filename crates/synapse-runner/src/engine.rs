//! Wiring of the runtime and correlation services onto a repository.

use std::sync::Arc;

use synapse_core::controller::{CorrelatorController, WorkflowInstanceController};
use synapse_core::correlation::{CorrelationMatcher, CorrelationServices};
use synapse_core::event::{CloudEventBus, EventBus};
use synapse_core::expression::{ExpressionEvaluator, WorkflowEvaluator};
use synapse_core::external::ExternalResourceProvider;
use synapse_core::repository::ResourceRepository;
use synapse_core::runtime::{FunctionInvokerRegistry, RuntimeServices};
use synapse_core::schema::SchemaValidator;
use synapse_infra::external::CompositeResourceProvider;
use synapse_infra::function::{register_http_invokers, HttpFunctionClient};
use synapse_infra::schema::JsonSchemaHandler;
use synapse_types::config::SynapseConfig;

/// Services handed to the two controllers.
pub struct Services {
    pub runtime: RuntimeServices,
    pub correlation: CorrelationServices,
}

impl Services {
    pub fn build(config: &SynapseConfig) -> anyhow::Result<Self> {
        let evaluator: Arc<dyn ExpressionEvaluator> = Arc::new(WorkflowEvaluator::new());
        let client = HttpFunctionClient::new(&config.http)?;
        let resources: Arc<dyn ExternalResourceProvider> =
            Arc::new(CompositeResourceProvider::with_defaults(client.http().clone()));

        let mut functions = FunctionInvokerRegistry::with_defaults(Arc::clone(&evaluator));
        register_http_invokers(&mut functions, client, Arc::clone(&resources));

        let runtime = RuntimeServices::new(
            Arc::clone(&evaluator),
            Arc::new(functions),
            EventBus::new(config.event_bus.capacity),
        );
        let schemas = SchemaValidator::new(resources).with_handler(Arc::new(JsonSchemaHandler::new()));
        let correlation = CorrelationServices {
            matcher: Arc::new(CorrelationMatcher::new(evaluator)),
            schemas: Arc::new(schemas),
            events: CloudEventBus::new(),
        };
        Ok(Self { runtime, correlation })
    }
}

/// Both controllers running over one repository.
pub struct Engine<R: ResourceRepository + 'static> {
    pub instances: Arc<WorkflowInstanceController<R>>,
    pub correlator: Arc<CorrelatorController<R>>,
    /// Bus that ingested cloud events are published on.
    pub events: CloudEventBus,
}

impl<R: ResourceRepository + 'static> Engine<R> {
    /// The correlator starts first so correlations created by resumed
    /// instances find a handler.
    pub async fn start(repo: Arc<R>, services: Services, config: &SynapseConfig) -> anyhow::Result<Self> {
        let events = services.correlation.events.clone();
        let correlator = CorrelatorController::new(Arc::clone(&repo), services.correlation, &config.correlator);
        correlator.start().await?;

        let instances = WorkflowInstanceController::new(repo, services.runtime, &config.runner);
        instances.start().await?;

        tracing::info!(
            runner = instances.owner(),
            correlator = correlator.owner(),
            running = instances.running_count(),
            correlations = correlator.handler_count(),
            "engine started"
        );
        Ok(Self {
            instances,
            correlator,
            events,
        })
    }

    /// Stop both controllers, releasing every claim they hold.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let instances = self.instances.shutdown().await;
        let correlator = self.correlator.shutdown().await;
        instances?;
        correlator?;
        Ok(())
    }
}
