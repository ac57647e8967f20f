//! Simulation runtime
//!
//! The top-level handle owning the shared services (registry, breaker
//! manager, end-node system, timeout manager) and every component
//! balancer. Components are built from profiles by the factory and
//! registered with the registry when the simulation starts.

use crate::{
    balancer::ComponentBalancer,
    breaker::{BreakerConfig, BreakerManager},
    endnode::{EndNodeConfig, EndNodeSystem},
    engine::{EngineFactory, FixedLatencyFactory},
    factory::{ComponentFactory, ComponentProfile},
    registry::ComponentRegistry,
    timeout::TimeoutManager,
};
use flux_common::{ComponentType, Operation, Request, RequestData, SimError, SimResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Runtime-wide configuration.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Simulation id, used by state capture
    pub simulation_id: String,
    /// Default breaker config for lazily created breakers
    pub breaker: BreakerConfig,
    /// End-node system tuning
    pub endnode: EndNodeConfig,
    /// Per-request deadline
    pub request_deadline: Duration,
    /// Registry buffer-sampling interval
    pub registry_sample_interval: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            simulation_id: "simulation".to_string(),
            breaker: BreakerConfig::default(),
            endnode: EndNodeConfig::default(),
            request_deadline: crate::timeout::DEFAULT_DEADLINE,
            registry_sample_interval: crate::registry::SAMPLE_INTERVAL,
        }
    }
}

/// A running simulation: shared services plus the component set.
pub struct Simulation {
    id: String,
    registry: Arc<ComponentRegistry>,
    breakers: Arc<BreakerManager>,
    endnodes: Arc<EndNodeSystem>,
    timeouts: Arc<TimeoutManager>,
    factory: ComponentFactory,
    components: RwLock<HashMap<String, Arc<ComponentBalancer>>>,
    profiles: RwLock<HashMap<String, ComponentProfile>>,
    running: AtomicBool,
}

impl Simulation {
    /// Simulation with the default fixed-latency engines.
    pub fn new(config: SimulationConfig) -> Self {
        Self::with_engine_factory(config, Arc::new(FixedLatencyFactory::default()))
    }

    /// Simulation with a custom engine factory.
    pub fn with_engine_factory(
        config: SimulationConfig,
        engine_factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let registry = Arc::new(ComponentRegistry::with_interval(
            config.registry_sample_interval,
        ));
        let breakers = Arc::new(BreakerManager::new(config.breaker.clone()));
        let endnodes = Arc::new(EndNodeSystem::new(
            config.endnode.clone(),
            Arc::clone(&registry),
        ));
        let timeouts = Arc::new(TimeoutManager::with_deadline(
            Arc::clone(&endnodes),
            config.request_deadline,
        ));
        let factory = ComponentFactory::new(
            Arc::clone(&registry),
            Arc::clone(&breakers),
            Arc::clone(&endnodes),
            Arc::clone(&timeouts),
            engine_factory,
        );
        Self {
            id: config.simulation_id,
            registry,
            breakers,
            endnodes,
            timeouts,
            factory,
            components: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Simulation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The global registry handle.
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// The circuit-breaker manager.
    pub fn breakers(&self) -> &Arc<BreakerManager> {
        &self.breakers
    }

    /// The end-node system.
    pub fn endnodes(&self) -> &Arc<EndNodeSystem> {
        &self.endnodes
    }

    /// The timeout manager.
    pub fn timeouts(&self) -> &Arc<TimeoutManager> {
        &self.timeouts
    }

    /// Add a component from a profile. When the simulation is already
    /// running the component starts immediately.
    pub fn add_component(&self, profile: ComponentProfile) -> SimResult<Arc<ComponentBalancer>> {
        if self.components.read().contains_key(&profile.id) {
            return Err(SimError::Config(format!(
                "component {} already exists",
                profile.id
            )));
        }
        let balancer = self.factory.build(&profile)?;
        if self.running.load(Ordering::SeqCst) {
            ComponentBalancer::start(&balancer)?;
        }
        self.components
            .write()
            .insert(profile.id.clone(), Arc::clone(&balancer));
        self.profiles.write().insert(profile.id.clone(), profile);
        Ok(balancer)
    }

    /// Add a component using the defaults for its type.
    pub fn add_default_component(
        &self,
        id: &str,
        component_type: ComponentType,
    ) -> SimResult<Arc<ComponentBalancer>> {
        self.add_component(ComponentProfile::default_for(id, component_type))
    }

    /// A component balancer by id.
    pub fn component(&self, id: &str) -> Option<Arc<ComponentBalancer>> {
        self.components.read().get(id).cloned()
    }

    /// Ids of every component.
    pub fn component_ids(&self) -> Vec<String> {
        self.components.read().keys().cloned().collect()
    }

    /// Profile a component was built from.
    pub fn profile(&self, id: &str) -> Option<ComponentProfile> {
        self.profiles.read().get(id).cloned()
    }

    /// Start the shared services and every component.
    pub fn start(&self) -> SimResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SimError::Lifecycle("simulation already started".into()));
        }
        self.registry.start()?;
        self.endnodes.start()?;
        self.timeouts.start()?;
        for balancer in self.components.read().values() {
            ComponentBalancer::start(balancer)?;
        }
        tracing::info!(simulation = %self.id, "simulation started");
        Ok(())
    }

    /// Stop the simulation: drain in-flight requests, then stop every
    /// component and the shared services.
    pub async fn stop(&self) -> SimResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SimError::Lifecycle("simulation not running".into()));
        }
        // draining first: ingress refuses while in-flight completes
        self.endnodes.stop().await?;
        let balancers: Vec<_> = self.components.read().values().cloned().collect();
        for balancer in balancers {
            if let Err(err) = balancer.stop().await {
                tracing::warn!(component = %balancer.component_id(), %err, "stop failed");
            }
        }
        self.timeouts.stop().await?;
        self.registry.stop().await?;
        tracing::info!(simulation = %self.id, "simulation stopped");
        Ok(())
    }

    /// Submit an operation to a component with a fresh tracked request.
    pub fn submit(&self, component: &str, operation: Operation) -> SimResult<Arc<Request>> {
        let request = Arc::new(Request::tracked(RequestData {
            operation: operation.op_type.clone(),
            ..Default::default()
        }));
        self.submit_with(component, operation, Arc::clone(&request))?;
        Ok(request)
    }

    /// Submit an operation carrying an existing request.
    pub fn submit_with(
        &self,
        component: &str,
        operation: Operation,
        request: Arc<Request>,
    ) -> SimResult<()> {
        let balancer = self.component(component).ok_or_else(|| {
            SimError::Dispatch(format!("component {component} is not registered"))
        })?;
        balancer.submit(operation, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle() {
        let sim = Simulation::new(SimulationConfig::default());
        sim.add_default_component("cache", ComponentType::Cache).unwrap();
        sim.start().unwrap();
        assert!(matches!(sim.start(), Err(SimError::Lifecycle(_))));
        assert_eq!(sim.registry().len(), 1);
        sim.stop().await.unwrap();
        assert!(matches!(sim.stop().await, Err(SimError::Lifecycle(_))));
        assert_eq!(sim.registry().len(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_component_rejected() {
        let sim = Simulation::new(SimulationConfig::default());
        sim.add_default_component("cache", ComponentType::Cache).unwrap();
        assert!(matches!(
            sim.add_default_component("cache", ComponentType::Cache),
            Err(SimError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_to_unknown_component() {
        let sim = Simulation::new(SimulationConfig::default());
        sim.start().unwrap();
        let err = sim.submit("ghost", Operation::new("op1", "read_request")).unwrap_err();
        assert!(matches!(err, SimError::Dispatch(_)));
        sim.stop().await.unwrap();
    }
}
