use std::sync::Arc;

use ractor::{Actor, ActorRef};

use crate::actors::aggregator::{AggregatorActor, AggregatorArguments, AggregatorMsg};
use crate::actors::conductor::{Conductor, ConductorActor, ConductorArguments, ConductorMsg};
use crate::actors::target::TargetService;
use crate::remote::RemoteActor;
use crate::store::DocumentStore;

/// Handles to every role this process hosts.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    conductor: ActorRef<ConductorMsg>,
    target: TargetService,
    aggregator: Option<ActorRef<AggregatorMsg>>,
}

impl AppState {
    /// Spawn the conductor actor and collect the handles.
    pub async fn start(
        store: Arc<dyn DocumentStore>,
        remote: Arc<dyn RemoteActor>,
        node_name: &str,
        aggregator: Option<ActorRef<AggregatorMsg>>,
    ) -> anyhow::Result<Self> {
        let conductor = spawn_conductor(Conductor::new(store.clone(), remote, node_name)).await?;
        Ok(Self {
            inner: Arc::new(AppStateInner {
                conductor,
                target: TargetService::new(store),
                aggregator,
            }),
        })
    }

    pub fn conductor(&self) -> ActorRef<ConductorMsg> {
        self.inner.conductor.clone()
    }

    pub fn target(&self) -> &TargetService {
        &self.inner.target
    }

    pub fn aggregator(&self) -> Option<ActorRef<AggregatorMsg>> {
        self.inner.aggregator.clone()
    }
}

/// Spawn the conductor actor.
pub async fn spawn_conductor(conductor: Conductor) -> anyhow::Result<ActorRef<ConductorMsg>> {
    let (actor, _handle) = Actor::spawn(
        Some(format!("conductor:{}", ulid::Ulid::new())),
        ConductorActor,
        ConductorArguments { conductor },
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to spawn conductor actor: {e}"))?;
    Ok(actor)
}

/// Spawn the aggregation worker pool.
pub async fn spawn_aggregator(
    remote: Arc<dyn RemoteActor>,
    concurrency: usize,
    max_attempts: u32,
) -> anyhow::Result<ActorRef<AggregatorMsg>> {
    let (pool, _handle) = Actor::spawn(
        Some(format!("aggregator:{}", ulid::Ulid::new())),
        AggregatorActor,
        AggregatorArguments {
            remote,
            concurrency,
            max_attempts,
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to spawn aggregator pool: {e}"))?;
    Ok(pool)
}
