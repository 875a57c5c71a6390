use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cluster::Layout;
use crate::config::Config;
use crate::engine::checkpoint::{CheckpointStore, FileCheckpoints, InFlight};
use crate::engine::queue::WorkQueue;
use crate::engine::task::{Body, TaskContext};
use crate::engine::tracker::Tracker;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::store::Store;

/// The blueprint for an engine.
///
/// `Blueprint` collects everything fixed before any task runs: the cluster
/// configuration and the catalogue of task bodies, addressed by name from
/// [`TaskSpec`](crate::TaskSpec)s. Once complete it is turned into an
/// [`Engine`] with [`Blueprint::finish`].
///
/// # Example
///
/// ```rust,no_run
/// use sluice::{Blueprint, Config, TaskSpec};
///
/// let mut blueprint = Blueprint::with_config(Config::local(1, 4));
/// blueprint.body("double", |ctx| {
///     let x = ctx.int(0)?;
///     ctx.set(0, x * 2)
/// });
/// let engine = blueprint.finish()?;
/// # Ok::<(), sluice::EngineError>(())
/// ```
pub struct Blueprint {
    config: Config,
    bodies: HashMap<Arc<str>, Body>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl Blueprint {
    /// A blueprint for the local default cluster.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            bodies: HashMap::new(),
            checkpoints: None,
        }
    }

    /// Register a body under `name`, replacing any earlier one.
    pub fn body<F>(&mut self, name: impl AsRef<str>, body: F) -> &mut Self
    where
        F: Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bodies.insert(Arc::from(name.as_ref()), Arc::new(body));
        self
    }

    /// Use `store` for checkpointed tasks instead of the file named in the
    /// configuration.
    pub fn checkpoints(&mut self, store: Arc<dyn CheckpointStore>) -> &mut Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn finish(self) -> Result<Engine, EngineError> {
        let layout = Layout::from_config(&self.config)?;

        let checkpoints = match (self.checkpoints, &self.config.checkpoint) {
            (Some(store), _) => Some(store),
            (None, Some(file)) => Some(Arc::new(FileCheckpoints::open(&file.path, file.flush)?) as Arc<dyn CheckpointStore>),
            (None, None) => None,
        };

        let soft_wait = Duration::from_millis(self.config.soft_target_wait_ms);
        tracing::debug!(
            ranks = layout.size(),
            hosts = layout.host_count(),
            bodies = self.bodies.len(),
            "engine ready"
        );

        Ok(Engine {
            store: Store::new(self.config.read_refcounts),
            queue: WorkQueue::new(layout.clone(), soft_wait),
            layout,
            config: self.config,
            bodies: self.bodies,
            tracker: Tracker::default(),
            checkpoints,
            in_flight: InFlight::default(),
            failures: Mutex::new(Vec::new()),
        })
    }
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}
