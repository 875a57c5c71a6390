//! Task engine: registration, readiness, placement and execution.
//!
//! The [`Engine`] owns the datum store and the task table. A task is
//! registered with the inputs it waits on; once they are all closed it is
//! queued, pulled by an idle rank of its work type and executed on the
//! worker pool. Bodies write their outputs and spawn further tasks through
//! their [`TaskContext`], which is how a run makes progress.

mod blueprint;
mod checkpoint;
mod queue;
mod runner;
mod task;
mod tracker;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cluster::Layout;
use crate::config::Config;
use crate::core::{DatumId, TaskId};
use crate::error::{ConfigError, DataError, EngineError};
use crate::store::{Notifications, Refs, Store};
use crate::value::{DatumType, Key, Value};

pub use crate::engine::blueprint::Blueprint;
pub use crate::engine::checkpoint::{CheckpointStore, FileCheckpoints, FlushPolicy, MemoryCheckpoints, fingerprint};
pub use crate::engine::runner::{Blocker, Diagnostics, PendingReport, PendingTask, TaskExecution};
pub use crate::engine::task::{Arg, Body, Input, TaskContext, TaskSpec};
pub use crate::engine::tracker::TaskState;

use crate::engine::checkpoint::InFlight;
use crate::engine::queue::WorkQueue;
use crate::engine::tracker::Tracker;

/// A configured engine, built from a [`Blueprint`].
///
/// Data and tasks can be added at any time, before a run or from inside a
/// running body. Every mutating call delivers the notifications it produces
/// before returning, so tasks that became ready are already queued.
pub struct Engine {
    pub(crate) store: Store,
    pub(crate) layout: Layout,
    pub(crate) config: Config,
    pub(crate) bodies: HashMap<Arc<str>, Body>,
    pub(crate) tracker: Tracker,
    pub(crate) queue: WorkQueue,
    pub(crate) checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub(crate) in_flight: InFlight,
    pub(crate) failures: Mutex<Vec<EngineError>>,
}

impl Engine {
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a task. It is queued as soon as all of its inputs are closed,
    /// which may be right away.
    pub fn add_task(&self, spec: TaskSpec) -> Result<TaskId, EngineError> {
        if !self.bodies.contains_key(&spec.body) {
            return Err(EngineError::UnknownBody(spec.body.to_string()));
        }
        if spec.work_type.index() >= self.layout.work_type_count() {
            return Err(ConfigError::UnknownWorkType(format!("#{}", spec.work_type.index())).into());
        }
        if spec.parallelism > 1 {
            let workers = self.layout.workers_for(spec.work_type).len();
            let reason = if spec.location.is_some() {
                Some("parallel tasks cannot be targeted".to_string())
            } else if spec.parallelism > workers {
                Some(format!("needs {} ranks, {workers} serve its work type", spec.parallelism))
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(EngineError::InvalidTask {
                    task: spec.name.to_string(),
                    reason,
                });
            }
        }

        let entry = self.tracker.register(spec);
        let task = entry.id;
        tracing::debug!(%task, name = %entry.spec.name, inputs = entry.spec.inputs.len(), "task registered");

        entry.set_state(TaskState::Waiting);
        for input in &entry.spec.inputs {
            self.watch(task, input);
        }
        // Release the registration guard.
        self.input_ready(task);
        Ok(task)
    }

    /// Run until every task has completed or nothing more can happen.
    pub fn run(&self) -> Result<Diagnostics, EngineError> {
        runner::run(self)
    }

    /// Tasks that have not run yet and what each one is waiting for.
    pub fn pending(&self) -> PendingReport {
        runner::pending_report(self)
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.tracker.state_of(task)
    }

    pub fn create(&self, ty: DatumType, refs: Refs) -> DatumId {
        self.store.create(ty, refs)
    }

    /// Assign a scalar, giving up one write reference.
    pub fn write(&self, id: DatumId, value: Value) -> Result<(), DataError> {
        let notifs = self.store.write(id, value, 1)?;
        self.notify(notifs);
        Ok(())
    }

    pub fn insert(&self, id: DatumId, key: Key, value: Value, decr_write: i64) -> Result<(), DataError> {
        let notifs = self.store.insert(id, key, value, decr_write)?;
        self.notify(notifs);
        Ok(())
    }

    pub fn insert_path(&self, id: DatumId, path: &[Key], value: Value, decr_write: i64) -> Result<(), DataError> {
        let notifs = self.store.insert_path(id, path, value, decr_write)?;
        self.notify(notifs);
        Ok(())
    }

    pub fn lookup(&self, id: DatumId, path: &[Key], leaf: DatumType, writers: i64) -> Result<DatumId, DataError> {
        let (found, notifs) = self.store.lookup(id, path, leaf, writers)?;
        self.notify(notifs);
        Ok(found)
    }

    pub fn append(&self, id: DatumId, value: Value, decr_write: i64) -> Result<(), DataError> {
        let notifs = self.store.append(id, value, decr_write)?;
        self.notify(notifs);
        Ok(())
    }

    pub fn update(&self, id: DatumId, operand: &Value, decr_write: i64) -> Result<(), DataError> {
        let notifs = self.store.update(id, operand, decr_write)?;
        self.notify(notifs);
        Ok(())
    }

    pub fn copy(&self, src: DatumId, refs: Refs) -> Result<DatumId, DataError> {
        let (id, notifs) = self.store.copy(src, refs)?;
        self.notify(notifs);
        Ok(id)
    }

    pub fn copy_into(&self, dst: DatumId, src: DatumId, decr_write: i64) -> Result<(), DataError> {
        let notifs = self.store.copy_into(dst, src, decr_write)?;
        self.notify(notifs);
        Ok(())
    }

    pub fn incr_ref(&self, id: DatumId, read: i64, write: i64) -> Result<(), DataError> {
        let notifs = self.store.incr_ref(id, read, write)?;
        self.notify(notifs);
        Ok(())
    }

    pub fn decr_ref(&self, id: DatumId, read: i64, write: i64) -> Result<(), DataError> {
        let notifs = self.store.decr_ref(id, read, write)?;
        self.notify(notifs);
        Ok(())
    }

    /// Deliver the listeners collected by a store operation.
    fn notify(&self, notifs: Notifications) {
        if !notifs.closed.is_empty() {
            tracing::trace!(closed = ?notifs.closed, "closed");
        }
        for listener in notifs.listeners {
            listener(self);
        }
    }

    /// Record an error raised outside of any task, e.g. by a listener.
    pub(crate) fn fail(&self, err: EngineError) {
        tracing::error!("{err}");
        self.failures.lock().push(err);
    }

    pub(crate) fn take_failures(&self) -> Vec<EngineError> {
        std::mem::take(&mut *self.failures.lock())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use anyhow::anyhow;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::cluster::Location;
    use crate::config::CheckpointConfig;
    use crate::core::Rank;
    use crate::value::{KeyType, MergeOp};

    fn engine(config: Config, setup: impl FnOnce(&mut Blueprint)) -> Engine {
        let mut blueprint = Blueprint::with_config(config);
        setup(&mut blueprint);
        blueprint.finish().unwrap()
    }

    fn scalar(engine: &Engine) -> DatumId {
        engine.create(DatumType::Scalar, Refs::default())
    }

    fn int(engine: &Engine, id: DatumId) -> i64 {
        engine.store().read(id).unwrap().as_int().unwrap()
    }

    #[test]
    fn test_simple_chain() {
        let engine = engine(Config::local(1, 2), |bp| {
            bp.body("double", |ctx| {
                let x = ctx.int(0)?;
                ctx.set(0, x * 2)
            });
        });
        let a = scalar(&engine);
        let b = scalar(&engine);
        let c = scalar(&engine);
        engine.add_task(TaskSpec::new("double").read(b).output(c)).unwrap();
        engine.add_task(TaskSpec::new("double").read(a).output(b)).unwrap();
        engine.write(a, Value::Int(5)).unwrap();

        let diagnostics = engine.run().unwrap();
        assert_eq!(int(&engine, c), 20);
        assert_eq!(diagnostics.completed(), 2);
        assert!(diagnostics.render_mermaid().contains("-- \"<2>\" -->"));
    }

    #[test]
    fn test_container_closes_after_all_inserts() {
        let engine = engine(Config::local(1, 4), |bp| {
            bp.body("put", |ctx| {
                let map = ctx.arg(0)?.as_ref_id().ok_or_else(|| anyhow!("not a ref"))?;
                let key = ctx.int(1)?;
                ctx.insert(map, key, key * 10, 1)
            });
            bp.body("size", |ctx| {
                let map = ctx.arg(0)?.as_ref_id().ok_or_else(|| anyhow!("not a ref"))?;
                let size = ctx.iterate(map)?.len() as i64;
                ctx.set(0, size)
            });
        });

        let map = engine.create(DatumType::map(KeyType::Int), Refs::new(1, 16));
        let size = scalar(&engine);
        engine
            .add_task(TaskSpec::new("size").input(Input::Closed(map)).arg(map).output(size))
            .unwrap();
        for i in 0..16 {
            engine.add_task(TaskSpec::new("put").arg(map).arg(i)).unwrap();
        }

        engine.run().unwrap();
        assert_eq!(int(&engine, size), 16);
        assert_eq!(engine.store().values(map).unwrap().len(), 16);
    }

    #[test]
    fn test_concurrent_increments() {
        const N: i64 = 64;
        let engine = engine(Config::local(1, 8), |bp| {
            bp.body("incr", |ctx| {
                let counter = ctx.arg(0)?.as_ref_id().ok_or_else(|| anyhow!("not a ref"))?;
                ctx.update(counter, 1, 1)
            });
            bp.body("report", |ctx| {
                let total = ctx.int(0)?;
                ctx.set(0, total)
            });
        });

        let counter = engine.create(DatumType::updateable(MergeOp::Incr, 0), Refs::new(1, N));
        let total = scalar(&engine);
        engine.add_task(TaskSpec::new("report").read(counter).output(total)).unwrap();
        for _ in 0..N {
            engine.add_task(TaskSpec::new("incr").arg(Value::Ref(counter))).unwrap();
        }

        engine.run().unwrap();
        assert_eq!(int(&engine, total), N);
    }

    #[test]
    fn test_double_write_fails_the_run() {
        let engine = engine(Config::local(1, 2), |bp| {
            bp.body("write", |ctx| ctx.set(0, 1));
        });
        let x = scalar(&engine);
        engine.add_task(TaskSpec::new("write").name("first").output(x)).unwrap();
        engine.add_task(TaskSpec::new("write").name("second").output(x)).unwrap();

        let Err(EngineError::Failed { first, during_drain }) = engine.run() else {
            panic!("expected a failed run");
        };
        assert!(during_drain.is_empty());
        let EngineError::TaskFailed { source, .. } = *first else {
            panic!("expected a task failure");
        };
        assert!(matches!(
            source.downcast_ref::<DataError>(),
            Some(DataError::DoubleWrite { key: None, .. })
        ));
        assert_eq!(int(&engine, x), 1);
    }

    #[test]
    fn test_deep_wait_blocks_on_referenced_data() {
        let engine = engine(Config::local(1, 1), |bp| {
            bp.body("done", |ctx| ctx.set(0, true));
        });

        let outer = engine.create(DatumType::map(KeyType::Int), Refs::default());
        let inner = scalar(&engine);
        engine.insert(outer, Key::from(0), Value::Ref(inner), 1).unwrap();
        assert!(engine.store().is_closed(outer).unwrap());

        let flag = scalar(&engine);
        let task = engine
            .add_task(TaskSpec::new("done").input(Input::Deep(outer)).output(flag))
            .unwrap();

        let Err(EngineError::Stalled(report)) = engine.run() else {
            panic!("expected a stall");
        };
        assert_eq!(report.len(), 1);
        assert_eq!(
            report.tasks[0].blockers,
            vec![Blocker::Deep {
                root: outer,
                unclosed: inner
            }]
        );

        engine.write(inner, Value::Int(7)).unwrap();
        engine.run().unwrap();
        assert_eq!(engine.task_state(task), Some(TaskState::Completed));
        assert_eq!(engine.store().read(flag).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_deep_wait_reports_cycles() {
        let engine = engine(Config::local(1, 1), |bp| {
            bp.body("never", |_| Ok(()));
        });

        let a = engine.create(DatumType::map(KeyType::Int), Refs::default());
        let b = engine.create(DatumType::map(KeyType::Int), Refs::default());
        engine.insert(b, Key::from(0), Value::Ref(a), 1).unwrap();
        engine.insert(a, Key::from(0), Value::Ref(b), 1).unwrap();
        engine.add_task(TaskSpec::new("never").input(Input::Deep(a))).unwrap();

        let Err(EngineError::Failed { first, .. }) = engine.run() else {
            panic!("expected a failed run");
        };
        let EngineError::DeepWaitCycle { root, cycle } = *first else {
            panic!("expected a cycle");
        };
        assert_eq!(root, a);
        assert_eq!(cycle, vec![a, b, a]);
    }

    #[test]
    fn test_deep_wait_reports_cycle_behind_shared_member() {
        let engine = engine(Config::local(1, 1), |bp| {
            bp.body("never", |_| Ok(()));
        });

        let map = || engine.create(DatumType::map(KeyType::Int), Refs::default());
        let (a, b, c) = (map(), map(), map());
        engine.insert(b, Key::from(0), Value::Ref(c), 1).unwrap();
        engine.insert(c, Key::from(0), Value::Ref(b), 1).unwrap();
        engine.insert(a, Key::from(0), Value::Ref(b), 0).unwrap();
        engine.insert(a, Key::from(1), Value::Ref(c), 1).unwrap();
        let task = engine.add_task(TaskSpec::new("never").input(Input::Deep(a))).unwrap();

        let Err(EngineError::Failed { first, .. }) = engine.run() else {
            panic!("expected a failed run");
        };
        let EngineError::DeepWaitCycle { root, cycle } = *first else {
            panic!("expected a cycle");
        };
        assert_eq!(root, a);
        assert!(cycle == vec![b, c, b] || cycle == vec![c, b, c], "{cycle:?}");
        assert_eq!(engine.task_state(task), Some(TaskState::Waiting));
    }

    #[test]
    fn test_deep_wait_on_nested_struct_needs_every_leaf() {
        for skipped in 0..3 {
            let engine = engine(Config::local(1, 1), |bp| {
                bp.body("done", |ctx| ctx.set(0, true));
            });

            let s = engine.create(DatumType::structure(["m", "t", "z"]), Refs::default());
            let m = engine
                .lookup(s, &[Key::from("m")], DatumType::map(KeyType::Int), 0)
                .unwrap();
            let t = engine
                .lookup(s, &[Key::from("t")], DatumType::structure(["x"]), 0)
                .unwrap();
            engine.insert(m, Key::from(0), Value::Int(0), 0).unwrap();
            let leaves = [
                engine.lookup(m, &[Key::from(1)], DatumType::Scalar, 1).unwrap(),
                engine.lookup(t, &[Key::from("x")], DatumType::Scalar, 1).unwrap(),
                engine.lookup(s, &[Key::from("z")], DatumType::Scalar, 1).unwrap(),
            ];
            engine.decr_ref(s, 0, 1).unwrap();

            let flag = scalar(&engine);
            let task = engine
                .add_task(TaskSpec::new("done").input(Input::Deep(s)).output(flag))
                .unwrap();
            for (i, leaf) in leaves.iter().enumerate() {
                if i != skipped {
                    engine.write(*leaf, Value::Int(i as i64)).unwrap();
                }
            }

            let Err(EngineError::Stalled(report)) = engine.run() else {
                panic!("expected a stall with leaf {skipped} unwritten");
            };
            assert_eq!(engine.task_state(task), Some(TaskState::Waiting));
            assert!(matches!(
                report.tasks[0].blockers.as_slice(),
                [Blocker::Deep { root, .. }] if *root == s
            ));

            engine.write(leaves[skipped], Value::Int(-1)).unwrap();
            engine.run().unwrap();
            assert_eq!(engine.task_state(task), Some(TaskState::Completed));
            assert_eq!(engine.store().read(flag).unwrap(), Value::Bool(true));
        }
    }

    #[test]
    fn test_path_input_waits_for_nested_member() {
        let path = [Key::from("a"), Key::from(3)];
        let engine = engine(Config::local(1, 2), |bp| {
            bp.body("copy", |ctx| {
                let root = ctx.arg(0)?.as_ref_id().ok_or_else(|| anyhow!("not a ref"))?;
                let member = ctx.lookup(root, &[Key::from("a"), Key::from(3)], DatumType::Scalar, 0)?;
                let value = ctx.read(member)?;
                ctx.set(0, value)
            });
            bp.body("fill", |ctx| {
                let root = ctx.arg(0)?.as_ref_id().ok_or_else(|| anyhow!("not a ref"))?;
                ctx.insert_path(root, &[Key::from("a"), Key::from(3)], 42, 1)
            });
        });

        let root = engine.create(DatumType::map(KeyType::Str), Refs::default());
        let out = scalar(&engine);
        engine
            .add_task(
                TaskSpec::new("copy")
                    .input(Input::path(root, path.clone()))
                    .arg(root)
                    .output(out),
            )
            .unwrap();
        assert_eq!(engine.pending().tasks[0].blockers, vec![Blocker::Path(root, path.to_vec())]);
        engine.add_task(TaskSpec::new("fill").arg(root)).unwrap();

        engine.run().unwrap();
        assert_eq!(int(&engine, out), 42);
        assert!(engine.store().is_closed(root).unwrap());
    }

    #[test]
    fn test_copy_is_independent_across_tasks() {
        let engine = engine(Config::local(1, 2), |bp| {
            bp.body("copy", |ctx| {
                let src = ctx.arg(0)?.as_ref_id().ok_or_else(|| anyhow!("not a ref"))?;
                let dst = ctx.output(0)?;
                ctx.copy_into(dst, src, 1)
            });
        });

        let src = engine.create(DatumType::map(KeyType::Int), Refs::default());
        engine.insert(src, Key::from(1), Value::Int(1), 0).unwrap();
        let dst = engine.create(DatumType::map(KeyType::Int), Refs::default());
        engine
            .add_task(TaskSpec::new("copy").input(Input::Closed(src)).arg(src).output(dst))
            .unwrap();
        engine.decr_ref(src, 0, 1).unwrap();

        engine.run().unwrap();
        assert!(engine.store().is_closed(dst).unwrap());
        let copied = engine.store().get(dst, &Key::from(1)).unwrap().unwrap();
        let original = engine.store().get(src, &Key::from(1)).unwrap().unwrap();
        assert_ne!(copied.id(), original.id());
        assert_eq!(engine.store().values(dst).unwrap(), vec![(Key::from(1), Value::Int(1))]);
    }

    #[test]
    fn test_hard_location_is_honored() {
        let engine = engine(Config::local(1, 4), |bp| {
            bp.body("whereami", |ctx| ctx.set(0, ctx.rank().0 as i64));
        });

        let outputs: Vec<_> = (0..500).map(|_| scalar(&engine)).collect();
        for out in &outputs {
            engine
                .add_task(TaskSpec::new("whereami").location(Location::hard(Rank(3))).output(*out))
                .unwrap();
        }

        engine.run().unwrap();
        for out in outputs {
            assert_eq!(int(&engine, out), 3);
        }
    }

    #[test]
    fn test_soft_location_waits_for_target() {
        let mut config = Config::local(1, 4);
        config.soft_target_wait_ms = 60_000;
        let engine = engine(config, |bp| {
            bp.body("whereami", |ctx| ctx.set(0, ctx.rank().0 as i64));
        });

        let outputs: Vec<_> = (0..20).map(|_| scalar(&engine)).collect();
        for out in &outputs {
            engine
                .add_task(TaskSpec::new("whereami").location(Location::soft(Rank(2))).output(*out))
                .unwrap();
        }

        engine.run().unwrap();
        for out in outputs {
            assert_eq!(int(&engine, out), 2);
        }
    }

    #[test]
    fn test_soft_location_falls_back_when_target_busy() {
        let mut config = Config::local(1, 4);
        config.soft_target_wait_ms = 0;
        let released = Arc::new(AtomicBool::new(false));

        let engine = engine(config, |bp| {
            let flag = released.clone();
            bp.body("hold", move |_| {
                let deadline = Instant::now() + Duration::from_secs(5);
                while !flag.load(Ordering::Acquire) {
                    if Instant::now() > deadline {
                        return Err(anyhow!("never released"));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            });
            let flag = released.clone();
            bp.body("release", move |ctx| {
                flag.store(true, Ordering::Release);
                ctx.set(0, ctx.rank().0 as i64)
            });
        });

        let out = scalar(&engine);
        engine
            .add_task(TaskSpec::new("hold").location(Location::hard(Rank(2))).priority(10))
            .unwrap();
        engine
            .add_task(TaskSpec::new("release").location(Location::soft(Rank(2))).output(out))
            .unwrap();

        engine.run().unwrap();
        assert_ne!(int(&engine, out), 2);
    }

    #[test]
    fn test_unavailable_location_stalls() {
        let engine = engine(Config::local(1, 2), |bp| {
            bp.body("noop", |_| Ok(()));
        });
        engine
            .add_task(TaskSpec::new("noop").name("lost").location(Location::hard(Rank(99))))
            .unwrap();

        let Err(EngineError::Stalled(report)) = engine.run() else {
            panic!("expected a stall");
        };
        let lost: Vec<_> = report.unavailable().collect();
        assert_eq!(lost.len(), 1);
        assert_eq!(&*lost[0].name, "lost");
        assert_eq!(lost[0].state, TaskState::Ready);
    }

    #[test]
    fn test_stall_names_missing_input() {
        let engine = engine(Config::local(1, 1), |bp| {
            bp.body("noop", |_| Ok(()));
        });
        let never = scalar(&engine);
        engine.add_task(TaskSpec::new("noop").read(never)).unwrap();

        let Err(EngineError::Stalled(report)) = engine.run() else {
            panic!("expected a stall");
        };
        assert_eq!(report.tasks[0].blockers, vec![Blocker::Datum(never)]);
        assert!(report.to_string().contains(&format!("waits on {never}")));
    }

    #[test]
    fn test_checkpoint_skips_second_execution() {
        let runs = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryCheckpoints::new());

        for _ in 0..2 {
            let counter = runs.clone();
            let mut blueprint = Blueprint::with_config(Config::local(1, 1));
            blueprint.body("square", move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                let x = ctx.int(0)?;
                ctx.set(0, x * x)
            });
            blueprint.checkpoints(store.clone());
            let engine = blueprint.finish().unwrap();

            let out = scalar(&engine);
            engine
                .add_task(TaskSpec::new("square").arg(6).output(out).checkpoint())
                .unwrap();
            engine.run().unwrap();
            assert_eq!(int(&engine, out), 36);
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_checkpoint_shared_by_concurrent_tasks() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut blueprint = Blueprint::with_config(Config::local(1, 4));
        blueprint.body("square", move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            let x = ctx.int(0)?;
            ctx.set(0, x * x)
        });
        blueprint.checkpoints(Arc::new(MemoryCheckpoints::new()));
        let engine = blueprint.finish().unwrap();

        let outputs: Vec<_> = (0..2).map(|_| scalar(&engine)).collect();
        for out in &outputs {
            engine
                .add_task(TaskSpec::new("square").arg(6).output(*out).checkpoint())
                .unwrap();
        }

        let diagnostics = engine.run().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(diagnostics.cached(), 1);
        for out in outputs {
            assert_eq!(int(&engine, out), 36);
        }
    }

    #[test]
    fn test_checkpoint_file_survives_engines() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("checkpoints.cbor")).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        for expected_cached in [0, 1] {
            let mut config = Config::local(1, 1);
            config.checkpoint = Some(CheckpointConfig {
                path: path.clone(),
                flush: FlushPolicy::OnClose,
            });
            let counter = runs.clone();
            let engine = engine(config, |bp| {
                bp.body("greet", move |ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let name = ctx.str(0)?.to_string();
                    ctx.set(0, format!("hello {name}"))
                });
            });

            let out = scalar(&engine);
            engine
                .add_task(TaskSpec::new("greet").arg("world").output(out).checkpoint())
                .unwrap();
            let diagnostics = engine.run().unwrap();
            assert_eq!(diagnostics.cached(), expected_cached);
            assert_eq!(engine.store().read(out).unwrap(), Value::from("hello world"));
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failures_drain_in_flight_tasks() {
        let engine = engine(Config::local(1, 2), |bp| {
            bp.body("fast", |_| Err(anyhow!("fast failure")));
            bp.body("slow", |_| {
                std::thread::sleep(Duration::from_millis(100));
                Err(anyhow!("slow failure"))
            });
            bp.body("after", |_| Ok(()));
        });
        let gate = scalar(&engine);
        engine.add_task(TaskSpec::new("fast").output(gate)).unwrap();
        engine.add_task(TaskSpec::new("slow")).unwrap();
        let after = engine.add_task(TaskSpec::new("after").read(gate)).unwrap();

        let Err(EngineError::Failed { first, during_drain }) = engine.run() else {
            panic!("expected a failed run");
        };
        assert!(first.to_string().contains("fast failure"));
        assert_eq!(during_drain.len(), 1);
        assert!(during_drain[0].to_string().contains("slow failure"));
        assert_eq!(engine.task_state(after), Some(TaskState::Waiting));
    }

    #[test]
    fn test_panicking_body_is_reported() {
        let engine = engine(Config::local(1, 1), |bp| {
            bp.body("boom", |_| panic!("kaboom"));
        });
        engine.add_task(TaskSpec::new("boom")).unwrap();

        let Err(EngineError::Failed { first, .. }) = engine.run() else {
            panic!("expected a failed run");
        };
        assert!(first.to_string().contains("Task panicked: kaboom"));
    }

    #[test]
    fn test_assertion_failure() {
        let engine = engine(Config::local(1, 1), |bp| {
            bp.body("assert_eq", |ctx| {
                let (a, b) = (ctx.int(0)?, ctx.int(1)?);
                if a != b {
                    return Err(anyhow!("{a} != {b}"));
                }
                Ok(())
            });
        });
        engine
            .add_task(TaskSpec::new("assert_eq").arg(1).arg(2).assertion())
            .unwrap();

        let Err(EngineError::Failed { first, .. }) = engine.run() else {
            panic!("expected a failed run");
        };
        let EngineError::Assertion { task, message } = *first else {
            panic!("expected an assertion failure");
        };
        assert_eq!(task, "assert_eq");
        assert_eq!(message, "1 != 2");
    }

    #[test]
    fn test_spawned_continuation() {
        let engine = engine(Config::local(1, 2), |bp| {
            bp.body("outer", |ctx| {
                let tmp = ctx.create(DatumType::Scalar, Refs::default());
                let out = ctx.output(0)?;
                ctx.spawn(TaskSpec::new("inner").control().read(tmp).output(out))?;
                ctx.write(tmp, 20)
            });
            bp.body("inner", |ctx| {
                let x = ctx.int(0)?;
                ctx.set(0, x + 1)
            });
        });
        let out = scalar(&engine);
        engine.add_task(TaskSpec::new("outer").output(out)).unwrap();

        let diagnostics = engine.run().unwrap();
        assert_eq!(int(&engine, out), 21);
        assert_eq!(diagnostics.completed(), 2);
        let inner = diagnostics
            .executions
            .values()
            .find(|exec| &*exec.name == "inner")
            .unwrap();
        assert_eq!(inner.rank, Rank(0));
    }

    #[test]
    fn test_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let engine = engine(Config::local(1, 1), |bp| {
            let order = order.clone();
            bp.body("log", move |ctx| {
                order.lock().push(ctx.int(0)?);
                Ok(())
            });
        });
        for priority in [1, 5, 3] {
            engine
                .add_task(TaskSpec::new("log").arg(i64::from(priority)).priority(priority))
                .unwrap();
        }

        engine.run().unwrap();
        assert_eq!(*order.lock(), vec![5, 3, 1]);
    }

    #[test]
    fn test_unknown_body_rejected() {
        let engine = engine(Config::local(1, 1), |_| {});
        assert!(matches!(
            engine.add_task(TaskSpec::new("missing")),
            Err(EngineError::UnknownBody(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_container_reference_follows_later_insert() {
        let engine = engine(Config::local(1, 2), |bp| {
            bp.body("inc", |ctx| {
                let x = ctx.int(0)?;
                ctx.set(0, x + 1)
            });
        });

        let a = engine.create(DatumType::map(KeyType::Int), Refs::default());
        let r = scalar(&engine);
        let out = scalar(&engine);
        engine.container_reference(a, Key::from(3), r).unwrap();
        engine.add_task(TaskSpec::new("inc").read(r).output(out)).unwrap();
        assert!(!engine.store().is_closed(r).unwrap());

        engine.insert(a, Key::from(3), Value::Int(41), 1).unwrap();
        engine.run().unwrap();
        assert_eq!(int(&engine, out), 42);
    }

    #[test]
    fn test_container_reference_waits_for_reserved_member() {
        let engine = engine(Config::local(1, 1), |_| {});
        let a = engine.create(DatumType::map(KeyType::Int), Refs::default());
        let member = engine.lookup(a, &[Key::from(0)], DatumType::Scalar, 1).unwrap();
        engine.decr_ref(a, 0, 1).unwrap();

        let r = scalar(&engine);
        engine.container_reference(a, Key::from(0), r).unwrap();
        assert!(!engine.store().is_closed(r).unwrap());

        engine.write(member, Value::from("late")).unwrap();
        assert_eq!(engine.store().read(r).unwrap(), Value::from("late"));
    }

    #[test]
    fn test_container_reference_to_nested_container() {
        let engine = engine(Config::local(1, 1), |_| {});
        let a = engine.create(DatumType::map(KeyType::Int), Refs::default());
        engine
            .insert_path(a, &[Key::from(1), Key::from(2)], Value::Int(3), 1)
            .unwrap();
        let inner = engine.store().resolve(a, &[Key::from(1)]).unwrap().unwrap();

        let r = scalar(&engine);
        engine.container_reference(a, Key::from(1), r).unwrap();
        assert_eq!(engine.store().read(r).unwrap(), Value::Ref(inner));
    }

    #[test]
    fn test_container_reference_to_missing_key() {
        let engine = engine(Config::local(1, 1), |_| {});
        let closed = engine.create(DatumType::map(KeyType::Int), Refs::closed());
        let r = scalar(&engine);
        assert_eq!(
            engine.container_reference(closed, Key::from(0), r),
            Err(DataError::NoSuchKey {
                id: closed,
                key: Key::from(0),
            })
        );

        // Closing without the key is reported once the run looks at failures.
        let open = engine.create(DatumType::map(KeyType::Int), Refs::default());
        engine.container_reference(open, Key::from(0), r).unwrap();
        engine.decr_ref(open, 0, 1).unwrap();
        let Err(EngineError::Failed { first, .. }) = engine.run() else {
            panic!("expected a failed run");
        };
        assert!(matches!(*first, EngineError::Data(DataError::NoSuchKey { .. })));
    }

    #[test]
    fn test_parallel_task_holds_several_ranks() {
        let engine = engine(Config::local(1, 4), |bp| {
            bp.body("wide", |ctx| {
                let ranks: Vec<i64> = ctx.ranks().iter().map(|r| r.0 as i64).collect();
                ctx.set(0, ranks.len() as i64)?;
                ctx.set(1, ranks.iter().sum::<i64>())
            });
        });

        let count = scalar(&engine);
        let sum = scalar(&engine);
        engine
            .add_task(TaskSpec::new("wide").parallelism(3).output(count).output(sum))
            .unwrap();

        let diagnostics = engine.run().unwrap();
        assert_eq!(int(&engine, count), 3);
        // Three distinct worker ranks out of 1..=4.
        assert!((6..=9).contains(&int(&engine, sum)));
        let exec = diagnostics.executions.values().next().unwrap();
        assert_eq!(exec.ranks.len(), 3);
        assert_eq!(exec.ranks[0], exec.rank);
    }

    #[test]
    fn test_parallel_task_rejected_when_unschedulable() {
        let engine = engine(Config::local(1, 2), |bp| {
            bp.body("wide", |_| Ok(()));
        });
        assert!(matches!(
            engine.add_task(TaskSpec::new("wide").parallelism(3)),
            Err(EngineError::InvalidTask { .. })
        ));
        assert!(matches!(
            engine.add_task(TaskSpec::new("wide").parallelism(2).location(Location::soft(Rank(1)))),
            Err(EngineError::InvalidTask { .. })
        ));
        assert!(engine.add_task(TaskSpec::new("wide").parallelism(2)).is_ok());
    }

    #[test]
    fn test_completed_tasks_are_released() {
        const DEPTH: i64 = 200;
        let engine = engine(Config::local(1, 2), |bp| {
            bp.body("step", |ctx| {
                let n = ctx.int(0)?;
                if n == 0 {
                    return ctx.set(0, 0);
                }
                let out = ctx.output(0)?;
                ctx.spawn(TaskSpec::new("step").arg(n - 1).output(out))?;
                Ok(())
            });
        });

        let out = scalar(&engine);
        let first = engine.add_task(TaskSpec::new("step").arg(DEPTH).output(out)).unwrap();
        let diagnostics = engine.run().unwrap();

        assert_eq!(int(&engine, out), 0);
        assert_eq!(diagnostics.completed(), DEPTH as usize + 1);
        assert_eq!(engine.tracker.len(), 0);
        assert_eq!(engine.task_state(first), Some(TaskState::Completed));
    }
}
