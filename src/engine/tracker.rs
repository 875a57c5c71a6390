//! Task table and input waits.
//!
//! A registered task carries a count of outstanding inputs plus one guard
//! for its own registration. Each input installs a listener that decrements
//! the count exactly once; whoever takes it to zero flips the `fired` flag
//! and queues the task, so a task is handed to the dispatcher at most once.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::core::{DatumId, TaskId};
use crate::engine::task::{Input, TaskSpec};
use crate::engine::Engine;
use crate::error::{DataError, EngineError};
use crate::store::Listener;
use crate::value::Key;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    Registered,
    Waiting,
    Ready,
    Dispatched,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Registered => "registered",
            TaskState::Waiting => "waiting",
            TaskState::Ready => "ready",
            TaskState::Dispatched => "dispatched",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub(crate) struct TaskEntry {
    pub(crate) id: TaskId,
    pub(crate) spec: TaskSpec,
    outstanding: AtomicUsize,
    fired: AtomicBool,
    state: Mutex<TaskState>,
}

impl TaskEntry {
    pub(crate) fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        *self.state.lock() = state;
    }

    /// Count one input as satisfied. True exactly once, for the call that
    /// satisfies the last one.
    fn satisfy(&self) -> bool {
        let before = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        before == 1 && !self.fired.swap(true, Ordering::AcqRel)
    }
}

/// Live tasks. Completed tasks are dropped from the table and only counted,
/// so long runs that keep spawning continuations stay bounded.
#[derive(Default)]
pub(crate) struct Tracker {
    tasks: RwLock<HashMap<TaskId, Arc<TaskEntry>>>,
    next_id: AtomicU64,
    retired: AtomicUsize,
}

impl Tracker {
    pub(crate) fn register(&self, spec: TaskSpec) -> Arc<TaskEntry> {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(TaskEntry {
            id,
            outstanding: AtomicUsize::new(spec.inputs.len() + 1),
            fired: AtomicBool::new(false),
            state: Mutex::new(TaskState::Registered),
            spec,
        });
        self.tasks.write().insert(id, entry.clone());
        entry
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<Arc<TaskEntry>> {
        self.tasks.read().get(&id).cloned()
    }

    /// Drop a completed task from the table.
    pub(crate) fn retire(&self, id: TaskId) {
        if self.tasks.write().remove(&id).is_some() {
            self.retired.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// State of `id`. Ids handed out but no longer in the table completed.
    pub(crate) fn state_of(&self, id: TaskId) -> Option<TaskState> {
        match self.get(id) {
            Some(entry) => Some(entry.state()),
            None if id.0 < self.next_id.load(Ordering::Relaxed) => Some(TaskState::Completed),
            None => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub(crate) fn all(&self) -> Vec<Arc<TaskEntry>> {
        let mut all: Vec<_> = self.tasks.read().values().cloned().collect();
        all.sort_by_key(|entry| entry.id);
        all
    }

    pub(crate) fn counts(&self) -> BTreeMap<TaskState, usize> {
        let mut counts = BTreeMap::new();
        let retired = self.retired.load(Ordering::Relaxed);
        if retired > 0 {
            counts.insert(TaskState::Completed, retired);
        }
        for entry in self.tasks.read().values() {
            *counts.entry(entry.state()).or_default() += 1;
        }
        counts
    }

    /// Tasks that have not been dispatched yet.
    pub(crate) fn unfinished(&self) -> Vec<Arc<TaskEntry>> {
        self.all()
            .into_iter()
            .filter(|entry| {
                matches!(
                    entry.state(),
                    TaskState::Registered | TaskState::Waiting | TaskState::Ready
                )
            })
            .collect()
    }
}

impl Engine {
    /// Install the wait for one input of `task`.
    pub(crate) fn watch(&self, task: TaskId, input: &Input) {
        let done: Listener = Box::new(move |engine: &Engine| engine.input_ready(task));
        match input {
            Input::Closed(id) => wait_closed(self, *id, done),
            Input::Path(root, path) => wait_path(self, *root, Arc::from(path.as_slice()), 0, done),
            Input::Deep(root) => DeepWait::start(self, *root, done),
        }
    }

    pub(crate) fn input_ready(&self, task: TaskId) {
        let Some(entry) = self.tracker.get(task) else {
            return;
        };
        if entry.satisfy() {
            tracing::debug!(task = %entry.id, name = %entry.spec.name, "ready");
            entry.set_state(TaskState::Ready);
            self.queue.push(&entry);
        }
    }
}

fn wait_closed(engine: &Engine, id: DatumId, done: Listener) {
    match engine.store().subscribe(id, done) {
        Ok(None) => {}
        Ok(Some(done)) => done(engine),
        Err(err) => engine.fail(err.into()),
    }
}

/// Walk `path` one level at a time, subscribing to each subscript until it is
/// assigned, then wait for the leaf to close.
fn wait_path(engine: &Engine, current: DatumId, path: Arc<[Key]>, index: usize, done: Listener) {
    let Some(key) = path.get(index).cloned() else {
        return wait_closed(engine, current, done);
    };

    let step_key = key.clone();
    let step: Listener = Box::new(move |engine: &Engine| match engine.store().get(current, &step_key) {
        Ok(Some(member)) => wait_path(engine, member.id(), path, index + 1, done),
        Ok(None) => engine.fail(
            DataError::NoSuchKey {
                id: current,
                key: step_key,
            }
            .into(),
        ),
        Err(err) => engine.fail(err.into()),
    });

    match engine.store().subscribe_sub(current, &key, step) {
        Ok(None) => {}
        Ok(Some(step)) => step(engine),
        Err(err) => engine.fail(err.into()),
    }
}

/// State of one `wait deep`. Every datum reachable from the root is waited
/// on once. The references of each closed datum are recorded as edges, and
/// an edge that closes a path back to its own source is reported as a cycle,
/// however the datums on it were first reached.
struct DeepWait {
    root: DatumId,
    outstanding: AtomicUsize,
    graph: Mutex<Reached>,
    done: Mutex<Option<Listener>>,
}

#[derive(Default)]
struct Reached {
    visited: HashSet<DatumId>,
    edges: HashMap<DatumId, Vec<DatumId>>,
}

impl Reached {
    /// Path from `from` to `to` over the edges recorded so far.
    fn path(&self, from: DatumId, to: DatumId) -> Option<Vec<DatumId>> {
        let mut parents = HashMap::from([(from, from)]);
        let mut queue = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            if node == to {
                let mut path = vec![to];
                let mut current = to;
                while current != from {
                    current = parents[&current];
                    path.push(current);
                }
                path.reverse();
                return Some(path);
            }
            for next in self.edges.get(&node).into_iter().flatten() {
                if !parents.contains_key(next) {
                    parents.insert(*next, node);
                    queue.push_back(*next);
                }
            }
        }
        None
    }

    /// Record the references of `node`. Returns the cycle they close, if any,
    /// otherwise the targets reached for the first time.
    fn add(&mut self, node: DatumId, targets: &[DatumId]) -> Result<Vec<DatumId>, Vec<DatumId>> {
        for target in targets {
            if let Some(mut cycle) = self.path(*target, node) {
                cycle.push(*target);
                return Err(cycle);
            }
        }
        self.edges.insert(node, targets.to_vec());
        Ok(targets
            .iter()
            .copied()
            .filter(|target| self.visited.insert(*target))
            .collect())
    }
}

impl DeepWait {
    fn start(engine: &Engine, root: DatumId, done: Listener) {
        let wait = Arc::new(DeepWait {
            root,
            outstanding: AtomicUsize::new(1),
            graph: Mutex::new(Reached {
                visited: HashSet::from([root]),
                edges: HashMap::new(),
            }),
            done: Mutex::new(Some(done)),
        });
        wait.drive(engine, vec![root]);
    }

    /// Subscribe to every datum on the worklist. Datums that are already
    /// closed are expanded in place rather than through their listener, so
    /// deep structures do not recurse.
    fn drive(self: &Arc<Self>, engine: &Engine, mut work: Vec<DatumId>) {
        while let Some(node) = work.pop() {
            let this = self.clone();
            let listener: Listener = Box::new(move |engine: &Engine| {
                let mut work = Vec::new();
                this.expand(engine, node, &mut work);
                this.drive(engine, work);
            });

            match engine.store().subscribe(node, listener) {
                Ok(None) => {}
                Ok(Some(_)) => self.expand(engine, node, &mut work),
                Err(err) => return engine.fail(err.into()),
            }
        }
    }

    /// `node` has closed: queue whatever it points at, then retire it.
    fn expand(&self, engine: &Engine, node: DatumId, work: &mut Vec<DatumId>) {
        let targets = match engine.store().references(node) {
            Ok(targets) => targets,
            // Freed data has no unclosed descendants left.
            Err(DataError::NotFound(_)) if engine.store().is_freed(node) => Vec::new(),
            Err(err) => return engine.fail(err.into()),
        };

        let added = self.graph.lock().add(node, &targets);
        match added {
            Ok(fresh) => {
                self.outstanding.fetch_add(fresh.len(), Ordering::AcqRel);
                work.extend(fresh);
            }
            Err(cycle) => {
                return engine.fail(EngineError::DeepWaitCycle {
                    root: self.root,
                    cycle,
                });
            }
        }

        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let done = self.done.lock().take();
            if let Some(done) = done {
                done(engine);
            }
        }
    }
}
