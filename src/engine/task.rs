use std::sync::Arc;

use anyhow::{Context, anyhow};

use crate::cluster::{Location, WorkType};
use crate::core::{DatumId, Rank, TaskId};
use crate::engine::Engine;
use crate::error::DataError;
use crate::store::{Member, Refs};
use crate::value::{DatumType, Key, Value};

/// A registered task body. Bodies are opaque to the engine: they read their
/// resolved arguments, write their outputs through the context and report
/// failure by returning an error.
pub type Body = Arc<dyn Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Something a task waits for before it becomes ready.
#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    /// The datum itself has closed.
    Closed(DatumId),
    /// The member at a subscript path exists and has closed.
    Path(DatumId, Vec<Key>),
    /// The datum and everything transitively reachable from it have closed.
    Deep(DatumId),
}

impl Input {
    pub fn path<I, K>(root: DatumId, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        Input::Path(root, keys.into_iter().map(Into::into).collect())
    }

    pub fn root(&self) -> DatumId {
        match self {
            Input::Closed(id) | Input::Path(id, _) | Input::Deep(id) => *id,
        }
    }
}

/// Argument passed to a body.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    /// Literal value.
    Value(Value),
    /// Read from the store when the task executes. Compound datums are passed
    /// as [`Value::Ref`].
    Datum(DatumId),
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<DatumId> for Arg {
    fn from(id: DatumId) -> Self {
        Arg::Datum(id)
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Value(value.into())
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Value(value.into())
    }
}

/// Descriptor of a task, as emitted by a front end.
#[derive(Clone, Debug)]
pub struct TaskSpec {
    pub name: Arc<str>,
    /// Name of the body in the blueprint's catalogue.
    pub body: Arc<str>,
    pub args: Vec<Arg>,
    pub inputs: Vec<Input>,
    /// Datums the body promises to write.
    pub outputs: Vec<DatumId>,
    pub work_type: WorkType,
    pub location: Option<Location>,
    /// Higher runs first.
    pub priority: i32,
    /// Number of ranks of `work_type` the task occupies at once.
    pub parallelism: usize,
    /// Satisfy from the checkpoint store when possible.
    pub checkpoint: bool,
    /// Failures are reported as assertion failures.
    pub assertion: bool,
}

impl TaskSpec {
    /// A worker-tier task running `body`, named after it.
    pub fn new(body: impl AsRef<str>) -> Self {
        let body: Arc<str> = Arc::from(body.as_ref());
        Self {
            name: body.clone(),
            body,
            args: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            work_type: WorkType::WORK,
            location: None,
            priority: 0,
            parallelism: 1,
            checkpoint: false,
            assertion: false,
        }
    }

    pub fn name(mut self, name: impl AsRef<str>) -> Self {
        self.name = Arc::from(name.as_ref());
        self
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn input(mut self, input: Input) -> Self {
        self.inputs.push(input);
        self
    }

    /// Wait for `id` to close and pass its value as the next argument.
    pub fn read(self, id: DatumId) -> Self {
        self.input(Input::Closed(id)).arg(id)
    }

    pub fn output(mut self, id: DatumId) -> Self {
        self.outputs.push(id);
        self
    }

    pub fn work_type(mut self, work_type: WorkType) -> Self {
        self.work_type = work_type;
        self
    }

    /// Run on the control tier.
    pub fn control(self) -> Self {
        self.work_type(WorkType::CONTROL)
    }

    pub fn location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Run on `ranks` idle ranks of the work type together. Parallel tasks
    /// cannot carry a location.
    pub fn parallelism(mut self, ranks: usize) -> Self {
        self.parallelism = ranks.max(1);
        self
    }

    pub fn checkpoint(mut self) -> Self {
        self.checkpoint = true;
        self
    }

    pub fn assertion(mut self) -> Self {
        self.assertion = true;
        self
    }
}

/// Handle a body gets on the engine while it runs.
///
/// Every mutating call delivers the resulting notifications before it
/// returns, so tasks unblocked by a write are queued by the time the body
/// moves on.
pub struct TaskContext<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) task: TaskId,
    pub(crate) spec: &'a TaskSpec,
    pub(crate) rank: Rank,
    pub(crate) ranks: Vec<Rank>,
    pub(crate) args: Vec<Value>,
}

impl<'a> TaskContext<'a> {
    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Rank this task is executing on. For a parallel task, the first of
    /// its ranks.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Every rank held by this task, one unless it is parallel.
    pub fn ranks(&self) -> &[Rank] {
        &self.ranks
    }

    pub fn host(&self) -> &str {
        self.engine.layout().host_of(self.rank).unwrap_or("unknown")
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> anyhow::Result<&Value> {
        self.args
            .get(index)
            .ok_or_else(|| anyhow!("missing argument {index}"))
    }

    pub fn int(&self, index: usize) -> anyhow::Result<i64> {
        let value = self.arg(index)?;
        value
            .as_int()
            .ok_or_else(|| anyhow!("argument {index} is {}, expected int", value.type_name()))
    }

    pub fn str(&self, index: usize) -> anyhow::Result<&str> {
        let value = self.arg(index)?;
        value
            .as_str()
            .ok_or_else(|| anyhow!("argument {index} is {}, expected string", value.type_name()))
    }

    pub fn output(&self, index: usize) -> anyhow::Result<DatumId> {
        self.spec
            .outputs
            .get(index)
            .copied()
            .ok_or_else(|| anyhow!("missing output {index}"))
    }

    pub fn read(&self, id: DatumId) -> anyhow::Result<Value> {
        Ok(self.engine.store().read(id)?)
    }

    pub fn read_current(&self, id: DatumId) -> anyhow::Result<Value> {
        Ok(self.engine.store().read_current(id)?)
    }

    /// Assign a scalar, giving up one write reference.
    pub fn write(&self, id: DatumId, value: impl Into<Value>) -> anyhow::Result<()> {
        Ok(self.engine.write(id, value.into())?)
    }

    /// Write output `index`.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> anyhow::Result<()> {
        let id = self.output(index)?;
        self.write(id, value)
            .with_context(|| format!("writing output {index} of {}", self.spec.name))
    }

    pub fn insert(&self, id: DatumId, key: impl Into<Key>, value: impl Into<Value>, decr_write: i64) -> anyhow::Result<()> {
        Ok(self.engine.insert(id, key.into(), value.into(), decr_write)?)
    }

    pub fn insert_path(&self, id: DatumId, path: &[Key], value: impl Into<Value>, decr_write: i64) -> anyhow::Result<()> {
        Ok(self.engine.insert_path(id, path, value.into(), decr_write)?)
    }

    pub fn lookup(&self, id: DatumId, path: &[Key], leaf: DatumType, writers: i64) -> anyhow::Result<DatumId> {
        Ok(self.engine.lookup(id, path, leaf, writers)?)
    }

    pub fn get(&self, id: DatumId, key: impl Into<Key>) -> anyhow::Result<Option<Member>> {
        Ok(self.engine.store().get(id, &key.into())?)
    }

    pub fn iterate(&self, id: DatumId) -> anyhow::Result<Vec<(Key, Member)>> {
        Ok(self.engine.store().iterate(id)?.collect())
    }

    /// At most `count` members starting at position `offset`.
    pub fn enumerate(&self, id: DatumId, offset: usize, count: Option<usize>) -> anyhow::Result<Vec<(Key, Member)>> {
        Ok(self.engine.store().enumerate(id, offset, count)?.collect())
    }

    /// Write `id[key]` into the scalar `target` once it is assigned.
    pub fn container_reference(&self, id: DatumId, key: impl Into<Key>, target: DatumId) -> anyhow::Result<()> {
        Ok(self.engine.container_reference(id, key.into(), target)?)
    }

    pub fn append(&self, id: DatumId, value: impl Into<Value>, decr_write: i64) -> anyhow::Result<()> {
        Ok(self.engine.append(id, value.into(), decr_write)?)
    }

    pub fn update(&self, id: DatumId, operand: impl Into<Value>, decr_write: i64) -> anyhow::Result<()> {
        Ok(self.engine.update(id, &operand.into(), decr_write)?)
    }

    pub fn create(&self, ty: DatumType, refs: Refs) -> DatumId {
        self.engine.create(ty, refs)
    }

    /// Whole-container assignment into a fresh datum.
    pub fn copy(&self, src: DatumId, refs: Refs) -> anyhow::Result<DatumId> {
        Ok(self.engine.copy(src, refs)?)
    }

    pub fn copy_into(&self, dst: DatumId, src: DatumId, decr_write: i64) -> anyhow::Result<()> {
        Ok(self.engine.copy_into(dst, src, decr_write)?)
    }

    pub fn incr_ref(&self, id: DatumId, read: i64, write: i64) -> anyhow::Result<()> {
        Ok(self.engine.incr_ref(id, read, write)?)
    }

    pub fn decr_ref(&self, id: DatumId, read: i64, write: i64) -> anyhow::Result<()> {
        Ok(self.engine.decr_ref(id, read, write)?)
    }

    /// Give up `n` write references, e.g. on an output the body decided not
    /// to write.
    pub fn decr_write(&self, id: DatumId, n: i64) -> anyhow::Result<()> {
        self.decr_ref(id, 0, n)
    }

    /// Register a follow-up task. This is how control flow continues: a body
    /// spawns the continuation that waits on the data it just produced.
    pub fn spawn(&self, spec: TaskSpec) -> anyhow::Result<TaskId> {
        Ok(self.engine.add_task(spec)?)
    }
}

/// Resolve the arguments of a task against the store.
pub(crate) fn resolve_args(engine: &Engine, spec: &TaskSpec) -> Result<Vec<Value>, DataError> {
    spec.args
        .iter()
        .map(|arg| match arg {
            Arg::Value(value) => Ok(value.clone()),
            Arg::Datum(id) => match engine.store().read(*id) {
                Err(DataError::WrongKind { .. }) => Ok(Value::Ref(*id)),
                other => other,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let spec = TaskSpec::new("f")
            .name("f(1)")
            .arg(1)
            .read(DatumId(3))
            .output(DatumId(4))
            .control()
            .priority(5)
            .parallelism(2)
            .checkpoint();
        assert_eq!(&*spec.body, "f");
        assert_eq!(&*spec.name, "f(1)");
        assert_eq!(spec.args, vec![Arg::Value(Value::Int(1)), Arg::Datum(DatumId(3))]);
        assert_eq!(spec.inputs, vec![Input::Closed(DatumId(3))]);
        assert_eq!(spec.work_type, WorkType::CONTROL);
        assert_eq!(spec.parallelism, 2);
        assert_eq!(TaskSpec::new("g").parallelism, 1);
        assert!(spec.checkpoint && !spec.assertion);
    }

    #[test]
    fn test_input_root() {
        let input = Input::path(DatumId(9), [1i64, 2]);
        assert_eq!(input.root(), DatumId(9));
        assert_eq!(input, Input::Path(DatumId(9), vec![Key::from(1), Key::from(2)]));
    }
}
