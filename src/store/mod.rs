//! The datum store.
//!
//! Every script-level variable lives here as a [`Datum`]: a single-assignment
//! scalar, a keyed container, a struct, a multiset or an updateable
//! accumulator. Datums are reference counted with two counters:
//!
//! * **write** counts the parties that may still write (or insert into, or
//!   update) the datum. Reaching zero starts *closing*.
//! * **read** counts the parties that may still read it. When both counters
//!   are zero the datum is freed.
//!
//! A container closes once its write count is zero *and* every owned child
//! has closed. Owned compound children are kept open by a write reference
//! their parent holds on them, which the parent only gives up when its own
//! write count reaches zero. This makes nested insertion safe: a dynamically
//! keyed child such as `A[i][j]` cannot close while `A` may still receive
//! insertions.
//!
//! Each datum sits behind its own lock. Operations never hold more than a
//! parent and one child lock at a time, and never call listeners while
//! holding a lock: listeners are collected into [`Notifications`] and fired
//! by the engine afterwards.

mod container;
mod refcount;
mod updateable;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::core::DatumId;
use crate::engine::Engine;
use crate::error::DataError;
use crate::value::{DatumType, Key, KeyType, MergeOp, Value};

pub use container::{Member, Members};
use container::Container;
use refcount::Effect;

/// Continuation registered on a datum, fired once when it closes (or, for
/// subscript listeners, once the subscript is assigned).
pub(crate) type Listener = Box<dyn FnOnce(&Engine) + Send + 'static>;

/// Initial reference counts of a new datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refs {
    pub read: i64,
    pub write: i64,
}

impl Refs {
    pub fn new(read: i64, write: i64) -> Self {
        Self { read, write }
    }

    /// A datum with no further writers, closed as soon as it is created.
    pub fn closed() -> Self {
        Self { read: 1, write: 0 }
    }
}

impl Default for Refs {
    fn default() -> Self {
        Self { read: 1, write: 1 }
    }
}

/// Side effects of a store operation, to be delivered once all locks have
/// been released.
#[derive(Default)]
pub struct Notifications {
    pub(crate) closed: Vec<DatumId>,
    pub(crate) assigned: Vec<(DatumId, Key)>,
    pub(crate) freed: Vec<DatumId>,
    pub(crate) listeners: Vec<Listener>,
}

impl Notifications {
    /// Datums that closed during the operation.
    pub fn closed(&self) -> &[DatumId] {
        &self.closed
    }

    /// Container subscripts that were assigned during the operation.
    pub fn assigned(&self) -> &[(DatumId, Key)] {
        &self.assigned
    }

    /// Datums whose storage was released during the operation.
    pub fn freed(&self) -> &[DatumId] {
        &self.freed
    }

    pub fn is_empty(&self) -> bool {
        self.closed.is_empty()
            && self.assigned.is_empty()
            && self.freed.is_empty()
            && self.listeners.is_empty()
    }

    pub(crate) fn merge(&mut self, other: Notifications) {
        self.closed.extend(other.closed);
        self.assigned.extend(other.assigned);
        self.freed.extend(other.freed);
        self.listeners.extend(other.listeners);
    }
}

impl std::fmt::Debug for Notifications {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifications")
            .field("closed", &self.closed)
            .field("assigned", &self.assigned)
            .field("freed", &self.freed)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

pub(crate) enum Storage {
    Scalar(Option<Value>),
    Container(Container),
    Multiset(Vec<Value>),
    Updateable { op: MergeOp, value: Value },
}

impl Storage {
    fn new(ty: DatumType) -> Self {
        match ty {
            DatumType::Scalar => Storage::Scalar(None),
            DatumType::Container { key, ordered } => {
                Storage::Container(Container::new(key, ordered, None))
            }
            DatumType::Struct { fields } => {
                Storage::Container(Container::new(KeyType::Str, false, Some(fields)))
            }
            DatumType::Multiset => Storage::Multiset(Vec::new()),
            DatumType::Updateable { op, init } => Storage::Updateable { op, value: init },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Storage::Scalar(_) => "scalar",
            Storage::Container(c) if c.is_struct() => "struct",
            Storage::Container(_) => "container",
            Storage::Multiset(_) => "multiset",
            Storage::Updateable { .. } => "updateable",
        }
    }

    /// Type descriptor that recreates this storage, used by structural copy.
    fn datum_type(&self) -> DatumType {
        match self {
            Storage::Scalar(_) => DatumType::Scalar,
            Storage::Container(c) => c.datum_type(),
            Storage::Multiset(_) => DatumType::Multiset,
            Storage::Updateable { op, value } => DatumType::Updateable {
                op: *op,
                init: value.clone(),
            },
        }
    }

    /// Datums this storage refers to by value (not through container members).
    fn value_refs(&self) -> Vec<DatumId> {
        match self {
            Storage::Scalar(Some(Value::Ref(id))) => vec![*id],
            Storage::Multiset(values) => values.iter().filter_map(Value::as_ref_id).collect(),
            _ => Vec::new(),
        }
    }
}

pub(crate) struct Datum {
    pub(crate) id: DatumId,
    pub(crate) storage: Storage,
    pub(crate) read: i64,
    pub(crate) write: i64,
    pub(crate) permanent: bool,
    pub(crate) closed: bool,
    /// Owning container, told when this datum closes.
    pub(crate) parent: Option<DatumId>,
    /// Owned children that have not closed yet.
    pub(crate) unclosed_children: i64,
    pub(crate) listeners: Vec<Listener>,
    pub(crate) sub_listeners: HashMap<Key, Vec<Listener>>,
}

impl Datum {
    fn new(id: DatumId, ty: DatumType, refs: Refs, parent: Option<DatumId>) -> Self {
        Self {
            id,
            storage: Storage::new(ty),
            read: refs.read,
            write: refs.write,
            permanent: false,
            closed: false,
            parent,
            unclosed_children: 0,
            listeners: Vec::new(),
            sub_listeners: HashMap::new(),
        }
    }

    fn container_mut(&mut self, op: &'static str) -> Result<&mut Container, DataError> {
        let id = self.id;
        match &mut self.storage {
            Storage::Container(c) => Ok(c),
            other => Err(DataError::WrongKind {
                id,
                op,
                kind: other.kind(),
            }),
        }
    }

    fn ensure_open(&self, key: Option<&Key>) -> Result<(), DataError> {
        if self.write <= 0 {
            return Err(DataError::DoubleWrite {
                id: self.id,
                key: key.cloned(),
            });
        }
        Ok(())
    }

    fn take_sub_listeners(&mut self, key: &Key, notifs: &mut Notifications) {
        if let Some(listeners) = self.sub_listeners.remove(key) {
            notifs.listeners.extend(listeners);
        }
        notifs.assigned.push((self.id, key.clone()));
    }
}

type Cell = Arc<Mutex<Datum>>;

/// Arena of datums indexed by generated ids.
pub struct Store {
    table: RwLock<HashMap<DatumId, Cell>>,
    next_id: AtomicU64,
    read_refcounts: bool,
}

impl Store {
    pub fn new(read_refcounts: bool) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            read_refcounts,
        }
    }

    fn alloc_id(&self) -> DatumId {
        DatumId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn cell(&self, id: DatumId) -> Result<Cell, DataError> {
        self.table
            .read()
            .get(&id)
            .cloned()
            .ok_or(DataError::NotFound(id))
    }

    fn install(&self, datum: Datum) -> DatumId {
        let id = datum.id;
        self.table.write().insert(id, Arc::new(Mutex::new(datum)));
        id
    }

    /// True if `id` was allocated by this store and has since been freed.
    pub fn is_freed(&self, id: DatumId) -> bool {
        id.0 > 0 && id.0 < self.next_id.load(Ordering::Relaxed) && !self.table.read().contains_key(&id)
    }

    /// Number of live datums.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a new top-level datum.
    ///
    /// A datum created with no writers is closed from the start.
    pub fn create(&self, ty: DatumType, refs: Refs) -> DatumId {
        let id = self.alloc_id();
        let mut datum = Datum::new(id, ty, refs, None);
        datum.closed = refs.write == 0;
        tracing::debug!(%id, kind = datum.storage.kind(), read = refs.read, write = refs.write, "create");
        self.install(datum)
    }

    /// Exempt a datum from garbage collection.
    pub fn set_permanent(&self, id: DatumId) -> Result<(), DataError> {
        self.cell(id)?.lock().permanent = true;
        Ok(())
    }

    pub fn datum_type(&self, id: DatumId) -> Result<DatumType, DataError> {
        Ok(self.cell(id)?.lock().storage.datum_type())
    }

    /// Current `(read, write)` counts.
    pub fn refcounts(&self, id: DatumId) -> Result<(i64, i64), DataError> {
        let cell = self.cell(id)?;
        let d = cell.lock();
        Ok((d.read, d.write))
    }

    /// Whether the datum has closed. Freed datums count as closed: closing is
    /// one-way and a datum is only freed after its writers are gone.
    pub fn is_closed(&self, id: DatumId) -> Result<bool, DataError> {
        match self.cell(id) {
            Ok(cell) => Ok(cell.lock().closed),
            Err(_) if self.is_freed(id) => Ok(true),
            Err(err) => Err(err),
        }
    }

    pub fn incr_ref(&self, id: DatumId, read: i64, write: i64) -> Result<Notifications, DataError> {
        self.run(vec![Effect::Refs { id, read, write }])
    }

    pub fn decr_ref(&self, id: DatumId, read: i64, write: i64) -> Result<Notifications, DataError> {
        self.run(vec![Effect::Refs {
            id,
            read: -read,
            write: -write,
        }])
    }

    /// Assign a scalar and give up `decr_write` write references.
    ///
    /// Writing a slot that already holds a value, or has no writers left, is a
    /// [`DataError::DoubleWrite`]. Storing a [`Value::Ref`] acquires a read
    /// reference on the referenced datum, released again when this slot is
    /// freed.
    pub fn write(&self, id: DatumId, value: Value, decr_write: i64) -> Result<Notifications, DataError> {
        // A dangling reference must fail before the slot is taken.
        if let Value::Ref(target) = value {
            self.cell(target)?;
        }
        let mut effects = Vec::new();
        {
            let cell = self.cell(id)?;
            let mut d = cell.lock();
            let open = d.write > 0;
            let kind = d.storage.kind();
            match &mut d.storage {
                Storage::Scalar(slot) => {
                    if !open || slot.is_some() {
                        tracing::debug!(%id, "attempt to write closed datum");
                        return Err(DataError::DoubleWrite { id, key: None });
                    }
                    if let Value::Ref(target) = value {
                        effects.push(Effect::Refs {
                            id: target,
                            read: 1,
                            write: 0,
                        });
                    }
                    tracing::debug!(%id, ?value, "store");
                    *slot = Some(value);
                }
                _ => {
                    return Err(DataError::WrongKind {
                        id,
                        op: "write",
                        kind,
                    });
                }
            }
        }

        effects.push(Effect::Refs {
            id,
            read: 0,
            write: -decr_write,
        });
        self.run(effects)
    }

    /// Value of a closed scalar or a finalized updateable.
    pub fn read(&self, id: DatumId) -> Result<Value, DataError> {
        let cell = self.cell(id)?;
        let d = cell.lock();
        match &d.storage {
            Storage::Scalar(value) => match (d.closed, value) {
                (true, Some(value)) => Ok(value.clone()),
                (true, None) => Err(DataError::Unset(id)),
                (false, _) => Err(DataError::NotClosed(id)),
            },
            Storage::Updateable { value, .. } if d.closed => Ok(value.clone()),
            Storage::Updateable { .. } => Err(DataError::NotClosed(id)),
            other => Err(DataError::WrongKind {
                id,
                op: "read",
                kind: other.kind(),
            }),
        }
    }

    /// Every datum `id` points at directly: owned children, referenced
    /// members, and references stored as values.
    pub fn references(&self, id: DatumId) -> Result<Vec<DatumId>, DataError> {
        let cell = self.cell(id)?;
        let d = cell.lock();
        let mut out = d.storage.value_refs();
        if let Storage::Container(c) = &d.storage {
            out.extend(c.members().map(|(_, member)| member.id()));
        }
        Ok(out)
    }

    /// Register `listener` to fire when `id` closes.
    ///
    /// Returns the listener back if the datum is already closed (or freed),
    /// in which case the caller should proceed immediately.
    pub(crate) fn subscribe(&self, id: DatumId, listener: Listener) -> Result<Option<Listener>, DataError> {
        let cell = match self.cell(id) {
            Ok(cell) => cell,
            Err(_) if self.is_freed(id) => return Ok(Some(listener)),
            Err(err) => return Err(err),
        };
        let mut d = cell.lock();
        if d.closed {
            return Ok(Some(listener));
        }
        d.listeners.push(listener);
        Ok(None)
    }

    /// Register `listener` to fire when subscript `key` of container `id` is
    /// assigned, or when the container closes without it.
    ///
    /// Returns the listener back if either has already happened.
    pub(crate) fn subscribe_sub(
        &self,
        id: DatumId,
        key: &Key,
        listener: Listener,
    ) -> Result<Option<Listener>, DataError> {
        let cell = match self.cell(id) {
            Ok(cell) => cell,
            Err(_) if self.is_freed(id) => return Ok(Some(listener)),
            Err(err) => return Err(err),
        };
        let mut d = cell.lock();
        let closed = d.closed;
        let c = d.container_mut("subscribe")?;
        if closed || c.get(key).is_some() {
            return Ok(Some(listener));
        }
        d.sub_listeners.entry(key.clone()).or_default().push(listener);
        Ok(None)
    }

    /// Run a batch of refcount effects to completion.
    fn run(&self, effects: Vec<Effect>) -> Result<Notifications, DataError> {
        let mut notifs = Notifications::default();
        self.apply(effects, &mut notifs)?;
        Ok(notifs)
    }
}
