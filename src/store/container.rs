use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::core::DatumId;
use crate::engine::Engine;
use crate::error::DataError;
use crate::value::{DatumType, Key, KeyType, Value};

use super::refcount::{Effect, try_close};
use super::{Datum, Listener, Notifications, Refs, Storage, Store};

/// One entry of a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Member {
    /// Datum owned by the container. It counts towards the container's
    /// closing and is released with it.
    Child(DatumId),
    /// Datum owned elsewhere, kept alive by a read reference.
    Ref(DatumId),
}

impl Member {
    pub fn id(self) -> DatumId {
        match self {
            Member::Child(id) | Member::Ref(id) => id,
        }
    }
}

pub(crate) struct Container {
    key: KeyType,
    ordered: bool,
    fields: Option<Vec<Arc<str>>>,
    members: BTreeMap<Key, Member>,
    /// Insertion order, kept for ordered containers only.
    order: Vec<Key>,
    /// Nested compound children this container holds a write reference on.
    held_writes: HashSet<DatumId>,
}

impl Container {
    pub(super) fn new(key: KeyType, ordered: bool, fields: Option<Vec<Arc<str>>>) -> Self {
        Self {
            key,
            ordered,
            fields,
            members: BTreeMap::new(),
            order: Vec::new(),
            held_writes: HashSet::new(),
        }
    }

    pub(super) fn is_struct(&self) -> bool {
        self.fields.is_some()
    }

    pub(super) fn datum_type(&self) -> DatumType {
        match &self.fields {
            Some(fields) => DatumType::Struct {
                fields: fields.clone(),
            },
            None => DatumType::Container {
                key: self.key,
                ordered: self.ordered,
            },
        }
    }

    pub(super) fn get(&self, key: &Key) -> Option<Member> {
        self.members.get(key).copied()
    }

    pub(super) fn len(&self) -> usize {
        self.members.len()
    }

    /// Members in iteration order: insertion order for ordered containers,
    /// key order otherwise.
    pub(super) fn members(&self) -> Box<dyn Iterator<Item = (&Key, Member)> + '_> {
        if self.ordered {
            Box::new(
                self.order
                    .iter()
                    .filter_map(|key| self.members.get_key_value(key))
                    .map(|(k, m)| (k, *m)),
            )
        } else {
            Box::new(self.members.iter().map(|(k, m)| (k, *m)))
        }
    }

    pub(super) fn take_held_writes(&mut self) -> Vec<DatumId> {
        self.held_writes.drain().collect()
    }

    fn check_key(&self, id: DatumId, key: &Key) -> Result<(), DataError> {
        if key.key_type() != self.key {
            return Err(DataError::KeyType {
                id,
                expected: self.key,
                actual: key.key_type(),
            });
        }
        if let Some(fields) = &self.fields {
            let known = matches!(key, Key::Str(name) if fields.iter().any(|f| f == name));
            if !known {
                return Err(DataError::NoSuchField {
                    id,
                    field: key.clone(),
                });
            }
        }
        Ok(())
    }

    fn put(&mut self, key: Key, member: Member) {
        if self.ordered {
            self.order.push(key.clone());
        }
        self.members.insert(key, member);
    }
}

/// Snapshot of a container's members, yielded in iteration order.
///
/// Taken at the moment [`Store::iterate`] is called; members inserted later
/// are not seen.
#[derive(Debug, Clone)]
pub struct Members {
    inner: std::vec::IntoIter<(Key, Member)>,
}

impl Iterator for Members {
    type Item = (Key, Member);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Members {}

/// What structural copy needs to know about a source child.
enum Shape {
    Value(Option<Value>),
    Nested(DatumType),
    Other(DatumType),
}

impl Store {
    /// Store `value` under `key` and give up `decr_write` write references on
    /// the container.
    ///
    /// A [`Value::Ref`] becomes a [`Member::Ref`] and keeps its target alive;
    /// any other value is stored in a fresh closed child.
    pub fn insert(&self, id: DatumId, key: Key, value: Value, decr_write: i64) -> Result<Notifications, DataError> {
        if let Value::Ref(target) = value {
            self.cell(target)?;
        }
        let mut notifs = Notifications::default();
        let mut effects = Vec::new();
        {
            let cell = self.cell(id)?;
            let mut d = cell.lock();
            d.ensure_open(Some(&key))?;
            let c = d.container_mut("insert")?;
            c.check_key(id, &key)?;
            if c.get(&key).is_some() {
                return Err(DataError::DoubleWrite { id, key: Some(key) });
            }

            let member = match value {
                Value::Ref(target) => {
                    effects.push(Effect::Refs {
                        id: target,
                        read: 1,
                        write: 0,
                    });
                    Member::Ref(target)
                }
                value => {
                    let child = self.alloc_id();
                    let mut datum = Datum::new(child, DatumType::Scalar, Refs::closed(), Some(id));
                    datum.storage = Storage::Scalar(Some(value));
                    datum.closed = true;
                    self.install(datum);
                    Member::Child(child)
                }
            };
            tracing::debug!(%id, %key, ?member, "insert");
            c.put(key.clone(), member);
            d.take_sub_listeners(&key, &mut notifs);
        }

        effects.push(Effect::Refs {
            id,
            read: 0,
            write: -decr_write,
        });
        self.apply(effects, &mut notifs)?;
        Ok(notifs)
    }

    /// Insert at a nested subscript path, creating intermediate containers as
    /// needed. `decr_write` write references are released on the root.
    ///
    /// Intermediate levels are created as unordered maps keyed by the type of
    /// the next key in the path, and stay open until their parent closes.
    pub fn insert_path(
        &self,
        root: DatumId,
        path: &[Key],
        value: Value,
        decr_write: i64,
    ) -> Result<Notifications, DataError> {
        let Some((last, prefix)) = path.split_last() else {
            return Err(DataError::EmptyPath(root));
        };

        let mut notifs = Notifications::default();
        let mut current = root;
        for (i, key) in prefix.iter().enumerate() {
            let ty = DatumType::map(path[i + 1].key_type());
            current = self.child_at(current, key, ty, 0, &mut notifs)?;
        }
        notifs.merge(self.insert(current, last.clone(), value, 0)?);
        notifs.merge(self.decr_ref(root, 0, decr_write)?);
        Ok(notifs)
    }

    /// Resolve a subscript path to a datum, creating whatever is missing.
    ///
    /// The leaf is created with type `leaf` and `writers` write references
    /// for the caller. If the leaf already exists those writers are added to
    /// it, which fails once it has closed.
    pub fn lookup(
        &self,
        root: DatumId,
        path: &[Key],
        leaf: DatumType,
        writers: i64,
    ) -> Result<(DatumId, Notifications), DataError> {
        if path.is_empty() {
            return Err(DataError::EmptyPath(root));
        }

        let mut notifs = Notifications::default();
        let mut current = root;
        for (i, key) in path.iter().enumerate() {
            current = match path.get(i + 1) {
                Some(next) => self.child_at(current, key, DatumType::map(next.key_type()), 0, &mut notifs)?,
                None => self.child_at(current, key, leaf.clone(), writers, &mut notifs)?,
            };
        }
        Ok((current, notifs))
    }

    /// Member stored under `key`, without creating anything.
    pub fn get(&self, id: DatumId, key: &Key) -> Result<Option<Member>, DataError> {
        let cell = self.cell(id)?;
        let mut d = cell.lock();
        let c = d.container_mut("get")?;
        c.check_key(id, key)?;
        Ok(c.get(key))
    }

    /// Follow a subscript path through existing members only.
    pub fn resolve(&self, root: DatumId, path: &[Key]) -> Result<Option<DatumId>, DataError> {
        let mut current = root;
        for key in path {
            match self.get(current, key)? {
                Some(member) => current = member.id(),
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    pub fn iterate(&self, id: DatumId) -> Result<Members, DataError> {
        self.enumerate(id, 0, None)
    }

    /// A window of the members in iteration order: skip `offset` of them and
    /// yield at most `count`, or all the rest when `count` is `None`.
    pub fn enumerate(&self, id: DatumId, offset: usize, count: Option<usize>) -> Result<Members, DataError> {
        let cell = self.cell(id)?;
        let mut d = cell.lock();
        let c = d.container_mut("enumerate")?;
        let snapshot: Vec<_> = c
            .members()
            .skip(offset)
            .take(count.unwrap_or(usize::MAX))
            .map(|(k, m)| (k.clone(), m))
            .collect();
        Ok(Members {
            inner: snapshot.into_iter(),
        })
    }

    /// Closed scalar values of a container, in iteration order. Members that
    /// are not closed scalars are skipped.
    pub fn values(&self, id: DatumId) -> Result<Vec<(Key, Value)>, DataError> {
        let mut out = Vec::new();
        for (key, member) in self.iterate(id)? {
            match self.read(member.id()) {
                Ok(value) => out.push((key, value)),
                Err(DataError::NotClosed(_) | DataError::Unset(_) | DataError::WrongKind { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// Number of members (or elements, for a multiset).
    pub fn size(&self, id: DatumId) -> Result<usize, DataError> {
        let cell = self.cell(id)?;
        let d = cell.lock();
        match &d.storage {
            Storage::Container(c) => Ok(c.len()),
            Storage::Multiset(values) => Ok(values.len()),
            other => Err(DataError::WrongKind {
                id,
                op: "size",
                kind: other.kind(),
            }),
        }
    }

    /// Add an element to a multiset and give up `decr_write` write references.
    pub fn append(&self, id: DatumId, value: Value, decr_write: i64) -> Result<Notifications, DataError> {
        if let Value::Ref(target) = value {
            self.cell(target)?;
        }
        let mut effects = Vec::new();
        {
            let cell = self.cell(id)?;
            let mut d = cell.lock();
            d.ensure_open(None)?;
            let kind = d.storage.kind();
            let Storage::Multiset(values) = &mut d.storage else {
                return Err(DataError::WrongKind {
                    id,
                    op: "append",
                    kind,
                });
            };
            if let Value::Ref(target) = value {
                effects.push(Effect::Refs {
                    id: target,
                    read: 1,
                    write: 0,
                });
            }
            values.push(value);
        }
        effects.push(Effect::Refs {
            id,
            read: 0,
            write: -decr_write,
        });
        self.run(effects)
    }

    pub fn multiset_values(&self, id: DatumId) -> Result<Vec<Value>, DataError> {
        let cell = self.cell(id)?;
        let d = cell.lock();
        match &d.storage {
            Storage::Multiset(values) => Ok(values.clone()),
            other => Err(DataError::WrongKind {
                id,
                op: "enumerate",
                kind: other.kind(),
            }),
        }
    }

    /// Whole-container assignment: a new datum holding a structural copy of
    /// the closed datum `src`.
    ///
    /// The copy gets `refs` and closes independently of the source. If
    /// `refs.write` is zero it is closed as soon as the copy completes.
    pub fn copy(&self, src: DatumId, refs: Refs) -> Result<(DatumId, Notifications), DataError> {
        let ty = self.datum_type(src)?;
        let dst = self.create(ty, Refs::new(refs.read, refs.write + 1));
        let notifs = self.copy_into(dst, src, 1)?;
        Ok((dst, notifs))
    }

    /// Structurally copy the closed compound `src` into the open `dst`, then
    /// give up `decr_write` write references on `dst`.
    ///
    /// Owned children are duplicated level by level, so later writes to
    /// either side never show through the other. [`Member::Ref`] entries stay
    /// references to the same external datum.
    pub fn copy_into(&self, dst: DatumId, src: DatumId, decr_write: i64) -> Result<Notifications, DataError> {
        let mut notifs = Notifications::default();
        let mut work = vec![(src, dst)];

        while let Some((from, to)) = work.pop() {
            let (members, elements) = {
                let cell = self.cell(from)?;
                let d = cell.lock();
                if !d.closed {
                    return Err(DataError::NotClosed(from));
                }
                match &d.storage {
                    Storage::Container(c) => (c.members().map(|(k, m)| (k.clone(), m)).collect(), Vec::new()),
                    Storage::Multiset(values) => (Vec::new(), values.clone()),
                    other => {
                        return Err(DataError::WrongKind {
                            id: from,
                            op: "copy",
                            kind: other.kind(),
                        });
                    }
                }
            };

            for value in elements {
                notifs.merge(self.append(to, value, 0)?);
            }

            for (key, member) in members {
                let child = match member {
                    Member::Ref(target) => {
                        notifs.merge(self.insert(to, key, Value::Ref(target), 0)?);
                        continue;
                    }
                    Member::Child(child) => child,
                };

                match self.shape(child)? {
                    Shape::Value(Some(value)) => notifs.merge(self.insert(to, key, value, 0)?),
                    Shape::Value(None) => {
                        self.child_at(to, &key, DatumType::Scalar, 0, &mut notifs)?;
                    }
                    Shape::Other(ty) => {
                        self.child_at(to, &key, ty, 0, &mut notifs)?;
                    }
                    Shape::Nested(ty) => {
                        let copy = self.child_at(to, &key, ty, 0, &mut notifs)?;
                        work.push((child, copy));
                    }
                }
            }
        }

        notifs.merge(self.decr_ref(dst, 0, decr_write)?);
        Ok(notifs)
    }

    fn shape(&self, id: DatumId) -> Result<Shape, DataError> {
        let cell = self.cell(id)?;
        let d = cell.lock();
        Ok(match &d.storage {
            Storage::Scalar(value) => Shape::Value(value.clone()),
            Storage::Container(_) | Storage::Multiset(_) => Shape::Nested(d.storage.datum_type()),
            Storage::Updateable { .. } => Shape::Other(d.storage.datum_type()),
        })
    }

    /// The member at `key` of `parent`, created with type `ty` if absent.
    ///
    /// New compound children get a write reference held by the parent, which
    /// keeps them open until the parent itself stops accepting writes. The
    /// caller's `writers` are added on top.
    pub(super) fn child_at(
        &self,
        parent: DatumId,
        key: &Key,
        ty: DatumType,
        writers: i64,
        notifs: &mut Notifications,
    ) -> Result<DatumId, DataError> {
        let cell = self.cell(parent)?;
        let mut d = cell.lock();
        let c = d.container_mut("lookup")?;
        c.check_key(parent, key)?;

        if let Some(member) = c.get(key) {
            let child = member.id();
            if writers > 0 {
                // Registered while the parent is locked so a concurrent close
                // of the parent cannot release the child in between.
                let child_cell = self.cell(child)?;
                let mut cd = child_cell.lock();
                if cd.write == 0 {
                    return Err(DataError::DoubleWrite { id: child, key: None });
                }
                cd.write += writers;
            }
            return Ok(child);
        }

        if d.write <= 0 {
            return Err(DataError::DoubleWrite {
                id: parent,
                key: Some(key.clone()),
            });
        }

        let held = ty.is_compound();
        let write = writers + i64::from(held);
        let child = self.alloc_id();
        let mut datum = Datum::new(child, ty, Refs::new(1, write), Some(parent));
        let mut unused = Vec::new();
        try_close(&mut datum, &mut unused, notifs);
        let closed = datum.closed;
        self.install(datum);

        if !closed {
            d.unclosed_children += 1;
        }
        let c = d.container_mut("lookup")?;
        if held {
            c.held_writes.insert(child);
        }
        c.put(key.clone(), Member::Child(child));
        d.take_sub_listeners(key, notifs);
        tracing::debug!(%parent, %key, %child, writers, "create child");
        Ok(child)
    }
}

impl Engine {
    /// Pass subscript `key` of container `id` on to the scalar `target` as
    /// soon as it is assigned, giving up one write reference on `target`.
    ///
    /// A member holding a plain value has that value copied once it closes;
    /// any other member (a nested container, or a reference to a datum owned
    /// elsewhere) is written as a [`Value::Ref`] to it. The container is kept
    /// alive by a read reference until the target has been written.
    pub fn container_reference(&self, id: DatumId, key: Key, target: DatumId) -> Result<(), DataError> {
        if self.store.get(id, &key)?.is_none() && self.store.is_closed(id)? {
            return Err(DataError::NoSuchKey { id, key });
        }
        self.incr_ref(id, 1, 0)?;

        let sub_key = key.clone();
        let listener: Listener = Box::new(move |engine: &Engine| {
            if let Err(err) = engine.follow_reference(id, &key, target) {
                engine.fail(err.into());
            }
        });
        match self.store.subscribe_sub(id, &sub_key, listener) {
            Ok(None) => Ok(()),
            Ok(Some(listener)) => {
                listener(self);
                Ok(())
            }
            Err(err) => {
                self.decr_ref(id, 1, 0)?;
                Err(err)
            }
        }
    }

    fn follow_reference(&self, id: DatumId, key: &Key, target: DatumId) -> Result<(), DataError> {
        let Some(member) = self.store.get(id, key)? else {
            self.decr_ref(id, 1, 0)?;
            return Err(DataError::NoSuchKey { id, key: key.clone() });
        };
        tracing::debug!(%id, %key, %target, ?member, "reference resolved");

        match member {
            Member::Child(child) if matches!(self.store.datum_type(child)?, DatumType::Scalar) => {
                let copy: Listener = Box::new(move |engine: &Engine| {
                    let copied = engine
                        .store
                        .read(child)
                        .and_then(|value| engine.write(target, value))
                        .and_then(|()| engine.decr_ref(id, 1, 0));
                    if let Err(err) = copied {
                        engine.fail(err.into());
                    }
                });
                if let Some(copy) = self.store.subscribe(child, copy)? {
                    copy(self);
                }
                Ok(())
            }
            member => {
                self.write(target, Value::Ref(member.id()))?;
                self.decr_ref(id, 1, 0)
            }
        }
    }
}
