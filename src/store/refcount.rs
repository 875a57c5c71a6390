use crate::core::DatumId;
use crate::error::{DataError, RefKind};

use super::{Datum, Notifications, Storage, Store};

/// Pending refcount work. Cascades (a parent closing once its last child
/// closes, a freed container releasing its members) are pushed back onto the
/// worklist instead of recursing, so only one datum is locked at a time.
#[derive(Debug, Clone, Copy)]
pub(super) enum Effect {
    Refs { id: DatumId, read: i64, write: i64 },
    ChildClosed { parent: DatumId },
}

impl Store {
    pub(super) fn apply(&self, mut work: Vec<Effect>, notifs: &mut Notifications) -> Result<(), DataError> {
        while let Some(effect) = work.pop() {
            match effect {
                Effect::Refs { id, read, write } => self.change_refs(id, read, write, &mut work, notifs)?,
                Effect::ChildClosed { parent } => self.child_closed(parent, &mut work, notifs)?,
            }
        }
        Ok(())
    }

    fn change_refs(
        &self,
        id: DatumId,
        read: i64,
        write: i64,
        work: &mut Vec<Effect>,
        notifs: &mut Notifications,
    ) -> Result<(), DataError> {
        let read = if self.read_refcounts { read } else { 0 };
        if read == 0 && write == 0 {
            return Ok(());
        }

        let cell = self.cell(id)?;
        let mut d = cell.lock();

        if read != 0 && !d.permanent {
            if d.read + read < 0 {
                return Err(DataError::RefcountUnderflow {
                    id,
                    kind: RefKind::Read,
                    current: d.read,
                    change: read,
                });
            }
            d.read += read;
        }

        if write != 0 {
            if write > 0 && d.write == 0 {
                // No writers left means no new ones can appear.
                return Err(DataError::DoubleWrite { id, key: None });
            }
            if d.write + write < 0 {
                return Err(DataError::RefcountUnderflow {
                    id,
                    kind: RefKind::Write,
                    current: d.write,
                    change: write,
                });
            }
            d.write += write;
            if d.write == 0 {
                release_held_writes(&mut d, work);
                try_close(&mut d, work, notifs);
            }
        }

        tracing::trace!(%id, read = d.read, write = d.write, "refcount");

        if self.read_refcounts && !d.permanent && d.read == 0 && d.write == 0 {
            self.free(&mut d, work, notifs);
        }
        Ok(())
    }

    fn child_closed(
        &self,
        parent: DatumId,
        work: &mut Vec<Effect>,
        notifs: &mut Notifications,
    ) -> Result<(), DataError> {
        // The parent may already be gone if every reader dropped it early.
        let Ok(cell) = self.cell(parent) else {
            return Ok(());
        };
        let mut d = cell.lock();
        if d.unclosed_children == 0 {
            return Err(DataError::RefcountUnderflow {
                id: parent,
                kind: RefKind::Write,
                current: 0,
                change: -1,
            });
        }
        d.unclosed_children -= 1;
        try_close(&mut d, work, notifs);
        Ok(())
    }

    /// Drop the datum from the table and release everything it references.
    fn free(&self, d: &mut Datum, work: &mut Vec<Effect>, notifs: &mut Notifications) {
        tracing::debug!(id = %d.id, "free");
        self.table.write().remove(&d.id);

        for target in d.storage.value_refs() {
            work.push(Effect::Refs {
                id: target,
                read: -1,
                write: 0,
            });
        }
        if let Storage::Container(c) = &d.storage {
            for (_, member) in c.members() {
                work.push(Effect::Refs {
                    id: member.id(),
                    read: -1,
                    write: 0,
                });
            }
        }
        // Unfired listeners can never fire now.
        d.listeners.clear();
        d.sub_listeners.clear();
        notifs.freed.push(d.id);
    }
}

/// Once a container has no writers left it can no longer grow, so the write
/// references it holds on its nested children are returned.
fn release_held_writes(d: &mut Datum, work: &mut Vec<Effect>) {
    if let Storage::Container(c) = &mut d.storage {
        for child in c.take_held_writes() {
            work.push(Effect::Refs {
                id: child,
                read: 0,
                write: -1,
            });
        }
    }
}

pub(super) fn try_close(d: &mut Datum, work: &mut Vec<Effect>, notifs: &mut Notifications) {
    if d.closed || d.write > 0 || d.unclosed_children > 0 {
        return;
    }

    d.closed = true;
    tracing::debug!(id = %d.id, "closed");
    notifs.closed.push(d.id);
    notifs.listeners.append(&mut d.listeners);
    // Subscript waiters learn the key will never arrive.
    for (_, listeners) in d.sub_listeners.drain() {
        notifs.listeners.extend(listeners);
    }
    if let Some(parent) = d.parent {
        work.push(Effect::ChildClosed { parent });
    }
}
