use crate::core::DatumId;
use crate::error::DataError;
use crate::value::Value;

use super::refcount::Effect;
use super::{Notifications, Storage, Store};

impl Store {
    /// Merge `operand` into an updateable and give up `decr_write` of the
    /// caller's updater references.
    ///
    /// Updates commute, so concurrent updaters only serialize on the datum
    /// lock for the merge itself. Once the last updater is gone the datum
    /// closes and its value is final.
    pub fn update(&self, id: DatumId, operand: &Value, decr_write: i64) -> Result<Notifications, DataError> {
        {
            let cell = self.cell(id)?;
            let mut d = cell.lock();
            d.ensure_open(None)?;
            let kind = d.storage.kind();
            let Storage::Updateable { op, value } = &mut d.storage else {
                return Err(DataError::WrongKind {
                    id,
                    op: "update",
                    kind,
                });
            };
            *value = op.apply(value, operand)?;
            tracing::trace!(%id, ?op, ?operand, ?value, "update");
        }

        self.run(vec![Effect::Refs {
            id,
            read: 0,
            write: -decr_write,
        }])
    }

    /// Current value of an updateable, whether or not it is final.
    pub fn read_current(&self, id: DatumId) -> Result<Value, DataError> {
        let cell = self.cell(id)?;
        let d = cell.lock();
        match &d.storage {
            Storage::Updateable { value, .. } => Ok(value.clone()),
            other => Err(DataError::WrongKind {
                id,
                op: "read_current",
                kind: other.kind(),
            }),
        }
    }
}
