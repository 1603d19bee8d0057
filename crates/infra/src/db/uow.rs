//! Batched writes over a session.

use tracing::{debug, instrument};

use super::{Condition, Model, Op, Session};
use crate::error::DataError;

/// Groups inserts/upserts/deletes on one session.
///
/// `commit` and `delete` end with a commit; `merge` leaves committing to the
/// caller so it can be combined with other work.
#[derive(Debug)]
pub struct UnitOfWork<'s, S> {
    session: &'s S,
}

impl<'s, S: Session> UnitOfWork<'s, S> {
    pub fn new(session: &'s S) -> Self {
        Self { session }
    }

    /// Insert every entity and commit. Each entity is refreshed from the
    /// stored row, so generated ids and timestamps are visible afterwards.
    ///
    /// A unique violation aborts the batch; nothing of it is committed.
    #[instrument(skip_all, fields(table = M::TABLE.name, count = entities.len()), err)]
    pub async fn commit<M: Model>(&self, entities: &mut [M]) -> Result<(), DataError> {
        for entity in entities.iter_mut() {
            let stored = self.session.insert(M::TABLE, entity.to_record()).await?;
            *entity = M::from_record(stored)?;
        }
        self.session.commit().await?;
        debug!("entities committed");
        Ok(())
    }

    /// Insert-or-overwrite each entity by primary key, without committing.
    #[instrument(skip_all, fields(table = M::TABLE.name, count = entities.len()), err)]
    pub async fn merge<M: Model>(&self, entities: &mut [M]) -> Result<(), DataError> {
        for entity in entities.iter_mut() {
            let stored = self.session.upsert(M::TABLE, entity.to_record()).await?;
            *entity = M::from_record(stored)?;
        }
        Ok(())
    }

    /// Delete each entity by primary key and commit.
    #[instrument(skip_all, fields(table = M::TABLE.name, count = entities.len()), err)]
    pub async fn delete<M: Model>(&self, entities: &[M]) -> Result<u64, DataError> {
        let mut deleted = 0;
        for entity in entities {
            let key = entity.primary_key();
            if key.is_null() {
                continue;
            }
            let by_key = [Condition {
                column: M::TABLE.primary_key,
                op: Op::Eq,
                value: key,
            }];
            deleted += self.session.delete(M::TABLE, &by_key).await?;
        }
        self.session.commit().await?;
        Ok(deleted)
    }
}
