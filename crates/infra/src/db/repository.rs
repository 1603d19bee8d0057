//! Typed read/update/delete over a session.

use courier_core::{ExternalId, FieldMap, UserId};
use tracing::{debug, instrument};

use super::models::User;
use super::uow::UnitOfWork;
use super::{conditions, Filter, Model, Session};
use crate::error::DataError;

/// Generic repository borrowing a session for the duration of a scope.
///
/// `update` and `delete` commit on success. Reads never commit.
#[derive(Debug)]
pub struct Repository<'s, S> {
    session: &'s S,
}

impl<S> Clone for Repository<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Repository<'_, S> {}

impl<'s, S: Session> Repository<'s, S> {
    pub fn new(session: &'s S) -> Self {
        Self { session }
    }

    /// User-specific operations.
    pub fn users(&self) -> UsersRepository<'s, S> {
        UsersRepository { repo: *self }
    }

    /// Unit of work sharing this repository's session.
    pub fn unit_of_work(&self) -> UnitOfWork<'s, S> {
        UnitOfWork::new(self.session)
    }

    /// First row matching every filter, by primary key order.
    pub async fn get<M: Model>(&self, filters: &[Filter<M>]) -> Result<Option<M>, DataError> {
        let mut rows = self
            .session
            .fetch(M::TABLE, &conditions(filters), Some(1))
            .await?;
        rows.pop().map(M::from_record).transpose()
    }

    /// Every row matching the filters.
    pub async fn get_many<M: Model>(&self, filters: &[Filter<M>]) -> Result<Vec<M>, DataError> {
        let rows = self
            .session
            .fetch(M::TABLE, &conditions(filters), None)
            .await?;
        rows.into_iter().map(M::from_record).collect()
    }

    /// Apply `fields` to the matching rows and commit.
    ///
    /// An empty `fields` map issues no write: with `load_result` the current
    /// row is returned, otherwise `None`. With `load_result` the first updated
    /// row is returned; `None` means nothing matched.
    #[instrument(skip_all, fields(table = M::TABLE.name, fields = fields.len(), load_result = load_result), err)]
    pub async fn update<M: Model>(
        &self,
        filters: &[Filter<M>],
        fields: &FieldMap,
        load_result: bool,
    ) -> Result<Option<M>, DataError> {
        if fields.is_empty() {
            debug!("no fields to update; skipping write");
            if !load_result {
                return Ok(None);
            }
            return self.get(filters).await;
        }

        let mut rows = self
            .session
            .update(M::TABLE, &conditions(filters), fields, load_result)
            .await?;
        self.session.commit().await?;

        if !load_result || rows.is_empty() {
            return Ok(None);
        }
        M::from_record(rows.swap_remove(0)).map(Some)
    }

    /// Delete matching rows and commit. Returns whether anything was deleted.
    #[instrument(skip_all, fields(table = M::TABLE.name), err)]
    pub async fn delete<M: Model>(&self, filters: &[Filter<M>]) -> Result<bool, DataError> {
        let deleted = self
            .session
            .delete(M::TABLE, &conditions(filters))
            .await?;
        self.session.commit().await?;
        Ok(deleted > 0)
    }
}

/// Lookups on the `users` relation.
#[derive(Debug)]
pub struct UsersRepository<'s, S> {
    repo: Repository<'s, S>,
}

impl<S: Session> UsersRepository<'_, S> {
    pub async fn get(&self, id: UserId) -> Result<Option<User>, DataError> {
        self.repo.get(&[User::ID.eq(id.get())]).await
    }

    pub async fn by_external_id(
        &self,
        external_id: ExternalId,
    ) -> Result<Option<User>, DataError> {
        self.repo
            .get(&[User::EXTERNAL_ID.eq(external_id.get())])
            .await
    }

    /// Write `fields` to the user row without reading it back.
    pub async fn update(&self, id: UserId, fields: &FieldMap) -> Result<(), DataError> {
        self.repo
            .update(&[User::ID.eq(id.get())], fields, false)
            .await
            .map(|_| ())
    }

    pub async fn delete(&self, id: UserId) -> Result<bool, DataError> {
        self.repo.delete(&[User::ID.eq(id.get())]).await
    }
}
