//! One session per logical operation.
//!
//! ```text
//! let scope = SessionScope::acquire(&pool).await?;
//! let (repo, uow) = scope.parts();
//! ... work ...
//! scope.close().await?;
//! ```
//!
//! `close` hands the release to a spawned task and awaits it, so cancelling
//! the caller after `close` started cannot interrupt the rollback. When the
//! scope is dropped instead (an early `?` return or a cancelled future), the
//! session's own `Drop` releases it: an in-flight SQLx transaction is rolled
//! back and its connection returned to the pool. Scopes do not nest.

use tracing::{debug, instrument};

use super::repository::Repository;
use super::uow::UnitOfWork;
use super::{Session, SessionPool};
use crate::error::DataError;

#[derive(Debug)]
pub struct SessionScope<S: Session> {
    session: S,
}

impl<S: Session> SessionScope<S> {
    /// Draw a session from `pool`. Fails with [`DataError::Acquire`] when the
    /// pool stays exhausted past its acquire timeout.
    #[instrument(skip_all, err)]
    pub async fn acquire<P>(pool: &P) -> Result<Self, DataError>
    where
        P: SessionPool<Session = S>,
    {
        let session = pool.acquire().await?;
        debug!("session acquired");
        Ok(Self { session })
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn repository(&self) -> Repository<'_, S> {
        Repository::new(&self.session)
    }

    pub fn unit_of_work(&self) -> UnitOfWork<'_, S> {
        UnitOfWork::new(&self.session)
    }

    /// Repository and unit of work over the same session.
    pub fn parts(&self) -> (Repository<'_, S>, UnitOfWork<'_, S>) {
        (self.repository(), self.unit_of_work())
    }

    /// Roll back uncommitted work and return the session to its pool.
    pub async fn close(self) -> Result<(), DataError> {
        let release = tokio::spawn(self.session.close());
        release
            .await
            .map_err(|e| DataError::Release(e.to_string()))??;
        debug!("session released");
        Ok(())
    }
}
