//! Thin adapter over the relational backend (SPEC_FULL.md §4.1 "Store").
//!
//! A `Pool` is "a cloneable handle to a connected sqlx pool plus its concrete
//! `Database` type", mirroring the teacher's `golem_service_base::db::Pool`
//! abstraction. We only ever instantiate it over Postgres: the scheduler's
//! core correctness property (§4.2's `SELECT ... FOR UPDATE SKIP LOCKED`
//! claim) depends on a backend that actually implements skip-locked row
//! locking, which rules out SQLite.

pub mod postgres;

use crate::error::RepoError;
use sqlx::Database;
use std::future::Future;
use std::pin::Pin;

/// Return type every `with_tx` body closure must produce: a boxed future
/// borrowing the transaction for exactly its own lifetime. Spelling this out
/// (instead of a bare generic `Fut`) is what lets the closure's input
/// lifetime and output lifetime both stay under the same `for<'c>` binder;
/// a free-standing `Fut: Future` generic can't express "borrows from 'c".
pub type TxFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, RepoError>> + Send + 'c>>;

/// A cloneable handle over a connected pool for some `sqlx::Database`.
pub trait Pool: Clone + Send + Sync + 'static {
    type Db: Database;

    fn pool(&self) -> &sqlx::Pool<Self::Db>;

    /// Executes `body` inside a single transaction, committing on `Ok` and
    /// rolling back on `Err` — the `WithTx` contract of §4.1. Nested calls
    /// are flat; the core never needs savepoints.
    fn with_tx<'a, F, T>(&'a self, body: F) -> impl Future<Output = Result<T, RepoError>> + Send + 'a
    where
        F: for<'c> FnOnce(&'c mut sqlx::Transaction<'_, Self::Db>) -> TxFuture<'c, T> + Send + 'a,
        T: Send + 'a,
    {
        async move {
            let mut tx = self.pool().begin().await.map_err(RepoError::Internal)?;
            match body(&mut tx).await {
                Ok(value) => {
                    tx.commit().await.map_err(RepoError::Internal)?;
                    Ok(value)
                }
                Err(err) => {
                    // Rolling back is best-effort: if the connection already
                    // died, `tx` drops and the server rolls back on its own.
                    let _ = tx.rollback().await;
                    Err(err)
                }
            }
        }
    }
}
