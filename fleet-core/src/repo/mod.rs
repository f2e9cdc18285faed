//! Repository layer: one trait plus one `Db*Repo` struct per entity family,
//! following the teacher's `DbComponentRepo<DB: Pool>` convention. Each
//! `Db*Repo` talks to Postgres directly with hand-written `sqlx::query!`-free
//! queries (we bind by position rather than relying on the compile-time
//! `query!` macro, since this crate builds without a live database to check
//! against at compile time).

pub mod message;
pub mod profile;
pub mod proxy;
pub mod stats;
pub mod task;

pub use message::{DbMessageRepo, MessageRepo};
pub use profile::{DbProfileRepo, ProfileRepo};
pub use proxy::{DbProxyRepo, ProxyRepo};
pub use stats::{DbStatsRepo, GroupProgress, StatsRepo};
pub use task::{ClaimOutcome, DbTaskRepo, RecordFailureOutcome, RecordSuccessOutcome, TaskRepo};
