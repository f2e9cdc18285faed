//! Core of the distributed task scheduler and worker-supervision system:
//! the persistent task queue, proxy registry, error classifier, per-profile
//! worker loop, and supervisor. The browser-automation driver itself is out
//! of scope (see `driver` for the seam) — this crate only schedules and
//! supervises it.

pub mod classifier;
pub mod clock;
pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod model;
pub mod proxy_registry;
pub mod queue;
pub mod rate;
pub mod repo;
pub mod supervisor;
pub mod worker;
