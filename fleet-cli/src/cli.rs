//! `fleetd`'s command surface, `clap`-derived the way the teacher's own
//! CLIs are (subcommand enum, flags with `#[arg(long, env = "...")]` falling
//! back to `FleetConfig` for anything not overridable per-invocation).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "fleetd", version, about = "Message-delivery fleet scheduler and worker supervisor")]
pub struct Cli {
    /// Path to a TOML config file, layered under defaults and over by `FLEET_*` env vars.
    #[arg(long, env = "FLEET_CONFIG_FILE", default_value = "config/fleet.toml")]
    pub config_file: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs migrations, then starts a supervised run for one group until it
    /// drains or is interrupted.
    Start {
        /// Group whose tasks this run should drive.
        #[arg(long)]
        group: Uuid,
        /// Number of profiles to run workers for.
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Prints per-task progress for a group: total/completed/blocked/in-progress counts.
    Status {
        #[arg(long)]
        group: Uuid,
    },
    /// Applies pending database migrations and exits.
    Migrate,
}
