//! Islands: independently evolving populations arranged in a ring, driven by a
//! coordinator that advances them in lockstep and moves emigrants between
//! neighbours.

pub mod client;
pub mod coordinator;
pub mod migration;
pub mod protocol;
pub mod remote;
pub mod worker;

use crate::evolution::EvolutionError;
use thiserror::Error;

pub use client::{IslandClient, LocalIsland};
pub use coordinator::{IslandCoordinator, IslandsOutcome};
pub use migration::{MigrationOperator, MigrationReport};
pub use protocol::{IslandCommand, IslandReply};
pub use remote::RemoteIsland;
pub use worker::{IslandBlueprint, IslandWorker};

#[derive(Error, Debug)]
pub enum IslandError {
    #[error("Island has no store configured yet")]
    NotConfigured,
    #[error("Island evolution failed: {0}")]
    Evolution(#[from] EvolutionError),
    #[error("Could not reach island: {0}")]
    Transport(String),
    #[error("Island reported an error: {0}")]
    Remote(String),
    #[error("Expected a `{expected}` reply, got `{got}`")]
    UnexpectedReply { expected: &'static str, got: String },
    #[error("Store path template `{0}` has no `{{}}` placeholder")]
    InvalidTemplate(String),
    #[error("A coordinator needs at least one island")]
    NoIslands,
}
