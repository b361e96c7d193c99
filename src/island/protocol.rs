//! Typed request/response messages between a coordinator and an island.

use crate::evolution::EmigrantBatch;
use crate::individual::{BestIndividual, Individual};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IslandCommand {
    /// Point the island at its store. Must come first.
    ConfigureStore { path: PathBuf },
    /// Resume from the store or seed generation 0.
    StartGenerator,
    AdvanceGeneration,
    FetchBest,
    CheckTerminated,
    /// Mark emigrants for export; they leave for good on `ConfirmEmigrants`.
    SelectEmigrants { probability: f64 },
    InsertImmigrants { batch: Vec<Individual> },
    ConfirmEmigrants { ticket: Uuid },
    ReleaseEmigrants { ticket: Uuid },
    PopulationSize,
}

impl IslandCommand {
    pub fn name(&self) -> &'static str {
        match self {
            IslandCommand::ConfigureStore { .. } => "ConfigureStore",
            IslandCommand::StartGenerator => "StartGenerator",
            IslandCommand::AdvanceGeneration => "AdvanceGeneration",
            IslandCommand::FetchBest => "FetchBest",
            IslandCommand::CheckTerminated => "CheckTerminated",
            IslandCommand::SelectEmigrants { .. } => "SelectEmigrants",
            IslandCommand::InsertImmigrants { .. } => "InsertImmigrants",
            IslandCommand::ConfirmEmigrants { .. } => "ConfirmEmigrants",
            IslandCommand::ReleaseEmigrants { .. } => "ReleaseEmigrants",
            IslandCommand::PopulationSize => "PopulationSize",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IslandReply {
    Configured,
    /// Best individual of the generation just started or produced.
    Generation(BestIndividual),
    Best(Option<BestIndividual>),
    Terminated(bool),
    Emigrants(EmigrantBatch),
    Inserted { population_size: usize },
    Confirmed { removed: usize },
    Released { restored: usize },
    PopulationSize(usize),
}

impl IslandReply {
    pub fn name(&self) -> &'static str {
        match self {
            IslandReply::Configured => "Configured",
            IslandReply::Generation(_) => "Generation",
            IslandReply::Best(_) => "Best",
            IslandReply::Terminated(_) => "Terminated",
            IslandReply::Emigrants(_) => "Emigrants",
            IslandReply::Inserted { .. } => "Inserted",
            IslandReply::Confirmed { .. } => "Confirmed",
            IslandReply::Released { .. } => "Released",
            IslandReply::PopulationSize(_) => "PopulationSize",
        }
    }
}
