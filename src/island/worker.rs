use super::protocol::{IslandCommand, IslandReply};
use super::IslandError;
use crate::config::EvolverConfig;
use crate::evaluation::fitness::FitnessFunction;
use crate::evolution::operators::StandardBreeder;
use crate::evolution::{EvolutionError, Evolver};
use crate::grammar::GrammarRules;
use crate::problems::{Problem, ProblemKind};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Everything needed to build an island's evolver once it learns its store.
#[derive(Clone)]
pub struct IslandBlueprint {
    pub config: EvolverConfig,
    pub grammar: Arc<GrammarRules>,
    pub fitness: Arc<dyn FitnessFunction>,
}

impl IslandBlueprint {
    pub fn new(
        config: EvolverConfig,
        grammar: Arc<GrammarRules>,
        fitness: Arc<dyn FitnessFunction>,
    ) -> Self {
        IslandBlueprint {
            config,
            grammar,
            fitness,
        }
    }

    pub fn from_problem(mut config: EvolverConfig, kind: ProblemKind) -> Result<Self, EvolutionError> {
        let Problem {
            grammar,
            fitness,
            root,
        } = kind.build()?;
        config.root_node = root;
        Ok(IslandBlueprint::new(config, Arc::new(grammar), fitness))
    }

    /// Blueprint for island `index` of a ring: a fixed seed is offset so that
    /// islands do not start from identical populations.
    pub fn for_island(&self, index: usize) -> Self {
        let mut blueprint = self.clone();
        blueprint.config.seed = self.config.seed.map(|seed| seed.wrapping_add(index as u64));
        blueprint
    }

    pub fn build(&self, store_path: PathBuf) -> Result<Evolver, EvolutionError> {
        let mut config = self.config.clone();
        config.store_path = store_path;
        Evolver::new(
            config,
            Arc::clone(&self.grammar),
            Arc::clone(&self.fitness),
            Box::new(StandardBreeder),
        )
    }
}

/// Island-side command dispatcher; owns at most one evolver.
pub struct IslandWorker {
    blueprint: IslandBlueprint,
    evolver: Option<Evolver>,
}

impl IslandWorker {
    pub fn new(blueprint: IslandBlueprint) -> Self {
        IslandWorker {
            blueprint,
            evolver: None,
        }
    }

    pub fn evolver(&self) -> Option<&Evolver> {
        self.evolver.as_ref()
    }

    fn evolver_mut(&mut self) -> Result<&mut Evolver, IslandError> {
        self.evolver.as_mut().ok_or(IslandError::NotConfigured)
    }

    pub fn handle(&mut self, command: IslandCommand) -> Result<IslandReply, IslandError> {
        let reply = match command {
            IslandCommand::ConfigureStore { path } => {
                info!("Configuring island store at {}", path.display());
                self.evolver = Some(self.blueprint.build(path)?);
                IslandReply::Configured
            }
            IslandCommand::StartGenerator => {
                let evolver = self.evolver_mut()?;
                evolver.resume_or_seed()?;
                let best = evolver.fetch_best().cloned().ok_or(EvolutionError::NotSeeded)?;
                IslandReply::Generation(best)
            }
            IslandCommand::AdvanceGeneration => {
                IslandReply::Generation(self.evolver_mut()?.advance_one_generation()?)
            }
            IslandCommand::FetchBest => IslandReply::Best(self.evolver_mut()?.fetch_best().cloned()),
            IslandCommand::CheckTerminated => {
                IslandReply::Terminated(self.evolver_mut()?.is_evolution_ended())
            }
            IslandCommand::SelectEmigrants { probability } => {
                IslandReply::Emigrants(self.evolver_mut()?.mark_emigrants(probability)?)
            }
            IslandCommand::InsertImmigrants { batch } => IslandReply::Inserted {
                population_size: self.evolver_mut()?.add_new_trees(batch)?,
            },
            IslandCommand::ConfirmEmigrants { ticket } => IslandReply::Confirmed {
                removed: self.evolver_mut()?.confirm_emigrants(ticket)?,
            },
            IslandCommand::ReleaseEmigrants { ticket } => IslandReply::Released {
                restored: self.evolver_mut()?.release_emigrants(ticket)?,
            },
            IslandCommand::PopulationSize => {
                IslandReply::PopulationSize(self.evolver_mut()?.refresh_population_size()?)
            }
        };
        Ok(reply)
    }
}
