//! The generational loop of one island: seed, evaluate, persist, resume and
//! decide when to stop.

pub mod operators;
pub mod report;
pub mod selection;

use crate::config::{ConfigError, EvalFailurePolicy, EvolverConfig};
use crate::evaluation::fitness::FitnessFunction;
use crate::evaluation::EvalError;
use crate::grammar::{GrammarBuilder, GrammarError, GrammarRules};
use crate::individual::{BestIndividual, Individual, WORST_FITNESS};
use crate::store::{Fetched, PopulationStore, StoreError};
use operators::{BreedContext, Breeder};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use selection::tournament_select_several;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tournament used to pick emigrants.
pub const EMIGRANT_TOURNAMENT_SIZE: usize = 10;
pub const EMIGRANT_SELECTION_PROBABILITY: f64 = 0.8;

#[derive(Error, Debug)]
pub enum EvolutionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Grammar error: {0}")]
    Grammar(#[from] GrammarError),
    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),
    #[error("Invalid evolver configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Could not start the evaluation pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Asked for {requested} emigrants but the frontier holds {available}")]
    InsufficientPopulation { requested: usize, available: usize },
    #[error("The evolver has no population yet")]
    NotSeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvolverState {
    Uninitialized,
    Seeded,
    Evolving,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    FitnessReached,
    GenerationLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub generation: u32,
    pub best: BestIndividual,
    pub reason: TerminationReason,
}

/// Individuals marked for export from a frontier generation. They stay in the
/// source store, hidden, until the batch is confirmed or released.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmigrantBatch {
    pub ticket: Uuid,
    pub source_generation: u32,
    pub records: Vec<Individual>,
}

pub type GenerationHook = Box<dyn FnMut(u32, &BestIndividual) + Send>;

fn termination_reason(
    best: &BestIndividual,
    config: &EvolverConfig,
) -> Option<TerminationReason> {
    if best.fitness <= config.fitness_criterion {
        Some(TerminationReason::FitnessReached)
    } else if best.generation >= config.max_generations {
        Some(TerminationReason::GenerationLimit)
    } else {
        None
    }
}

pub struct Evolver {
    config: EvolverConfig,
    grammar: Arc<GrammarRules>,
    fitness: Arc<dyn FitnessFunction>,
    breeder: Box<dyn Breeder>,
    store: Option<PopulationStore>,
    generation: Option<u32>,
    popsize: usize,
    last_best: Option<BestIndividual>,
    state: EvolverState,
    rng: StdRng,
    pool: rayon::ThreadPool,
    end_of_generation: Option<GenerationHook>,
    // the current generation has not been handed out by `run_sequentially` yet
    unreported: bool,
}

impl Evolver {
    pub fn new(
        config: EvolverConfig,
        grammar: Arc<GrammarRules>,
        fitness: Arc<dyn FitnessFunction>,
        breeder: Box<dyn Breeder>,
    ) -> Result<Self, EvolutionError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_concurrency)
            .build()?;
        Ok(Evolver {
            popsize: config.population_size,
            config,
            grammar,
            fitness,
            breeder,
            store: None,
            generation: None,
            last_best: None,
            state: EvolverState::Uninitialized,
            rng,
            pool,
            end_of_generation: None,
            unreported: false,
        })
    }

    /// Called with every newly persisted generation and its best individual.
    pub fn on_end_of_generation(&mut self, hook: impl FnMut(u32, &BestIndividual) + Send + 'static) {
        self.end_of_generation = Some(Box::new(hook));
    }

    pub fn config(&self) -> &EvolverConfig {
        &self.config
    }

    pub fn state(&self) -> EvolverState {
        self.state
    }

    pub fn store(&self) -> Option<&PopulationStore> {
        self.store.as_ref()
    }

    /// Index of the last persisted generation, `-1` before anything was written.
    pub fn last_generation(&self) -> i64 {
        self.generation.map_or(-1, i64::from)
    }

    /// Nominal population size; tracks migration after each refresh.
    pub fn population_size(&self) -> usize {
        self.popsize
    }

    pub fn fetch_best(&self) -> Option<&BestIndividual> {
        self.last_best.as_ref()
    }

    fn frontier(&self) -> Result<u32, EvolutionError> {
        self.generation.ok_or(EvolutionError::NotSeeded)
    }

    fn store_ref(&self) -> Result<&PopulationStore, EvolutionError> {
        self.store.as_ref().ok_or(EvolutionError::NotSeeded)
    }

    /// Continues from the last generation on disk when resuming is allowed and
    /// a store exists; otherwise builds, evaluates and persists generation 0.
    pub fn resume_or_seed(&mut self) -> Result<(), EvolutionError> {
        let path = self.config.store_path.clone();
        if !self.config.start_from_scratch && PopulationStore::exists(&path) {
            let store = PopulationStore::open(&path)?;
            match store.last_generation() {
                Some(last) => {
                    info!("Resuming {} from generation {}", path.display(), last);
                    self.popsize = store.get_real_popsize(last)?;
                    self.store = Some(store);
                    self.generation = Some(last);
                    self.last_best = Some(self.best_of(last)?);
                    self.state = EvolverState::Seeded;
                    self.unreported = true;
                    return Ok(());
                }
                None => warn!("{} holds no complete generation, seeding afresh", path.display()),
            }
        }

        let mut store = PopulationStore::create(&path)?;
        let trees = GrammarBuilder::new(&self.grammar).build_population(
            &self.config.root_node,
            self.config.build_method,
            self.config.min_depth,
            self.config.max_depth,
            self.config.population_size,
            &mut self.rng,
        )?;
        let mut population: Vec<Individual> = trees.into_iter().map(Individual::new).collect();
        self.evaluate_all(&mut population)?;

        for individual in population {
            store.add_new_individual(individual, 0)?;
        }
        store.seal(0);
        store.flush()?;

        self.popsize = store.get_real_popsize(0)?;
        self.store = Some(store);
        self.generation = Some(0);
        self.state = EvolverState::Seeded;
        self.unreported = true;
        self.finish_generation(0)?;
        Ok(())
    }

    /// Scores every individual not yet evaluated, in parallel.
    fn evaluate_all(&self, individuals: &mut [Individual]) -> Result<(), EvolutionError> {
        let fitness = &self.fitness;
        let policy = self.config.eval_failure_policy;
        self.pool.install(|| {
            individuals
                .par_iter_mut()
                .filter(|individual| !individual.evaluated)
                .try_for_each(|individual| match fitness.fitness(&individual.tree) {
                    Ok(score) => {
                        individual.set_fitness(score);
                        Ok(())
                    }
                    Err(e) => match policy {
                        EvalFailurePolicy::WorstFitness => {
                            debug!("Evaluation failed, assigning worst fitness: {}", e);
                            individual.set_fitness(WORST_FITNESS);
                            Ok(())
                        }
                        EvalFailurePolicy::Abort => Err(e),
                    },
                })
        })?;
        Ok(())
    }

    fn best_of(&self, generation: u32) -> Result<BestIndividual, EvolutionError> {
        let store = self.store_ref()?;
        let (id, fitness) = store.best_of(generation)?;
        let individual = match store.get_individual(generation, id, true)? {
            Fetched::Extracted(_, individual) => individual,
            Fetched::Row(row) => row.extract()?,
        };
        Ok(BestIndividual {
            generation,
            id,
            fitness,
            individual,
        })
    }

    fn finish_generation(&mut self, generation: u32) -> Result<BestIndividual, EvolutionError> {
        let best = self.best_of(generation)?;
        info!(
            "Generation {} done, best fitness {:e} (id {})",
            generation, best.fitness, best.id
        );
        if let Some(hook) = self.end_of_generation.as_mut() {
            hook(generation, &best);
        }
        self.last_best = Some(best.clone());
        Ok(best)
    }

    /// Breeds generation `counter + 1` from the frontier, persists it and
    /// returns its best individual.
    pub fn advance_one_generation(&mut self) -> Result<BestIndividual, EvolutionError> {
        let current = self.frontier()?;
        let next = current + 1;
        let parents: Vec<Individual> = self
            .store_ref()?
            .export_generation(current)?
            .into_iter()
            .map(|(_, individual)| individual)
            .collect();

        let ctx = BreedContext {
            grammar: &self.grammar,
            config: &self.config,
        };
        let mut offspring =
            self.breeder
                .next_generation(&parents, self.popsize, &ctx, &mut self.rng)?;
        self.evaluate_all(&mut offspring)?;

        let store = self.store.as_mut().ok_or(EvolutionError::NotSeeded)?;
        for individual in offspring {
            store.add_new_individual(individual, next)?;
        }
        store.seal(next);
        if let Err(e) = store.flush() {
            store.discard_pending();
            return Err(e.into());
        }

        self.generation = Some(next);
        self.state = EvolverState::Evolving;
        self.unreported = false;
        self.finish_generation(next)
    }

    /// Endless sequence of per-generation bests, starting with the current
    /// generation if it has not been reported yet. Seeds or resumes first if
    /// needed. Stopping is the caller's decision.
    pub fn run_sequentially(
        &mut self,
    ) -> impl Iterator<Item = Result<BestIndividual, EvolutionError>> + '_ {
        std::iter::from_fn(move || {
            if self.generation.is_none() {
                if let Err(e) = self.resume_or_seed() {
                    return Some(Err(e));
                }
            }
            if std::mem::take(&mut self.unreported) {
                if let Some(best) = self.last_best.clone() {
                    return Some(Ok(best));
                }
            }
            Some(self.advance_one_generation())
        })
    }

    /// Runs until the fitness criterion or the generation cap is reached.
    pub fn run(&mut self) -> Result<RunOutcome, EvolutionError> {
        let config = self.config.clone();
        let mut generations = self.run_sequentially();
        let (best, reason) = loop {
            let best = match generations.next() {
                Some(best) => best?,
                None => return Err(EvolutionError::NotSeeded),
            };
            if let Some(reason) = termination_reason(&best, &config) {
                break (best, reason);
            }
        };
        drop(generations);

        self.state = EvolverState::Terminated;
        info!(
            "Evolution ended at generation {} ({:?}), best fitness {:e}",
            best.generation, reason, best.fitness
        );
        Ok(RunOutcome {
            generation: best.generation,
            best,
            reason,
        })
    }

    /// Whether the last persisted generation met the fitness criterion or the
    /// generation cap.
    pub fn is_evolution_ended(&mut self) -> bool {
        let ended = self
            .last_best
            .as_ref()
            .and_then(|best| termination_reason(best, &self.config))
            .is_some();
        if ended {
            self.state = EvolverState::Terminated;
        }
        ended
    }

    /// Picks `max(2, ceil(popsize * probability))` distinct individuals from the
    /// frontier by tournament and marks them exported under a fresh ticket.
    pub fn mark_emigrants(&mut self, probability: f64) -> Result<EmigrantBatch, EvolutionError> {
        let generation = self.frontier()?;
        let migration_size = ((self.popsize as f64 * probability).ceil() as usize).max(2);
        let store = self.store.as_mut().ok_or(EvolutionError::NotSeeded)?;

        let candidates = store.keys_and_fitness(generation)?;
        if candidates.len() < migration_size {
            return Err(EvolutionError::InsufficientPopulation {
                requested: migration_size,
                available: candidates.len(),
            });
        }
        let ids = tournament_select_several(
            &candidates,
            migration_size,
            EMIGRANT_TOURNAMENT_SIZE,
            EMIGRANT_SELECTION_PROBABILITY,
            true,
            &mut self.rng,
        );

        let ticket = Uuid::new_v4();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let record = match store.get_individual(generation, id, true)? {
                Fetched::Extracted(_, individual) => individual,
                Fetched::Row(row) => row.extract()?,
            };
            store.mark_exported(generation, id, ticket)?;
            records.push(record);
        }
        if let Err(e) = store.flush() {
            store.clear_exported(ticket);
            return Err(e.into());
        }
        debug!("Marked {} emigrants under {}", records.len(), ticket);
        Ok(EmigrantBatch {
            ticket,
            source_generation: generation,
            records,
        })
    }

    /// The destination holds the batch: drop it from this island for good.
    pub fn confirm_emigrants(&mut self, ticket: Uuid) -> Result<usize, EvolutionError> {
        let store = self.store.as_mut().ok_or(EvolutionError::NotSeeded)?;
        let removed = store.delete_exported(ticket);
        store.flush()?;
        Ok(removed)
    }

    /// Delivery failed: the batch rejoins this island's population.
    pub fn release_emigrants(&mut self, ticket: Uuid) -> Result<usize, EvolutionError> {
        let store = self.store.as_mut().ok_or(EvolutionError::NotSeeded)?;
        let restored = store.clear_exported(ticket);
        store.flush()?;
        if restored > 0 {
            warn!("Released {} emigrants of batch {}", restored, ticket);
        }
        Ok(restored)
    }

    /// Selects emigrants and deletes them from the frontier in one step.
    pub fn select_and_remove_individuals(
        &mut self,
        probability: f64,
    ) -> Result<Vec<Individual>, EvolutionError> {
        let batch = self.mark_emigrants(probability)?;
        self.confirm_emigrants(batch.ticket)?;
        Ok(batch.records)
    }

    /// Inserts immigrants into the frontier as they are (no re-evaluation) and
    /// returns the refreshed population size.
    pub fn add_new_trees(&mut self, records: Vec<Individual>) -> Result<usize, EvolutionError> {
        let generation = self.frontier()?;
        let store = self.store.as_mut().ok_or(EvolutionError::NotSeeded)?;
        for record in records {
            store.add_new_individual(record, generation)?;
        }
        if let Err(e) = store.flush() {
            store.discard_pending();
            return Err(e.into());
        }
        self.refresh_population_size()
    }

    pub fn refresh_population_size(&mut self) -> Result<usize, EvolutionError> {
        let generation = self.frontier()?;
        self.popsize = self.store_ref()?.get_real_popsize(generation)?;
        Ok(self.popsize)
    }
}

#[cfg(test)]
mod tests {
    use super::operators::StandardBreeder;
    use super::*;
    use crate::grammar::SlotRule;
    use crate::tree::{Node, NodeKind, Tree};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rules() -> Arc<GrammarRules> {
        let slot = SlotRule::new(
            vec![Node::new(NodeKind::Function, 1, "neg")],
            vec![Node::new(NodeKind::Variable, 0, "x")],
        );
        Arc::new(
            GrammarRules::new()
                .with_rule("root", vec![slot.clone()])
                .with_rule("neg", vec![slot]),
        )
    }

    fn config(dir: &std::path::Path) -> EvolverConfig {
        EvolverConfig {
            population_size: 12,
            min_depth: 2,
            max_depth: 5,
            max_generations: 4,
            store_path: dir.join("pop.json"),
            seed: Some(42),
            max_concurrency: 2,
            ..EvolverConfig::default()
        }
    }

    fn size_fitness() -> Arc<dyn FitnessFunction> {
        Arc::new(|tree: &Tree| -> Result<f64, EvalError> { Ok(tree.size() as f64) })
    }

    #[test]
    fn test_seeding_persists_generation_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut evolver =
            Evolver::new(config(dir.path()), rules(), size_fitness(), Box::new(StandardBreeder))
                .unwrap();
        assert_eq!(evolver.last_generation(), -1);
        assert_eq!(evolver.state(), EvolverState::Uninitialized);

        evolver.resume_or_seed().unwrap();
        assert_eq!(evolver.last_generation(), 0);
        assert_eq!(evolver.state(), EvolverState::Seeded);
        let store = evolver.store().unwrap();
        assert_eq!(store.get_real_popsize(0).unwrap(), 12);
        assert!(store
            .export_generation(0)
            .unwrap()
            .iter()
            .all(|(_, individual)| individual.evaluated));
    }

    #[test]
    fn test_run_stops_at_generation_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut evolver =
            Evolver::new(config(dir.path()), rules(), size_fitness(), Box::new(StandardBreeder))
                .unwrap();
        let outcome = evolver.run().unwrap();
        assert_eq!(outcome.generation, 4);
        assert_eq!(outcome.reason, TerminationReason::GenerationLimit);
        assert_eq!(evolver.state(), EvolverState::Terminated);
        assert!(evolver.is_evolution_ended());
    }

    #[test]
    fn test_failed_evaluation_gets_worst_fitness() {
        let dir = tempfile::tempdir().unwrap();
        let failing: Arc<dyn FitnessFunction> = Arc::new(|_: &Tree| -> Result<f64, EvalError> {
            Err(EvalError::UnboundTerminal("x".into()))
        });
        let mut evolver =
            Evolver::new(config(dir.path()), rules(), failing.clone(), Box::new(StandardBreeder))
                .unwrap();
        evolver.resume_or_seed().unwrap();
        assert_eq!(evolver.fetch_best().unwrap().fitness, WORST_FITNESS);

        let dir = tempfile::tempdir().unwrap();
        let mut aborting = config(dir.path());
        aborting.eval_failure_policy = EvalFailurePolicy::Abort;
        let mut evolver =
            Evolver::new(aborting, rules(), failing, Box::new(StandardBreeder)).unwrap();
        assert!(matches!(
            evolver.resume_or_seed(),
            Err(EvolutionError::Eval(EvalError::UnboundTerminal(_)))
        ));
    }

    #[test]
    fn test_hook_sees_every_generation() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let mut evolver =
            Evolver::new(config(dir.path()), rules(), size_fitness(), Box::new(StandardBreeder))
                .unwrap();
        evolver.on_end_of_generation(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        evolver.run().unwrap();
        // generations 0..=4
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_released_emigrants_return_to_population() {
        let dir = tempfile::tempdir().unwrap();
        let mut evolver =
            Evolver::new(config(dir.path()), rules(), size_fitness(), Box::new(StandardBreeder))
                .unwrap();
        evolver.resume_or_seed().unwrap();

        let batch = evolver.mark_emigrants(0.25).unwrap();
        assert_eq!(batch.records.len(), 3);
        assert_eq!(evolver.store().unwrap().get_real_popsize(0).unwrap(), 9);

        assert_eq!(evolver.release_emigrants(batch.ticket).unwrap(), 3);
        assert_eq!(evolver.store().unwrap().get_real_popsize(0).unwrap(), 12);
    }

    #[test]
    fn test_insufficient_population_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut small = config(dir.path());
        small.population_size = 3;
        let mut evolver =
            Evolver::new(small, rules(), size_fitness(), Box::new(StandardBreeder)).unwrap();
        evolver.resume_or_seed().unwrap();
        evolver.select_and_remove_individuals(0.1).unwrap();
        assert!(matches!(
            evolver.select_and_remove_individuals(0.1),
            Err(EvolutionError::InsufficientPopulation {
                requested: 2,
                available: 1
            })
        ));
    }
}
