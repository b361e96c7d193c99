use super::client::IslandClient;
use super::migration::{MigrationOperator, MigrationReport};
use super::IslandError;
use crate::evolution::EvolutionError;
use crate::individual::BestIndividual;
use futures::future::join_all;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IslandsOutcome {
    /// Last generation reached by the ring.
    pub generation: u32,
    /// Best individual of each island, in island order.
    pub bests: Vec<BestIndividual>,
}

impl IslandsOutcome {
    pub fn overall_best(&self) -> Option<(usize, &BestIndividual)> {
        self.bests
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.fitness.total_cmp(&b.1.fitness))
    }
}

/// Waits for every island and keeps their order; the first error wins.
async fn fan_out<T, F>(futures: impl IntoIterator<Item = F>) -> Result<Vec<T>, IslandError>
where
    F: std::future::Future<Output = Result<T, IslandError>>,
{
    join_all(futures).await.into_iter().collect()
}

/// Drives a ring of islands in lockstep: every island finishes a generation
/// and a migration round before any island starts the next generation.
pub struct IslandCoordinator<C: IslandClient> {
    islands: Vec<C>,
    store_path_template: String,
    migration: MigrationOperator,
}

impl<C: IslandClient> IslandCoordinator<C> {
    pub fn new(
        islands: Vec<C>,
        store_path_template: impl Into<String>,
        migration: MigrationOperator,
    ) -> Result<Self, IslandError> {
        let store_path_template = store_path_template.into();
        if !store_path_template.contains("{}") {
            return Err(IslandError::InvalidTemplate(store_path_template));
        }
        if islands.is_empty() {
            return Err(IslandError::NoIslands);
        }
        Ok(IslandCoordinator {
            islands,
            store_path_template,
            migration,
        })
    }

    pub fn islands(&self) -> &[C] {
        &self.islands
    }

    /// Store path of island `index`; the template receives the 1-based number.
    pub fn store_path_for(&self, index: usize) -> PathBuf {
        PathBuf::from(
            self.store_path_template
                .replacen("{}", &(index + 1).to_string(), 1),
        )
    }

    /// Sends every island its store path.
    pub async fn parametrize(&self) -> Result<(), IslandError> {
        fan_out(
            self.islands
                .iter()
                .enumerate()
                .map(|(i, island)| island.configure_store(self.store_path_for(i))),
        )
        .await?;
        Ok(())
    }

    pub async fn start(&self) -> Result<Vec<BestIndividual>, IslandError> {
        fan_out(self.islands.iter().map(|island| island.start())).await
    }

    pub async fn advance_all(&self) -> Result<Vec<BestIndividual>, IslandError> {
        fan_out(self.islands.iter().map(|island| island.advance())).await
    }

    pub async fn fetch_bests(&self) -> Result<Vec<BestIndividual>, IslandError> {
        fan_out(self.islands.iter().map(|island| async move {
            island
                .fetch_best()
                .await?
                .ok_or(IslandError::Evolution(EvolutionError::NotSeeded))
        }))
        .await
    }

    pub async fn any_terminated(&self) -> Result<bool, IslandError> {
        let ended = fan_out(self.islands.iter().map(|island| island.check_terminated())).await?;
        Ok(ended.into_iter().any(|ended| ended))
    }

    pub async fn migrate(&self) -> Result<MigrationReport, IslandError> {
        self.migration.manage_migration(&self.islands).await
    }

    fn log_bests(bests: &[BestIndividual]) {
        for (i, best) in bests.iter().enumerate() {
            info!(
                "Island {:>3} | generation {:>5} | best {:>14.6e}",
                i + 1,
                best.generation,
                best.fitness
            );
        }
        let average = bests.iter().map(|best| best.fitness).sum::<f64>() / bests.len() as f64;
        info!("Average best fitness: {:e}", average);
    }

    /// Configures, starts and evolves every island until one of them meets
    /// its termination condition.
    pub async fn evolve(&self) -> Result<IslandsOutcome, IslandError> {
        self.parametrize().await?;
        self.start().await?;
        loop {
            let bests = self.fetch_bests().await?;
            Self::log_bests(&bests);
            if self.any_terminated().await? {
                let generation = bests.iter().map(|best| best.generation).max().unwrap_or(0);
                info!("Island evolution ended at generation {}", generation);
                return Ok(IslandsOutcome { generation, bests });
            }

            let report = self.migrate().await?;
            debug!(
                "Migration moved {} individuals ({} released), sizes [{}]",
                report.delivered,
                report.released,
                report.sizes.iter().join(", ")
            );
            self.advance_all().await?;
        }
    }
}
