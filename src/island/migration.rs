use super::client::IslandClient;
use super::IslandError;
use crate::evolution::EmigrantBatch;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_MIGRATION_PROBABILITY: f64 = 0.02;

/// Outcome of one migration round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Population size of every island after the round.
    pub sizes: Vec<usize>,
    /// Individuals that reached their destination.
    pub delivered: usize,
    /// Individuals that went back to their source after a failed delivery.
    pub released: usize,
    /// Delivered individuals restored at their source because the source
    /// could not confirm the hand-off; they now live on both islands.
    pub duplicated: usize,
}

/// Moves emigrants around the ring: island `i` sends one batch east to
/// `(i + 1) mod N` and one west to `(i - 1) mod N`.
///
/// Emigrants are only marked at the source until the destination has stored
/// them, then confirmed (deleted) or released (restored). A failed
/// confirmation restores the batch at the source, and marks left behind by a
/// crash are cleared when the source store is reopened. Either way the batch
/// ends up on both islands: individuals may be duplicated, never lost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MigrationOperator {
    probability: f64,
}

impl Default for MigrationOperator {
    fn default() -> Self {
        MigrationOperator::new(DEFAULT_MIGRATION_PROBABILITY)
    }
}

impl MigrationOperator {
    pub fn new(probability: f64) -> Self {
        MigrationOperator { probability }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    pub async fn manage_migration<C: IslandClient>(
        &self,
        islands: &[C],
    ) -> Result<MigrationReport, IslandError> {
        let n = islands.len();
        let probability = self.probability;

        // --- Select east- and west-bound emigrants everywhere ---
        let selections = join_all(islands.iter().map(|island| async move {
            let east = island.select_emigrants(probability).await;
            let west = island.select_emigrants(probability).await;
            (east, west)
        }))
        .await;

        let mut batches: Vec<(EmigrantBatch, EmigrantBatch)> = Vec::with_capacity(n);
        let mut marked = Vec::new();
        let mut failure = None;
        for (source, (east, west)) in selections.into_iter().enumerate() {
            for batch in [&east, &west].into_iter().flatten() {
                marked.push((source, batch.ticket));
            }
            match (east, west) {
                (Ok(east), Ok(west)) => batches.push((east, west)),
                (Err(e), _) | (_, Err(e)) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(error) = failure {
            warn!("Emigrant selection failed, releasing {} batches: {}", marked.len(), error);
            for (source, ticket) in marked {
                if let Err(e) = islands[source].release_emigrants(ticket).await {
                    warn!("Could not release batch {} on island {}: {}", ticket, source, e);
                }
            }
            return Err(error);
        }

        // --- Deliver, then confirm or release at the source ---
        // Every batch is settled before an error is returned, so one failing
        // island cannot leave the remaining batches marked.
        let mut report = MigrationReport::default();
        let mut failure = None;
        for (source, (east, west)) in batches.into_iter().enumerate() {
            let routes = [(east, (source + 1) % n), (west, (source + n - 1) % n)];
            for (batch, destination) in routes {
                let count = batch.records.len();
                info!("{} => {}", source, destination);
                match islands[destination].insert_immigrants(batch.records).await {
                    Ok(_) => {
                        report.delivered += count;
                        if let Err(e) = islands[source].confirm_emigrants(batch.ticket).await {
                            // the destination holds the batch; restoring it at
                            // the source duplicates it instead of losing it
                            warn!("Could not confirm batch {} on island {}: {}", batch.ticket, source, e);
                            match islands[source].release_emigrants(batch.ticket).await {
                                Ok(restored) => report.duplicated += restored,
                                Err(release) => warn!(
                                    "Could not restore batch {} on island {}: {}",
                                    batch.ticket, source, release
                                ),
                            }
                            failure.get_or_insert(e);
                        }
                    }
                    Err(e) => {
                        warn!("Delivery {} => {} failed: {}", source, destination, e);
                        match islands[source].release_emigrants(batch.ticket).await {
                            Ok(_) => report.released += count,
                            Err(release) => {
                                warn!(
                                    "Could not release batch {} on island {}: {}",
                                    batch.ticket, source, release
                                );
                                failure.get_or_insert(release);
                            }
                        }
                    }
                }
            }
        }
        if let Some(error) = failure {
            return Err(error);
        }

        // --- Refresh nominal sizes ---
        report.sizes = join_all(islands.iter().map(|island| island.population_size()))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(report)
    }
}
