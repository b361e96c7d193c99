use crate::store::{table_name, FitnessStats, PopulationStore, StoreError};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Per-generation fitness statistics of one store, generation 0 upward.
/// A generation that migration drained completely has no statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FitnessHistory {
    pub generations: Vec<(u32, Option<FitnessStats>)>,
}

impl FitnessHistory {
    /// Reads statistics until the first missing generation. Empty
    /// generations are kept as `None` so later ones are still reported.
    pub fn from_store(store: &PopulationStore) -> Result<Self, StoreError> {
        let mut generations = Vec::new();
        for generation in 0.. {
            match store.get_fitness_stats_for(generation) {
                Ok(stats) => generations.push((generation, Some(stats))),
                Err(StoreError::EmptyGeneration(table)) => {
                    debug!("{} holds no individuals", table);
                    generations.push((generation, None));
                }
                Err(StoreError::NoSuchGeneration(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(FitnessHistory { generations })
    }

    /// Best (lowest) minimum fitness seen and the generation it came from.
    pub fn best(&self) -> Option<(u32, f64)> {
        self.generations
            .iter()
            .filter_map(|(generation, stats)| stats.as_ref().map(|stats| (*generation, stats.min)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

impl fmt::Display for FitnessHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<10} {:>14} {:>14} {:>14} {:>14}",
            "table", "max", "min", "mean", "std"
        )?;
        for (generation, stats) in &self.generations {
            let Some(stats) = stats else {
                writeln!(f, "{:<10} {:>14}", table_name(*generation), "empty")?;
                continue;
            };
            writeln!(
                f,
                "{:<10} {:>14.6e} {:>14.6e} {:>14.6e} {:>14.6e}",
                table_name(*generation),
                stats.max,
                stats.min,
                stats.mean,
                stats.std
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::individual::Individual;
    use crate::tree::{NodeKind, Tree};

    #[test]
    fn test_history_stops_at_first_missing_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PopulationStore::create(dir.path().join("pop.json")).unwrap();
        for generation in 0..3u32 {
            for k in 0..4 {
                let fitness = (10 - generation) as f64 + k as f64;
                store
                    .add_new_individual(
                        Individual::with_fitness(Tree::leaf(NodeKind::Variable, "x"), fitness),
                        generation,
                    )
                    .unwrap();
            }
            store.seal(generation);
        }
        store.flush().unwrap();

        let history = FitnessHistory::from_store(&store).unwrap();
        assert_eq!(history.generations.len(), 3);
        assert_eq!(history.best(), Some((2, 8.0)));
        let table = history.to_string();
        assert!(table.contains("pop2"));
        assert!(!table.contains("pop3"));
    }

    #[test]
    fn test_history_reports_drained_generation_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PopulationStore::create(dir.path().join("pop.json")).unwrap();
        for generation in 0..3u32 {
            for k in 0..2 {
                store
                    .add_new_individual(
                        Individual::with_fitness(Tree::leaf(NodeKind::Variable, "x"), k as f64 + 1.0),
                        generation,
                    )
                    .unwrap();
            }
            store.seal(generation);
        }
        store.flush().unwrap();
        // every individual of pop1 left with emigrant batches
        let ids: Vec<u64> = store.keys_and_fitness(1).unwrap().into_iter().map(|(id, _)| id).collect();
        for id in ids {
            store.delete(1, id).unwrap();
        }
        store.flush().unwrap();

        let history = FitnessHistory::from_store(&store).unwrap();
        assert_eq!(history.generations.len(), 3);
        assert_eq!(history.generations[1], (1, None));
        assert!(history.generations[2].1.is_some());
        assert_eq!(history.best(), Some((0, 1.0)));
        let table = history.to_string();
        assert!(table.contains("pop1"));
        assert!(table.contains("empty"));
        assert!(table.contains("pop2"));
    }
}
