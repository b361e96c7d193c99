//! Generation-indexed persistent population table.
//!
//! All generations live in one logical table keyed by `(generation, id)`,
//! persisted as a single JSON document. Every write goes to a temporary file
//! in the same directory which is then renamed over the store, so a reader
//! sees either the previous commit or the new one.
//!
//! Inserts are buffered until [`PopulationStore::flush`]. Deletes and export
//! marks apply to the in-memory view at once and reach disk with the next
//! flush.

use crate::individual::Individual;
use crate::tree::{Tree, TreeError, TypeMapping};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of generation table names: generation 3 is `pop3`.
pub const TABLE_PREFIX: &str = "pop";

const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Individual {id} not found in {table}")]
    NotFound { table: String, id: u64 },
    #[error("No such generation: {0}")]
    NoSuchGeneration(String),
    #[error("Generation {0} holds no individuals")]
    EmptyGeneration(String),
    #[error("Refusing to persist a malformed tree: {0}")]
    Malformed(#[from] TreeError),
    #[error("Store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub fn table_name(generation: u32) -> String {
    format!("{TABLE_PREFIX}{generation}")
}

/// One stored individual. Tree and mapping stay in their serialized form until
/// extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: u64,
    pub tree: String,
    pub tree_type_mapping: String,
    pub tree_depth: usize,
    pub evaluated: bool,
    pub fitness: f64,
    /// Ticket of the emigrant batch this row is leaving with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported: Option<Uuid>,
}

impl Row {
    fn encode(id: u64, individual: &Individual) -> Result<Self, StoreError> {
        individual.tree.validate()?;
        Ok(Row {
            id,
            tree: serde_json::to_string(&individual.tree)?,
            tree_type_mapping: serde_json::to_string(&individual.tree_type_mapping)?,
            tree_depth: individual.tree_depth,
            evaluated: individual.evaluated,
            fitness: individual.fitness,
            exported: None,
        })
    }

    /// Deserializes the tree and mapping into an [`Individual`].
    pub fn extract(&self) -> Result<Individual, StoreError> {
        let tree: Tree = serde_json::from_str(&self.tree)?;
        let tree_type_mapping: TypeMapping = serde_json::from_str(&self.tree_type_mapping)?;
        Ok(Individual {
            tree,
            tree_type_mapping,
            tree_depth: self.tree_depth,
            evaluated: self.evaluated,
            fitness: self.fitness,
        })
    }
}

/// A fetched row, with its individual decoded when extraction was requested.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Row(Row),
    Extracted(Row, Individual),
}

impl Fetched {
    fn build(row: &Row, extract: bool) -> Result<Self, StoreError> {
        if extract {
            Ok(Fetched::Extracted(row.clone(), row.extract()?))
        } else {
            Ok(Fetched::Row(row.clone()))
        }
    }

    pub fn row(&self) -> &Row {
        match self {
            Fetched::Row(row) | Fetched::Extracted(row, _) => row,
        }
    }

    pub fn individual(&self) -> Option<&Individual> {
        match self {
            Fetched::Extracted(_, individual) => Some(individual),
            Fetched::Row(_) => None,
        }
    }

    pub fn into_individual(self) -> Option<Individual> {
        match self {
            Fetched::Extracted(_, individual) => Some(individual),
            Fetched::Row(_) => None,
        }
    }
}

/// Fitness summary of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitnessStats {
    pub max: f64,
    pub min: f64,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GenerationTable {
    rows: BTreeMap<u64, Row>,
    next_id: u64,
    /// Set in the same write as the generation's last rows; an unsealed
    /// generation was interrupted mid-write.
    sealed: bool,
}

impl GenerationTable {
    fn live_rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values().filter(|row| row.exported.is_none())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    generations: BTreeMap<u32, GenerationTable>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            version: FORMAT_VERSION,
            generations: BTreeMap::new(),
        }
    }
}

pub struct PopulationStore {
    path: PathBuf,
    state: Snapshot,
    pending: Vec<(u32, Individual)>,
    pending_seals: Vec<u32>,
    dirty: bool,
}

impl PopulationStore {
    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().is_file()
    }

    /// Opens an existing store (or an empty one if the file is absent).
    /// Generations that were never sealed are dropped: they are recomputed
    /// by the next advance. Export marks left by an interrupted migration are
    /// cleared, since their tickets died with the process that held them; a
    /// batch that did reach its destination is then present on both islands.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut state = if path.is_file() {
            let reader = BufReader::new(File::open(&path)?);
            serde_json::from_reader::<_, Snapshot>(reader)?
        } else {
            Snapshot::default()
        };

        let unsealed: Vec<u32> = state
            .generations
            .iter()
            .filter(|(_, table)| !table.sealed)
            .map(|(g, _)| *g)
            .collect();
        for generation in &unsealed {
            warn!(
                "Discarding incomplete generation {} from {}",
                table_name(*generation),
                path.display()
            );
            state.generations.remove(generation);
        }

        let mut stranded = 0;
        for row in state
            .generations
            .values_mut()
            .flat_map(|table| table.rows.values_mut())
            .filter(|row| row.exported.is_some())
        {
            row.exported = None;
            stranded += 1;
        }
        if stranded > 0 {
            warn!(
                "Restoring {} individuals left marked for export in {}",
                stranded,
                path.display()
            );
        }

        let store = PopulationStore {
            path,
            state,
            pending: Vec::new(),
            pending_seals: Vec::new(),
            dirty: !unsealed.is_empty() || stranded > 0,
        };
        Ok(store)
    }

    /// Starts from scratch: removes any existing file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if path.is_file() {
            fs::remove_file(&path)?;
        }
        Ok(PopulationStore {
            path,
            state: Snapshot::default(),
            pending: Vec::new(),
            pending_seals: Vec::new(),
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn table(&self, generation: u32) -> Result<&GenerationTable, StoreError> {
        self.state
            .generations
            .get(&generation)
            .ok_or_else(|| StoreError::NoSuchGeneration(table_name(generation)))
    }

    fn table_mut(&mut self, generation: u32) -> Result<&mut GenerationTable, StoreError> {
        self.state
            .generations
            .get_mut(&generation)
            .ok_or_else(|| StoreError::NoSuchGeneration(table_name(generation)))
    }

    /// Committed generation indices, ascending.
    pub fn generations(&self) -> Vec<u32> {
        self.state.generations.keys().copied().collect()
    }

    pub fn last_generation(&self) -> Option<u32> {
        self.state.generations.keys().next_back().copied()
    }

    pub fn get_individual(
        &self,
        generation: u32,
        id: u64,
        extract: bool,
    ) -> Result<Fetched, StoreError> {
        let row = self
            .table(generation)?
            .rows
            .get(&id)
            .ok_or_else(|| StoreError::NotFound {
                table: table_name(generation),
                id,
            })?;
        Fetched::build(row, extract)
    }

    /// Lazily yields the rows whose id is in `ids`, in storage order. Ids that
    /// are absent are silently skipped.
    pub fn get_individuals_iterator<'s>(
        &'s self,
        generation: u32,
        ids: &[u64],
        extract: bool,
    ) -> Result<impl Iterator<Item = Result<Fetched, StoreError>> + 's, StoreError> {
        let wanted: HashSet<u64> = ids.iter().copied().collect();
        let table = self.table(generation)?;
        Ok(table
            .rows
            .values()
            .filter(move |row| wanted.contains(&row.id))
            .map(move |row| Fetched::build(row, extract)))
    }

    /// Buffers an insert into `generation`; invisible until [`flush`](Self::flush).
    pub fn add_new_individual(
        &mut self,
        individual: Individual,
        generation: u32,
    ) -> Result<(), StoreError> {
        individual.tree.validate()?;
        self.pending.push((generation, individual));
        Ok(())
    }

    /// Marks `generation` complete; takes effect with the next flush.
    pub fn seal(&mut self, generation: u32) {
        self.pending_seals.push(generation);
    }

    /// Commits buffered inserts, seals, deletes and export marks in one write.
    /// If anything fails, neither the file nor the visible state change and
    /// the buffer is kept for a retry.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() && self.pending_seals.is_empty() && !self.dirty {
            return Ok(());
        }

        let mut next = self.state.clone();
        for (generation, individual) in &self.pending {
            let table = next.generations.entry(*generation).or_default();
            let id = table.next_id;
            table.next_id += 1;
            table.rows.insert(id, Row::encode(id, individual)?);
        }
        for generation in &self.pending_seals {
            next.generations.entry(*generation).or_default().sealed = true;
        }
        write_atomically(&self.path, &next)?;
        debug!(
            "Flushed {} inserts to {}",
            self.pending.len(),
            self.path.display()
        );
        self.state = next;
        self.pending.clear();
        self.pending_seals.clear();
        self.dirty = false;
        Ok(())
    }

    /// Drops buffered inserts and seals without writing them.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_seals.clear();
    }

    pub fn delete(&mut self, generation: u32, id: u64) -> Result<(), StoreError> {
        let table = self.table_mut(generation)?;
        if table.rows.remove(&id).is_none() {
            return Err(StoreError::NotFound {
                table: table_name(generation),
                id,
            });
        }
        self.dirty = true;
        Ok(())
    }

    /// Flags a row as leaving with emigrant batch `ticket`. Flagged rows are
    /// hidden from counts, statistics and selection.
    pub fn mark_exported(
        &mut self,
        generation: u32,
        id: u64,
        ticket: Uuid,
    ) -> Result<(), StoreError> {
        let table = self.table_mut(generation)?;
        let row = table.rows.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            table: table_name(generation),
            id,
        })?;
        row.exported = Some(ticket);
        self.dirty = true;
        Ok(())
    }

    /// Deletes every row flagged with `ticket`; returns how many.
    pub fn delete_exported(&mut self, ticket: Uuid) -> usize {
        let mut removed = 0;
        for table in self.state.generations.values_mut() {
            let before = table.rows.len();
            table.rows.retain(|_, row| row.exported != Some(ticket));
            removed += before - table.rows.len();
        }
        self.dirty |= removed > 0;
        removed
    }

    /// Clears the `ticket` flag, returning the rows to the population.
    pub fn clear_exported(&mut self, ticket: Uuid) -> usize {
        let mut restored = 0;
        for row in self
            .state
            .generations
            .values_mut()
            .flat_map(|table| table.rows.values_mut())
            .filter(|row| row.exported == Some(ticket))
        {
            row.exported = None;
            restored += 1;
        }
        self.dirty |= restored > 0;
        restored
    }

    /// Authoritative number of individuals currently in `generation`.
    pub fn get_real_popsize(&self, generation: u32) -> Result<usize, StoreError> {
        Ok(self.table(generation)?.live_rows().count())
    }

    /// `(id, fitness)` of every live row, the input of tournament selection.
    pub fn keys_and_fitness(&self, generation: u32) -> Result<Vec<(u64, f64)>, StoreError> {
        Ok(self
            .table(generation)?
            .live_rows()
            .map(|row| (row.id, row.fitness))
            .collect())
    }

    /// Every live individual of `generation` with its id.
    pub fn export_generation(&self, generation: u32) -> Result<Vec<(u64, Individual)>, StoreError> {
        self.table(generation)?
            .live_rows()
            .map(|row| Ok((row.id, row.extract()?)))
            .collect()
    }

    /// `(max, min, mean, std)` of the fitness column. Fails with
    /// `NoSuchGeneration` past the last written generation, which readers use
    /// as their stop signal.
    pub fn get_fitness_stats_for(&self, generation: u32) -> Result<FitnessStats, StoreError> {
        let fitness: Vec<f64> = self
            .table(generation)?
            .live_rows()
            .map(|row| row.fitness)
            .collect();
        if fitness.is_empty() {
            return Err(StoreError::EmptyGeneration(table_name(generation)));
        }
        Ok(FitnessStats {
            max: fitness.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            min: fitness.iter().copied().fold(f64::INFINITY, f64::min),
            mean: Statistics::mean(fitness.iter()),
            std: Statistics::population_std_dev(fitness.iter()),
        })
    }

    /// Lowest-fitness live row of `generation` as `(id, fitness)`.
    pub fn best_of(&self, generation: u32) -> Result<(u64, f64), StoreError> {
        self.table(generation)?
            .live_rows()
            .min_by(|a, b| a.fitness.total_cmp(&b.fitness))
            .map(|row| (row.id, row.fitness))
            .ok_or_else(|| StoreError::EmptyGeneration(table_name(generation)))
    }

    /// Best row across every generation as `(generation, id, fitness)`.
    pub fn best_overall(&self) -> Option<(u32, u64, f64)> {
        self.state
            .generations
            .iter()
            .flat_map(|(g, table)| table.live_rows().map(move |row| (*g, row.id, row.fitness)))
            .min_by(|a, b| a.2.total_cmp(&b.2))
    }
}

fn write_atomically(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(directory)?;
    {
        let mut writer = BufWriter::new(file.as_file_mut());
        serde_json::to_writer(&mut writer, snapshot)?;
        writer.flush()?;
    }
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Node, NodeKind};

    fn individual(fitness: f64) -> Individual {
        let tree = Tree::branch(
            Node::new(NodeKind::Root, 1, "root"),
            vec![Tree::leaf(NodeKind::Variable, "x")],
        )
        .unwrap();
        Individual::with_fitness(tree, fitness)
    }

    fn seeded_store(dir: &Path, fitness: &[f64]) -> PopulationStore {
        let mut store = PopulationStore::create(dir.join("pop.json")).unwrap();
        for f in fitness {
            store.add_new_individual(individual(*f), 0).unwrap();
        }
        store.seal(0);
        store.flush().unwrap();
        store
    }

    #[test]
    fn test_inserts_are_invisible_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store(dir.path(), &[1.0, 2.0]);
        store.add_new_individual(individual(3.0), 0).unwrap();
        assert_eq!(store.get_real_popsize(0).unwrap(), 2);
        store.flush().unwrap();
        assert_eq!(store.get_real_popsize(0).unwrap(), 3);
    }

    #[test]
    fn test_failed_flush_leaves_no_partial_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store(dir.path(), &[1.0]);
        // point the store at a directory that does not exist
        store.path = dir.path().join("missing").join("pop.json");
        store.add_new_individual(individual(2.0), 0).unwrap();
        store.add_new_individual(individual(3.0), 0).unwrap();
        assert!(store.flush().is_err());
        assert_eq!(store.get_real_popsize(0).unwrap(), 1);

        let reopened = PopulationStore::open(dir.path().join("pop.json")).unwrap();
        assert_eq!(reopened.get_real_popsize(0).unwrap(), 1);
    }

    #[test]
    fn test_get_and_delete_report_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store(dir.path(), &[1.0, 2.0]);
        let fetched = store.get_individual(0, 1, true).unwrap();
        assert_eq!(fetched.individual().unwrap().fitness, 2.0);
        assert!(matches!(
            store.get_individual(0, 99, false),
            Err(StoreError::NotFound { id: 99, .. })
        ));

        store.delete(0, 1).unwrap();
        assert!(matches!(store.delete(0, 1), Err(StoreError::NotFound { .. })));
        assert_eq!(store.get_real_popsize(0).unwrap(), 1);
    }

    #[test]
    fn test_iterator_yields_requested_rows_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), &[5.0, 6.0, 7.0, 8.0]);
        let mut iter = store.get_individuals_iterator(0, &[3, 1, 42], true).unwrap();
        let first = iter.next().unwrap().unwrap();
        let second = iter.next().unwrap().unwrap();
        assert!(iter.next().is_none());
        let mut ids = vec![first.row().id, second.row().id];
        ids.sort();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_fitness_stats_and_missing_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), &[1.0, 2.0, 3.0, 4.0]);
        let stats = store.get_fitness_stats_for(0).unwrap();
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.min, 1.0);
        assert!((stats.mean - 2.5).abs() < 1e-12);
        assert!((stats.std - 1.25f64.sqrt()).abs() < 1e-12);
        assert!(matches!(
            store.get_fitness_stats_for(1),
            Err(StoreError::NoSuchGeneration(name)) if name == "pop1"
        ));
    }

    #[test]
    fn test_unsealed_generation_is_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pop.json");
        let mut store = seeded_store(dir.path(), &[1.0, 2.0]);
        // generation 1 written but never sealed, as after a crash mid-advance
        store.add_new_individual(individual(0.5), 1).unwrap();
        store.flush().unwrap();
        assert_eq!(store.last_generation(), Some(1));

        let reopened = PopulationStore::open(&path).unwrap();
        assert_eq!(reopened.last_generation(), Some(0));
        assert_eq!(reopened.generations(), vec![0]);
    }

    #[test]
    fn test_export_marks_hide_rows_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store(dir.path(), &[1.0, 2.0, 3.0]);
        let ticket = Uuid::new_v4();
        store.mark_exported(0, 0, ticket).unwrap();
        assert_eq!(store.get_real_popsize(0).unwrap(), 2);
        assert_eq!(store.best_of(0).unwrap(), (1, 2.0));

        assert_eq!(store.clear_exported(ticket), 1);
        assert_eq!(store.get_real_popsize(0).unwrap(), 3);

        store.mark_exported(0, 2, ticket).unwrap();
        assert_eq!(store.delete_exported(ticket), 1);
        store.flush().unwrap();
        let reopened = PopulationStore::open(store.path()).unwrap();
        assert_eq!(reopened.get_real_popsize(0).unwrap(), 2);
    }

    #[test]
    fn test_open_restores_rows_left_marked_for_export() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store(dir.path(), &[1.0, 2.0, 3.0]);
        store.mark_exported(0, 0, Uuid::new_v4()).unwrap();
        store.mark_exported(0, 2, Uuid::new_v4()).unwrap();
        store.flush().unwrap();
        assert_eq!(store.get_real_popsize(0).unwrap(), 1);

        // the tickets are gone along with the process that issued them
        drop(store);
        let mut reopened = PopulationStore::open(dir.path().join("pop.json")).unwrap();
        assert_eq!(reopened.get_real_popsize(0).unwrap(), 3);
        assert_eq!(reopened.best_of(0).unwrap(), (0, 1.0));

        reopened.flush().unwrap();
        let raw = fs::read_to_string(dir.path().join("pop.json")).unwrap();
        assert!(!raw.contains("exported"));
    }

    #[test]
    fn test_infinite_scores_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path(), &[f64::NEG_INFINITY, f64::INFINITY, 0.5]);
        drop(store);

        let reopened = PopulationStore::open(dir.path().join("pop.json")).unwrap();
        let stats = reopened.get_fitness_stats_for(0).unwrap();
        assert_eq!(stats.min, -f64::MAX);
        assert_eq!(stats.max, f64::MAX);
        assert_eq!(reopened.best_of(0).unwrap(), (0, -f64::MAX));
    }

    #[test]
    fn test_ids_are_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store(dir.path(), &[1.0, 2.0]);
        store.delete(0, 1).unwrap();
        store.add_new_individual(individual(9.0), 0).unwrap();
        store.flush().unwrap();
        let ids: Vec<u64> = store.keys_and_fitness(0).unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 2]);
    }
}
