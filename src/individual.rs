use crate::tree::{Tree, TypeMapping};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Fitness given to trees whose evaluation failed. Kept finite so it survives
/// JSON persistence.
pub const WORST_FITNESS: f64 = f64::MAX;

/// One candidate program together with its cached metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Individual {
    pub tree: Tree,
    pub tree_type_mapping: TypeMapping,
    pub tree_depth: usize,
    pub evaluated: bool,
    pub fitness: f64,
}

impl Individual {
    /// A freshly built tree awaiting evaluation.
    pub fn new(tree: Tree) -> Self {
        Individual {
            tree_type_mapping: TypeMapping::of(&tree),
            tree_depth: tree.depth(),
            tree,
            evaluated: false,
            fitness: WORST_FITNESS,
        }
    }

    pub fn with_fitness(tree: Tree, fitness: f64) -> Self {
        let mut individual = Individual::new(tree);
        individual.set_fitness(fitness);
        individual
    }

    /// Records the evaluation result. NaN counts as the worst possible score;
    /// infinities are clamped to the finite range so the score stays
    /// representable in JSON.
    pub fn set_fitness(&mut self, fitness: f64) {
        self.fitness = if fitness.is_nan() {
            WORST_FITNESS
        } else {
            fitness.clamp(-WORST_FITNESS, WORST_FITNESS)
        };
        self.evaluated = true;
    }

    /// Lower fitness is better.
    pub fn compare_fitness(&self, other: &Individual) -> Ordering {
        self.fitness.total_cmp(&other.fitness)
    }
}

/// Best individual of a generation, as reported to drivers and coordinators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestIndividual {
    pub generation: u32,
    pub id: u64,
    pub fitness: f64,
    pub individual: Individual,
}
