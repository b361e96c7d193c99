//! Variation operators: how generation `g + 1` is bred from generation `g`.

use super::selection::tournament_select;
use super::EvolutionError;
use crate::config::EvolverConfig;
use crate::grammar::{GrammarBuilder, GrammarRules};
use crate::individual::Individual;
use crate::tree::Tree;
use rand::rngs::StdRng;
use rand::Rng;

/// Attempts at finding a compatible crossover or mutation point before the
/// operator falls back to reproduction.
const MAX_VARIATION_ATTEMPTS: usize = 10;

/// What a breeder may read while producing offspring.
pub struct BreedContext<'a> {
    pub grammar: &'a GrammarRules,
    pub config: &'a EvolverConfig,
}

/// Produces the individuals of the next generation. Offspring that are not
/// flagged `evaluated` are scored by the evolver afterwards.
pub trait Breeder: Send + Sync {
    fn next_generation(
        &self,
        parents: &[Individual],
        count: usize,
        ctx: &BreedContext<'_>,
        rng: &mut StdRng,
    ) -> Result<Vec<Individual>, EvolutionError>;
}

/// Tournament selection, then per offspring: strongly-typed crossover,
/// grow mutation, or plain reproduction.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardBreeder;

impl Breeder for StandardBreeder {
    fn next_generation(
        &self,
        parents: &[Individual],
        count: usize,
        ctx: &BreedContext<'_>,
        rng: &mut StdRng,
    ) -> Result<Vec<Individual>, EvolutionError> {
        if parents.is_empty() {
            return Err(EvolutionError::InsufficientPopulation {
                requested: 1,
                available: 0,
            });
        }
        let keys: Vec<(u64, f64)> = parents
            .iter()
            .enumerate()
            .map(|(i, p)| (i as u64, p.fitness))
            .collect();
        let config = ctx.config;

        let mut offspring = Vec::with_capacity(count);
        while offspring.len() < count {
            let roll: f64 = rng.gen();
            let first = select(parents, &keys, config, rng);
            let child = if roll < config.crossover_probability {
                let second = select(parents, &keys, config, rng);
                crossover(first, second, ctx, rng)
            } else if roll < config.crossover_probability + config.mutation_probability {
                mutate(first, ctx, rng)?
            } else {
                None
            };
            offspring.push(child.unwrap_or_else(|| first.clone()));
        }
        Ok(offspring)
    }
}

fn select<'p>(
    parents: &'p [Individual],
    keys: &[(u64, f64)],
    config: &EvolverConfig,
    rng: &mut StdRng,
) -> &'p Individual {
    let winner = tournament_select(keys, config.tournament_size, config.selection_probability, rng)
        .unwrap_or(0);
    &parents[winner]
}

/// Replaces a random subtree of `receiver` with a subtree of `donor` whose
/// head the receiving slot allows. Returns `None` when no compatible pair
/// was found within the attempt budget.
pub fn crossover<R: Rng>(
    receiver: &Individual,
    donor: &Individual,
    ctx: &BreedContext<'_>,
    rng: &mut R,
) -> Option<Individual> {
    let receiver_points = receiver.tree.preorder();
    let donor_points = donor.tree.preorder();
    if receiver_points.len() < 2 || donor_points.len() < 2 {
        return None;
    }

    for _ in 0..MAX_VARIATION_ATTEMPTS {
        let position = rng.gen_range(1..receiver_points.len());
        let Some(rule) = receiver
            .tree_type_mapping
            .slot(position)
            .and_then(|slot| ctx.grammar.slot(slot))
        else {
            continue;
        };
        let level = receiver_points[position].1;

        let compatible: Vec<&Tree> = donor_points[1..]
            .iter()
            .map(|(subtree, _)| *subtree)
            .filter(|subtree| rule.allows(subtree.node()))
            .filter(|subtree| level - 1 + subtree.depth() <= ctx.config.max_depth)
            .collect();
        if compatible.is_empty() {
            continue;
        }
        let graft = compatible[rng.gen_range(0..compatible.len())].clone();

        let mut tree = receiver.tree.clone();
        tree.replace_subtree(position, graft)?;
        return Some(Individual::new(tree));
    }
    None
}

/// Regrows the subtree at a random non-root point with the grow method,
/// drawing heads from the grammar slot that point occupies.
pub fn mutate<R: Rng>(
    parent: &Individual,
    ctx: &BreedContext<'_>,
    rng: &mut R,
) -> Result<Option<Individual>, EvolutionError> {
    let points = parent.tree.preorder();
    if points.len() < 2 {
        return Ok(None);
    }
    let builder = GrammarBuilder::new(ctx.grammar);

    for _ in 0..MAX_VARIATION_ATTEMPTS {
        let position = rng.gen_range(1..points.len());
        let Some(slot) = parent.tree_type_mapping.slot(position) else {
            continue;
        };
        let Some(rule) = ctx.grammar.slot(slot) else {
            continue;
        };
        let level = points[position].1;
        let replacement = builder.grow_in_slot(rule, slot, level, ctx.config.max_depth, rng)?;

        let mut tree = parent.tree.clone();
        if tree.replace_subtree(position, replacement).is_none() {
            continue;
        }
        if tree.depth() <= ctx.config.max_depth {
            return Ok(Some(Individual::new(tree)));
        }
    }
    Ok(None)
}
