use rand::seq::index;
use rand::Rng;

/// Runs one tournament over `candidates` (`(id, fitness)` pairs, lower fitness
/// wins) and returns the index of the winner within `candidates`.
///
/// `size` entrants are drawn without replacement. The best entrant wins with
/// probability `probability`, otherwise the next best gets the same chance,
/// and so on; the worst entrant takes whatever is left.
pub fn tournament_select<R: Rng>(
    candidates: &[(u64, f64)],
    size: usize,
    probability: f64,
    rng: &mut R,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let size = size.clamp(1, candidates.len());
    let mut entrants: Vec<usize> = index::sample(rng, candidates.len(), size).into_vec();
    entrants.sort_by(|&a, &b| candidates[a].1.total_cmp(&candidates[b].1));

    let last = entrants.len() - 1;
    for (rank, entrant) in entrants.iter().enumerate() {
        if rank == last || rng.gen_bool(probability) {
            return Some(*entrant);
        }
    }
    None
}

/// Runs `count` tournaments. With `unique`, each winner is withdrawn from
/// later tournaments so the ids returned are distinct; the caller must make
/// sure `count <= candidates.len()` in that case.
pub fn tournament_select_several<R: Rng>(
    candidates: &[(u64, f64)],
    count: usize,
    size: usize,
    probability: f64,
    unique: bool,
    rng: &mut R,
) -> Vec<u64> {
    let mut pool = candidates.to_vec();
    let mut winners = Vec::with_capacity(count);
    while winners.len() < count {
        let Some(winner) = tournament_select(&pool, size, probability, rng) else {
            break;
        };
        if unique {
            winners.push(pool.swap_remove(winner).0);
        } else {
            winners.push(pool[winner].0);
        }
    }
    winners
}
