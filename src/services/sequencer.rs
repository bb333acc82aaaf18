//! Stop sequencing: nearest-neighbour construction followed by 2-opt.
//!
//! Works on matrix indices where 0 is the origin and `i + 1` is the i-th
//! destination in supply order. Output is the visiting order as destination
//! indices (0-based, supply order).

use std::cmp::Ordering;

use tracing::debug;

use crate::defaults::TWO_OPT_MAX_ITERATIONS;
use crate::error::{PlannerError, PlannerResult};
use crate::services::conditions::RoadConditions;
use crate::services::estimator::LegMatrix;
use crate::types::{Leg, OptimizationConstraints};

/// Float noise below this is treated as a tie
const EPSILON: f64 = 1e-9;

/// Penalty weight applied per unit of traffic level
const TRAFFIC_PENALTY_WEIGHT: f64 = 0.5;
/// Penalty weight applied per unit of weather severity
const WEATHER_PENALTY_WEIGHT: f64 = 1.0;

/// Reject destination sets above the configured cap.
pub fn check_capacity(destinations: usize, max_destinations: usize) -> PlannerResult<()> {
    if destinations > max_destinations {
        return Err(PlannerError::validation(format!(
            "load has {} destinations, at most {} can be sequenced",
            destinations, max_destinations
        )));
    }
    Ok(())
}

/// Cost of travelling one leg or a whole path.
///
/// Compared lexicographically: cost, then distance, then duration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TravelCost {
    pub cost: f64,
    pub distance_km: f64,
    pub duration_minutes: f64,
}

impl TravelCost {
    fn plus(self, other: TravelCost) -> TravelCost {
        TravelCost {
            cost: self.cost + other.cost,
            distance_km: self.distance_km + other.distance_km,
            duration_minutes: self.duration_minutes + other.duration_minutes,
        }
    }

    fn minus(self, other: TravelCost) -> TravelCost {
        TravelCost {
            cost: self.cost - other.cost,
            distance_km: self.distance_km - other.distance_km,
            duration_minutes: self.duration_minutes - other.duration_minutes,
        }
    }

    /// Lexicographic comparison with a float tolerance
    pub fn compare(&self, other: &TravelCost) -> Ordering {
        compare_approx(self.cost, other.cost)
            .then_with(|| compare_approx(self.distance_km, other.distance_km))
            .then_with(|| compare_approx(self.duration_minutes, other.duration_minutes))
    }
}

fn compare_approx(a: f64, b: f64) -> Ordering {
    if (a - b).abs() <= EPSILON {
        Ordering::Equal
    } else if a < b {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

/// Weighted cost model derived from the constraints
#[derive(Debug, Clone)]
pub struct CostModel {
    distance_weight: f64,
    duration_weight: f64,
    average_speed_kmh: f64,
    traffic_weight: f64,
    weather_weight: f64,
}

impl CostModel {
    pub fn from_constraints(constraints: &OptimizationConstraints) -> Self {
        let (distance_weight, duration_weight) = if constraints.prioritize_fuel_efficiency {
            (0.8, 0.2)
        } else {
            (0.2, 0.8)
        };

        Self {
            distance_weight,
            duration_weight,
            average_speed_kmh: constraints.average_speed_kmh,
            traffic_weight: if constraints.check_traffic_conditions { TRAFFIC_PENALTY_WEIGHT } else { 0.0 },
            weather_weight: if constraints.avoid_severe_weather { WEATHER_PENALTY_WEIGHT } else { 0.0 },
        }
    }

    /// Cost of a leg; duration is converted to km-equivalent at the average speed.
    pub fn leg_cost(&self, leg: &Leg, conditions: &RoadConditions) -> TravelCost {
        let distance_km = leg.distance_km();
        let duration_minutes = leg.duration_minutes();
        let duration_km_equivalent = duration_minutes / 60.0 * self.average_speed_kmh;

        let base = self.distance_weight * distance_km + self.duration_weight * duration_km_equivalent;
        let penalty = base * (self.traffic_weight * conditions.traffic() + self.weather_weight * conditions.weather());

        TravelCost {
            cost: base + penalty,
            distance_km,
            duration_minutes,
        }
    }
}

/// Orders destinations over a precomputed matrix
pub struct Sequencer<'a> {
    matrix: &'a LegMatrix,
    /// Conditions per matrix index; empty when not requested
    conditions: &'a [RoadConditions],
    model: CostModel,
    include_return_trip: bool,
}

impl<'a> Sequencer<'a> {
    pub fn new(
        matrix: &'a LegMatrix,
        conditions: &'a [RoadConditions],
        constraints: &OptimizationConstraints,
    ) -> Self {
        Self {
            matrix,
            conditions,
            model: CostModel::from_constraints(constraints),
            include_return_trip: constraints.include_return_trip,
        }
    }

    fn edge(&self, from: usize, to: usize) -> TravelCost {
        let conditions = match (self.conditions.get(from), self.conditions.get(to)) {
            (Some(a), Some(b)) => RoadConditions::worst(a, b),
            _ => RoadConditions::UNKNOWN,
        };
        self.model.leg_cost(&self.matrix.get(from, to), &conditions)
    }

    /// Visiting order as destination indices.
    pub fn sequence(&self, max_destinations: usize) -> PlannerResult<Vec<usize>> {
        let n = self.matrix.size().saturating_sub(1);
        check_capacity(n, max_destinations)?;

        if n <= 1 {
            return Ok((0..n).collect());
        }

        let path = self.nearest_neighbor(n);
        let initial = self.path_cost(&path);
        let (path, moves) = self.two_opt(path, n);
        let improved = self.path_cost(&path);

        debug!(
            "Sequenced {} destinations: nearest neighbour cost {:.2}, after {} 2-opt moves {:.2}",
            n, initial.cost, moves, improved.cost
        );

        // Drop the origin and shift back to destination indices
        Ok(path[1..].iter().map(|&node| node - 1).collect())
    }

    /// Open path starting at the origin, always taking the cheapest next leg.
    fn nearest_neighbor(&self, n: usize) -> Vec<usize> {
        let mut path = Vec::with_capacity(n + 1);
        let mut visited = vec![false; n + 1];
        path.push(0);
        visited[0] = true;

        let mut current = 0;
        for _ in 0..n {
            let mut best: Option<(usize, TravelCost)> = None;

            // Candidates in supply order; ties keep the earliest
            for candidate in 1..=n {
                if visited[candidate] {
                    continue;
                }
                let cost = self.edge(current, candidate);
                let better = match &best {
                    None => true,
                    Some((_, best_cost)) => cost.compare(best_cost) == Ordering::Less,
                };
                if better {
                    best = Some((candidate, cost));
                }
            }

            if let Some((next, _)) = best {
                visited[next] = true;
                path.push(next);
                current = next;
            }
        }

        path
    }

    fn path_cost(&self, path: &[usize]) -> TravelCost {
        let mut total = TravelCost::default();
        for pair in path.windows(2) {
            total = total.plus(self.edge(pair[0], pair[1]));
        }
        if self.include_return_trip {
            if let Some(&last) = path.last() {
                total = total.plus(self.edge(last, 0));
            }
        }
        total
    }

    /// Node after position `k`, or the origin when closing a round trip
    fn successor(&self, path: &[usize], k: usize) -> Option<usize> {
        match path.get(k + 1) {
            Some(&node) => Some(node),
            None if self.include_return_trip => Some(0),
            None => None,
        }
    }

    /// Change in path cost from reversing `path[i..=j]`
    fn reversal_delta(&self, path: &[usize], i: usize, j: usize) -> TravelCost {
        let before = path[i - 1];
        let (first, last) = (path[i], path[j]);

        let mut removed = self.edge(before, first);
        let mut added = self.edge(before, last);
        if let Some(after) = self.successor(path, j) {
            removed = removed.plus(self.edge(last, after));
            added = added.plus(self.edge(first, after));
        }

        added.minus(removed)
    }

    /// Best-improvement 2-opt, capped at `min(5000, n²)` applied moves.
    fn two_opt(&self, mut path: Vec<usize>, n: usize) -> (Vec<usize>, usize) {
        let max_moves = TWO_OPT_MAX_ITERATIONS.min(n * n);
        let mut moves = 0;

        while moves < max_moves {
            let mut best: Option<(usize, usize, TravelCost)> = None;

            for i in 1..path.len() - 1 {
                for j in (i + 1)..path.len() {
                    let delta = self.reversal_delta(&path, i, j);
                    if delta.compare(&TravelCost::default()) != Ordering::Less {
                        continue;
                    }
                    let better = match &best {
                        None => true,
                        Some((_, _, best_delta)) => delta.compare(best_delta) == Ordering::Less,
                    };
                    if better {
                        best = Some((i, j, delta));
                    }
                }
            }

            match best {
                Some((i, j, _)) => {
                    path[i..=j].reverse();
                    moves += 1;
                }
                None => break,
            }
        }

        (path, moves)
    }
}
