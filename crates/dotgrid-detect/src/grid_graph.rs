//! Neighbour graph over blob centres of an asymmetric grid.
//!
//! In an asymmetric grid every dot has up to four nearest neighbours on the
//! two lattice diagonals. Each node keeps at most one neighbour per
//! direction (`±U`, `±V`); BFS over the graph yields integer steps along the
//! two axes.

use crate::axes::{angular_dist_pi, cluster_axes, wrap_angle_pi, AxisClusteringParams};
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NeighborDirection {
    PlusU,
    MinusU,
    PlusV,
    MinusV,
}

impl NeighborDirection {
    /// Step in `(u, v)` axis units.
    pub fn step(self) -> (i32, i32) {
        match self {
            NeighborDirection::PlusU => (1, 0),
            NeighborDirection::MinusU => (-1, 0),
            NeighborDirection::PlusV => (0, 1),
            NeighborDirection::MinusV => (0, -1),
        }
    }

    fn opposite(self) -> Self {
        match self {
            NeighborDirection::PlusU => NeighborDirection::MinusU,
            NeighborDirection::MinusU => NeighborDirection::PlusU,
            NeighborDirection::PlusV => NeighborDirection::MinusV,
            NeighborDirection::MinusV => NeighborDirection::PlusV,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeNeighbor {
    pub direction: NeighborDirection,
    pub index: usize,
    pub distance: f32,
    pub score: f32,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GridGraphParams {
    pub k_neighbors: usize,
    /// Neighbours farther than `max_spacing_ratio` times a node's nearest
    /// neighbour distance are ignored.
    pub max_spacing_ratio: f32,
    /// Max angle between an edge and its lattice axis (degrees).
    pub orientation_tolerance_deg: f32,
    pub axis_clustering: AxisClusteringParams,
}

impl Default for GridGraphParams {
    fn default() -> Self {
        Self {
            k_neighbors: 8,
            max_spacing_ratio: 1.3,
            orientation_tolerance_deg: 20.0,
            axis_clustering: AxisClusteringParams::default(),
        }
    }
}

fn angle_to_unit(theta: f32) -> Vector2<f32> {
    Vector2::new(theta.cos(), theta.sin())
}

/// Keep at most one neighbor per direction, choosing the lowest-score candidate.
fn select_neighbors(candidates: Vec<NodeNeighbor>) -> Vec<NodeNeighbor> {
    let mut best: [Option<NodeNeighbor>; 4] = [None, None, None, None];

    for candidate in candidates {
        let slot = match candidate.direction {
            NeighborDirection::PlusU => &mut best[0],
            NeighborDirection::MinusU => &mut best[1],
            NeighborDirection::PlusV => &mut best[2],
            NeighborDirection::MinusV => &mut best[3],
        };

        let replace = match slot {
            None => true,
            Some(current) => {
                candidate.score < current.score
                    || (candidate.score == current.score && candidate.distance < current.distance)
            }
        };

        if replace {
            *slot = Some(candidate);
        }
    }

    best.into_iter().flatten().collect()
}

pub struct GridGraph {
    /// For each node, its accepted neighbours.
    pub neighbors: Vec<Vec<NodeNeighbor>>,
    /// Undirected angles of the two lattice axes.
    pub axes: [f32; 2],
}

impl GridGraph {
    /// Build the graph; `None` when no two lattice axes can be found.
    pub fn new(points: &[Point2<f32>], params: &GridGraphParams) -> Option<Self> {
        if points.len() < 4 {
            return None;
        }
        let coords = points.iter().map(|p| [p.x, p.y]).collect::<Vec<_>>();
        let tree: KdTree<f32, 2> = (&coords).into();
        let k = params.k_neighbors.max(2).min(points.len());

        // kNN lists without self, nearest first.
        let knn: Vec<Vec<(usize, f32)>> = coords
            .iter()
            .enumerate()
            .map(|(i, q)| {
                tree.nearest_n::<SquaredEuclidean>(q, k)
                    .into_iter()
                    .map(|nn| (nn.item as usize, nn.distance.sqrt()))
                    .filter(|(j, _)| *j != i)
                    .collect()
            })
            .collect();
        let nearest: Vec<f32> = knn
            .iter()
            .map(|l| l.first().map_or(f32::INFINITY, |n| n.1))
            .collect();

        let close = |i: usize, j: usize, d: f32| {
            d > 0.0
                && d <= params.max_spacing_ratio * nearest[i]
                && d <= params.max_spacing_ratio * nearest[j]
        };

        let mut angles = Vec::new();
        for (i, list) in knn.iter().enumerate() {
            for &(j, d) in list {
                if j > i && close(i, j, d) {
                    let e = points[j] - points[i];
                    angles.push(wrap_angle_pi(e.y.atan2(e.x)));
                }
            }
        }
        let axes = cluster_axes(&angles, &params.axis_clustering)?;
        let units = [angle_to_unit(axes[0]), angle_to_unit(axes[1])];
        let tol = params.orientation_tolerance_deg.to_radians();

        let mut neighbors: Vec<Vec<NodeNeighbor>> = knn
            .iter()
            .enumerate()
            .map(|(i, list)| {
                let candidates = list
                    .iter()
                    .filter(|(j, d)| close(i, *j, *d))
                    .filter_map(|&(j, d)| {
                        let e = points[j] - points[i];
                        let theta = e.y.atan2(e.x);
                        let d0 = angular_dist_pi(theta, axes[0]);
                        let d1 = angular_dist_pi(theta, axes[1]);
                        let (axis, score) = if d0 <= d1 { (0, d0) } else { (1, d1) };
                        if score > tol {
                            return None;
                        }
                        let forward = e.dot(&units[axis]) >= 0.0;
                        let direction = match (axis, forward) {
                            (0, true) => NeighborDirection::PlusU,
                            (0, false) => NeighborDirection::MinusU,
                            (_, true) => NeighborDirection::PlusV,
                            (_, false) => NeighborDirection::MinusV,
                        };
                        Some(NodeNeighbor {
                            direction,
                            index: j,
                            distance: d,
                            score,
                        })
                    })
                    .collect();
                select_neighbors(candidates)
            })
            .collect();

        // Keep mutual edges only.
        let snapshot: Vec<Vec<(usize, NeighborDirection)>> = neighbors
            .iter()
            .map(|l| l.iter().map(|n| (n.index, n.direction)).collect())
            .collect();
        for (i, list) in neighbors.iter_mut().enumerate() {
            list.retain(|n| snapshot[n.index].contains(&(i, n.direction.opposite())));
        }

        Some(Self { neighbors, axes })
    }
}

pub fn connected_components(graph: &GridGraph) -> Vec<Vec<usize>> {
    let mut visited = vec![false; graph.neighbors.len()];
    let mut components = Vec::new();

    for start in 0..graph.neighbors.len() {
        if visited[start] {
            continue;
        }

        let mut component = Vec::new();
        let mut stack = vec![start];

        while let Some(node) = stack.pop() {
            if visited[node] {
                continue;
            }
            visited[node] = true;
            component.push(node);

            for neighbor in &graph.neighbors[node] {
                if !visited[neighbor.index] {
                    stack.push(neighbor.index);
                }
            }
        }

        components.push(component);
    }

    components
}

/// BFS integer `(u, v)` coordinates over one component.
///
/// Returns `None` when the steps are inconsistent: a node reached at two
/// different coordinates, or two nodes claiming the same coordinate.
pub fn assign_grid_coordinates(graph: &GridGraph, component: &[usize]) -> Option<Vec<(usize, i32, i32)>> {
    let start = *component.first()?;
    let mut coords: HashMap<usize, (i32, i32)> = HashMap::with_capacity(component.len());
    let mut queue = VecDeque::new();
    coords.insert(start, (0, 0));
    queue.push_back(start);

    while let Some(node) = queue.pop_front() {
        let (u, v) = coords[&node];
        for neighbor in &graph.neighbors[node] {
            let (du, dv) = neighbor.direction.step();
            let target = (u + du, v + dv);
            match coords.get(&neighbor.index) {
                Some(&seen) if seen != target => return None,
                Some(_) => {}
                None => {
                    coords.insert(neighbor.index, target);
                    queue.push_back(neighbor.index);
                }
            }
        }
    }

    let mut out: Vec<(usize, i32, i32)> = coords.into_iter().map(|(n, (u, v))| (n, u, v)).collect();
    out.sort_unstable();
    let mut cells: Vec<(i32, i32)> = out.iter().map(|&(_, u, v)| (u, v)).collect();
    cells.sort_unstable();
    cells.dedup();
    if cells.len() != out.len() {
        return None;
    }
    Some(out)
}
