//! Asymmetric dot-grid detection built on top of `dotgrid-core`.
//!
//! Pipeline:
//! 1. Multi-threshold blob detection with shape filters ([`BlobDetector`]).
//! 2. Diagonal neighbour graph over blob centres; two lattice axes from
//!    edge-direction clustering.
//! 3. BFS lattice coordinates, matched to the pattern by extent, parity and
//!    handedness ([`CircleGridFinder`]).
//! 4. Radial-symmetry sub-pixel refinement of the ordered centres
//!    ([`refine_centers`]).
//!
//! [`CircleGridDetector`] bundles the steps behind the [`GridDetector`] trait.

mod axes;
mod blob;
mod circle_grid;
mod contour;
mod detector;
mod grid_graph;
mod subpix;

pub use axes::{cluster_axes, AxisClusteringParams};
pub use blob::{BlobDetector, BlobParams, BlobPolarity, BlobSizing, Keypoint};
pub use circle_grid::{CircleGridFinder, CircleGridParams};
pub use detector::{CircleGridDetector, CircleGridDetectorParams, GridDetection, GridDetector};
pub use grid_graph::{
    assign_grid_coordinates, connected_components, GridGraph, GridGraphParams, NeighborDirection,
    NodeNeighbor,
};
pub use subpix::{refine_centers, SubPixParams};
