//! Refinement patterns and refinement branches.
//!
//! A [`RefinementPattern`] describes one subdivision of a reference cell into
//! children, together with the combinatorial tables the rest of the crate walks:
//! which children touch which parent side, where each child sits within a side,
//! and the induced refinement pattern of each side. A [`RefinementBranch`] is an
//! ordered chain of (pattern, child index) pairs describing the descent from an
//! ancestor cell to one of its geometric descendants; it is both a cache key
//! (element-wise equality) and the input to geometric composition.

use crate::geometry::CellGeometry;
use crate::topology::{CellShape, CellTopology};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// A single refinement scheme of a reference cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefinementPattern {
    /// The trivial "refinement" leaving the cell untouched; the induced side
    /// pattern of a line's vertex sides.
    Null(CellShape),
    /// Splits a line at its midpoint into two children.
    LineHalving,
    /// Splits a quad isotropically into four children; child `i` is the
    /// quadrant containing vertex `i`.
    QuadQuartering,
}

impl RefinementPattern {
    /// The canonical isotropic pattern for a topology.
    pub fn isotropic(topology: CellTopology) -> RefinementPattern {
        assert_eq!(topology.tensorial_degree(), 0, "no refinement patterns for tensorial topologies");
        match topology.shape() {
            CellShape::Line => RefinementPattern::LineHalving,
            CellShape::Quad => RefinementPattern::QuadQuartering,
            shape => panic!("no isotropic refinement pattern for {:?}", shape),
        }
    }

    pub fn parent_topology(&self) -> CellTopology {
        match self {
            RefinementPattern::Null(shape) => CellTopology::new(*shape, 0),
            RefinementPattern::LineHalving => CellTopology::line(),
            RefinementPattern::QuadQuartering => CellTopology::quad(),
        }
    }

    pub fn child_count(&self) -> usize {
        match self {
            RefinementPattern::Null(_) => 1,
            RefinementPattern::LineHalving => 2,
            RefinementPattern::QuadQuartering => 4,
        }
    }

    /// Reference coordinates of the child's nodes within the parent's reference
    /// cell, in the parent topology's node ordering.
    pub fn child_reference_nodes(&self, child: usize) -> DMatrix<f64> {
        assert!(child < self.child_count(), "{:?} has no child {}", self, child);
        match self {
            RefinementPattern::Null(_) => self.parent_topology().reference_nodes(),
            RefinementPattern::LineHalving => {
                if child == 0 {
                    DMatrix::from_row_slice(2, 1, &[-1.0, 0.0])
                } else {
                    DMatrix::from_row_slice(2, 1, &[0.0, 1.0])
                }
            }
            RefinementPattern::QuadQuartering => {
                // quadrant corners, counterclockwise from the vertex the child
                // shares with the parent
                let corners: [[f64; 8]; 4] = [
                    [-1.0, -1.0, 0.0, -1.0, 0.0, 0.0, -1.0, 0.0],
                    [0.0, -1.0, 1.0, -1.0, 1.0, 0.0, 0.0, 0.0],
                    [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0],
                    [-1.0, 0.0, 0.0, 0.0, 0.0, 1.0, -1.0, 1.0],
                ];
                DMatrix::from_row_slice(4, 2, &corners[child])
            }
        }
    }

    /// The children adjacent to a parent side, as (child ordinal, child side
    /// ordinal) pairs ordered along the side's direction.
    pub fn children_for_side(&self, side: usize) -> Vec<(usize, usize)> {
        match self {
            RefinementPattern::Null(_) => vec![(0, side)],
            RefinementPattern::LineHalving => match side {
                0 => vec![(0, 0)],
                1 => vec![(1, 1)],
                _ => panic!("line has no side {}", side),
            },
            RefinementPattern::QuadQuartering => match side {
                0 => vec![(0, 0), (1, 0)],
                1 => vec![(1, 1), (2, 1)],
                2 => vec![(2, 2), (3, 2)],
                3 => vec![(3, 3), (0, 3)],
                _ => panic!("quad has no side {}", side),
            },
        }
    }

    /// The refinement pattern induced on a parent side.
    pub fn side_pattern(&self, side: usize) -> RefinementPattern {
        let side_shape = self.parent_topology().side_topology(side).shape();
        match self {
            RefinementPattern::Null(_) => RefinementPattern::Null(side_shape),
            RefinementPattern::LineHalving => RefinementPattern::Null(CellShape::Node),
            RefinementPattern::QuadQuartering => RefinementPattern::LineHalving,
        }
    }

    /// Where the given child sits within the side's own refinement (its child
    /// index in [`Self::side_pattern`]), or `None` if the child does not touch
    /// the side.
    pub fn child_position_on_side(&self, side: usize, child: usize) -> Option<usize> {
        self.children_for_side(side).iter().position(|&(c, _)| c == child)
    }
}

/// An ordered chain of refinements connecting an ancestor cell to one of its
/// descendants. Two branches are equal iff their step sequences are equal
/// element-wise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefinementBranch {
    steps: Vec<(RefinementPattern, usize)>,
}

impl RefinementBranch {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<(RefinementPattern, usize)>) -> Self {
        RefinementBranch { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn steps(&self) -> &[(RefinementPattern, usize)] {
        &self.steps
    }

    /// Node placement of the descendant relative to the given placement of the
    /// ancestor: a left fold of the child-to-parent maps, one per branch level.
    pub fn descendant_nodes(&self, ancestor_nodes: &DMatrix<f64>) -> DMatrix<f64> {
        let mut nodes = ancestor_nodes.clone();
        for &(pattern, child) in &self.steps {
            let geometry = CellGeometry::new(pattern.parent_topology(), nodes);
            nodes = geometry.map_points(&pattern.child_reference_nodes(child));
        }
        nodes
    }

    /// Node placement of the descendant in the ancestor's own reference frame.
    pub fn descendant_nodes_in_reference(&self, ancestor: CellTopology) -> DMatrix<f64> {
        self.descendant_nodes(&ancestor.reference_nodes())
    }

    /// Resolves an ancestral side ordinal to the descendant's side ordinal by
    /// walking each level's child-to-side table, or `None` if some step's child
    /// leaves the side.
    pub fn resolve_ancestral_side(&self, ancestral_side: usize) -> Option<usize> {
        let mut side = ancestral_side;
        for &(pattern, child) in &self.steps {
            let (_, child_side) =
                *pattern.children_for_side(side).iter().find(|&&(c, _)| c == child)?;
            side = child_side;
        }
        Some(side)
    }

    /// The side-only refinement branch induced on an ancestral side, skipping
    /// trivial (null) side refinements, or `None` if the descendant leaves the
    /// side. Together with [`Self::resolve_ancestral_side`] this is the
    /// side-level view of a volume branch.
    pub fn side_branch(&self, ancestral_side: usize) -> Option<RefinementBranch> {
        let mut side = ancestral_side;
        let mut steps = Vec::new();
        for &(pattern, child) in &self.steps {
            let position = pattern.child_position_on_side(side, child)?;
            let side_pattern = pattern.side_pattern(side);
            if !matches!(side_pattern, RefinementPattern::Null(_)) {
                steps.push((side_pattern, position));
            }
            side = self.step_child_side(pattern, side, child);
        }
        Some(RefinementBranch { steps })
    }

    fn step_child_side(&self, pattern: RefinementPattern, side: usize, child: usize) -> usize {
        pattern
            .children_for_side(side)
            .iter()
            .find(|&&(c, _)| c == child)
            .map(|&(_, s)| s)
            .expect("checked by caller")
    }
}
