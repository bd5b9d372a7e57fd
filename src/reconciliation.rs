//! The basis reconciliation engine.
//!
//! Reconciliation produces the exact constrained-weight matrices that express a
//! finer basis's degrees of freedom as linear combinations of a coarser basis's
//! degrees of freedom. Four situations arise on an hp-adaptive mesh, and each has
//! its own memoized entry point:
//!
//! 1. [`BasisReconciliation::constrained_weights`]: same cell, same orientation,
//!    different polynomial order (p-reconciliation);
//! 2. [`BasisReconciliation::constrained_weights_for_side`]: matching along a
//!    shared side under a node permutation (orientation reconciliation);
//! 3. [`BasisReconciliation::constrained_weights_refined`]: the finer basis lives
//!    on a geometric descendant of the coarser basis's cell (h-reconciliation);
//! 4. [`BasisReconciliation::constrained_weights_for_refined_side`]: the general
//!    case, matching along an ancestral side through a refinement branch and a
//!    node permutation together.
//!
//! All four share one kernel: evaluate both bases at a common set of cubature
//! points (each in its own frame), form the Gram matrix `L` of the fine basis
//! against itself and the cross matrix `R` of fine against coarse, and solve the
//! dense system `L W = R` for every coarse column at once. `W` is then the
//! L2-projection of each coarse function onto the fine basis: exact, not merely
//! approximate, whenever the coarse function is representable in the fine space.
//!
//! Topology and function-space mismatches are caller bugs and fail fatally, as
//! does a failed permutation search or a singular Gram matrix (a well-formed
//! basis is never rank-deficient against itself).

use crate::basis::{BasisId, BasisRc, BasisValues};
use crate::geometry::CellGeometry;
use crate::quadrature::cubature;
use crate::refinement::RefinementBranch;
use crate::topology::CellTopology;
use nalgebra::{DMatrix, DVector};
use rustc_hash::FxHashMap;

/// The weights reconciling two side-restricted bases: the participating fine and
/// coarse dof ordinals, and the dense matrix expressing fine coefficients in
/// terms of coarse coefficients on those ordinal sets.
#[derive(Debug, Clone)]
pub struct SubBasisReconciliationWeights {
    pub fine_ordinals: Vec<usize>,
    pub coarse_ordinals: Vec<usize>,
    /// Shaped `(fine_ordinals.len(), coarse_ordinals.len())`.
    pub weights: DMatrix<f64>,
}

type SideKey = (BasisId, usize, BasisId, usize, usize);
type RefinedKey = (BasisId, BasisId, RefinementBranch);
type RefinedSideKey = (BasisId, usize, BasisId, usize, RefinementBranch, usize);

/// The reconciliation engine. Each of the four operations is memoized in its own
/// cache; entries live for the engine's lifetime and are never evicted. The
/// engine is deliberately not thread-safe: under a one-partition-per-process
/// model each process computes only the entries it needs, and recomputing a
/// weight set redundantly on another process is cheaper than coordinating.
#[derive(Debug, Default)]
pub struct BasisReconciliation {
    p_weights: FxHashMap<(BasisId, BasisId), DMatrix<f64>>,
    side_weights: FxHashMap<SideKey, SubBasisReconciliationWeights>,
    h_weights: FxHashMap<RefinedKey, DMatrix<f64>>,
    side_h_weights: FxHashMap<RefinedSideKey, SubBasisReconciliationWeights>,
}

impl BasisReconciliation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whole-cell p-reconciliation: weights mapping coefficients of `coarser`
    /// onto `finer`, both on the same cell topology and orientation.
    ///
    /// # Panics
    ///
    /// Panics if the bases' domain topologies have different base keys, or if
    /// their range dimensions disagree.
    pub fn constrained_weights(&mut self, finer: &BasisRc, coarser: &BasisRc) -> &DMatrix<f64> {
        self.p_weights
            .entry((finer.id(), coarser.id()))
            .or_insert_with(|| compute_constrained_weights(finer, coarser))
    }

    /// Side reconciliation: weights relating the side-restricted dofs of the two
    /// bases, with `permutation` aligning the fine side's node ordering to the
    /// coarse side's.
    ///
    /// # Panics
    ///
    /// Panics if the bases disagree on function space.
    pub fn constrained_weights_for_side(
        &mut self,
        finer: &BasisRc,
        finer_side: usize,
        coarser: &BasisRc,
        coarser_side: usize,
        permutation: usize,
    ) -> &SubBasisReconciliationWeights {
        self.side_weights
            .entry((finer.id(), finer_side, coarser.id(), coarser_side, permutation))
            .or_insert_with(|| {
                compute_side_weights(
                    finer,
                    finer_side,
                    &RefinementBranch::empty(),
                    coarser,
                    coarser_side,
                    permutation,
                )
            })
    }

    /// Whole-cell h-reconciliation: the finer basis lives on the descendant cell
    /// reached from the coarser basis's cell through `refinements`.
    pub fn constrained_weights_refined(
        &mut self,
        finer: &BasisRc,
        refinements: &RefinementBranch,
        coarser: &BasisRc,
    ) -> &DMatrix<f64> {
        self.h_weights
            .entry((finer.id(), coarser.id(), refinements.clone()))
            .or_insert_with(|| compute_refined_weights(finer, refinements, coarser))
    }

    /// Side + h reconciliation, the general case: `finer_ancestral_side` is the
    /// side ordinal as seen on the ancestor cell before any of the refinements in
    /// `volume_refinements` occurred; the current fine side is resolved by
    /// walking each pattern's child-to-side table level by level.
    pub fn constrained_weights_for_refined_side(
        &mut self,
        finer: &BasisRc,
        finer_ancestral_side: usize,
        volume_refinements: &RefinementBranch,
        coarser: &BasisRc,
        coarser_side: usize,
        permutation: usize,
    ) -> &SubBasisReconciliationWeights {
        self.side_h_weights
            .entry((
                finer.id(),
                finer_ancestral_side,
                coarser.id(),
                coarser_side,
                volume_refinements.clone(),
                permutation,
            ))
            .or_insert_with(|| {
                compute_side_weights(
                    finer,
                    finer_ancestral_side,
                    volume_refinements,
                    coarser,
                    coarser_side,
                    permutation,
                )
            })
    }
}

/// Brute-force search for the node permutation aligning the fine cell's view of
/// a shared side with the coarse cell's view, by matching physical node
/// coordinates.
///
/// # Panics
///
/// Panics (after logging both node arrays) when no permutation matches; for
/// geometrically consistent inputs this cannot happen, so a failure indicates
/// malformed mesh data or a topology-table bug upstream.
pub fn vertex_permutation(
    fine_topology: CellTopology,
    fine_side: usize,
    fine_cell_nodes: &DMatrix<f64>,
    coarse_topology: CellTopology,
    coarse_side: usize,
    coarse_cell_nodes: &DMatrix<f64>,
) -> usize {
    let side_topology = fine_topology.side_topology(fine_side);
    let d = fine_cell_nodes.ncols();
    let tol = 1e-14;
    for permutation in 0..side_topology.node_permutation_count() {
        let matches = (0..side_topology.node_count()).all(|side_node| {
            let fine_node = fine_topology.side_node(fine_side, side_node);
            let permuted = side_topology.node_permutation(permutation, side_node);
            let coarse_node = coarse_topology.side_node(coarse_side, permuted);
            (0..d).all(|k| {
                (fine_cell_nodes[(fine_node, k)] - coarse_cell_nodes[(coarse_node, k)]).abs() < tol
            })
        });
        if matches {
            return permutation;
        }
    }
    log::error!(
        "matching permutation not found; fine side {} of nodes {}, coarse side {} of nodes {}",
        fine_side,
        fine_cell_nodes,
        coarse_side,
        coarse_cell_nodes
    );
    panic!(
        "no node permutation matches fine side {} against coarse side {}",
        fine_side, coarse_side
    );
}

/// Reference points of side-local `side_points` embedded into the cell's frame.
pub(crate) fn embed_side_points(
    topology: CellTopology,
    side: usize,
    side_points: &DMatrix<f64>,
) -> DMatrix<f64> {
    let side_topology = topology.side_topology(side);
    CellGeometry::new(side_topology, topology.side_reference_nodes(side)).map_points(side_points)
}

/// The weighted inner-product matrix between two sets of basis values, shaped
/// `(a ordinals, b ordinals)`; `None` selects every field.
pub(crate) fn integrate_products(
    a: &BasisValues,
    a_ordinals: Option<&[usize]>,
    b: &BasisValues,
    b_ordinals: Option<&[usize]>,
    weights: &DVector<f64>,
) -> DMatrix<f64> {
    assert_eq!(a.num_points(), b.num_points());
    assert_eq!(a.num_points(), weights.len());
    assert_eq!(
        a.components(),
        b.components(),
        "cannot integrate products of bases with mismatched range dimensions"
    );
    let a_fields: Vec<usize> = match a_ordinals {
        Some(ordinals) => ordinals.to_vec(),
        None => (0..a.fields()).collect(),
    };
    let b_fields: Vec<usize> = match b_ordinals {
        Some(ordinals) => ordinals.to_vec(),
        None => (0..b.fields()).collect(),
    };
    let mut result = DMatrix::zeros(a_fields.len(), b_fields.len());
    for (i, &fa) in a_fields.iter().enumerate() {
        for (j, &fb) in b_fields.iter().enumerate() {
            let mut entry = 0.0;
            for p in 0..a.num_points() {
                let mut dot = 0.0;
                for c in 0..a.components() {
                    dot += a.value(fa, p, c) * b.value(fb, p, c);
                }
                entry += weights[p] * dot;
            }
            result[(i, j)] = entry;
        }
    }
    result
}

/// Solves `gram * W = rhs` for all right-hand sides at once.
///
/// # Panics
///
/// Panics if the Gram matrix is singular; a well-formed basis is never
/// rank-deficient against itself, so this indicates a degenerate basis
/// configuration rather than a recoverable runtime condition.
pub(crate) fn solve_constraint_system(gram: DMatrix<f64>, rhs: DMatrix<f64>) -> DMatrix<f64> {
    let dims = (gram.nrows(), rhs.ncols());
    gram.lu().solve(&rhs).unwrap_or_else(|| {
        panic!("singular {}x{} Gram matrix in basis reconciliation", dims.0, dims.0)
    })
}

fn compute_constrained_weights(finer: &BasisRc, coarser: &BasisRc) -> DMatrix<f64> {
    assert_eq!(
        finer.domain_topology().base_key(),
        coarser.domain_topology().base_key(),
        "bases must agree on domain topology"
    );
    assert_eq!(
        finer.range_dimension(),
        coarser.range_dimension(),
        "bases must agree on range dimension"
    );
    if finer.id() == coarser.id() {
        // A basis reconciles to itself by the identity; returning it directly
        // keeps downstream operator rows exactly sparse.
        return DMatrix::identity(finer.cardinality(), finer.cardinality());
    }
    let topology = finer.domain_topology();
    let rule = cubature(topology, 2 * finer.degree());
    let finer_values = finer.values(&rule.points);
    let coarser_values = coarser.values(&rule.points);
    let gram = integrate_products(&finer_values, None, &finer_values, None, &rule.weights);
    let rhs = integrate_products(&finer_values, None, &coarser_values, None, &rule.weights);
    solve_constraint_system(gram, rhs)
}

fn compute_refined_weights(
    finer: &BasisRc,
    refinements: &RefinementBranch,
    coarser: &BasisRc,
) -> DMatrix<f64> {
    assert_eq!(
        finer.domain_topology().base_key(),
        coarser.domain_topology().base_key(),
        "bases must agree on domain topology"
    );
    if let Some(&(first, _)) = refinements.steps().first() {
        assert_eq!(
            first.parent_topology(),
            coarser.domain_topology(),
            "refinement branch must start at the coarser basis's topology"
        );
    } else if finer.id() == coarser.id() {
        return DMatrix::identity(finer.cardinality(), finer.cardinality());
    }
    let topology = finer.domain_topology();
    let rule = cubature(topology, 2 * finer.degree());
    let fine_nodes_in_coarse = refinements.descendant_nodes_in_reference(topology);
    let coarse_points =
        CellGeometry::new(topology, fine_nodes_in_coarse).map_points(&rule.points);
    let finer_values = finer.values(&rule.points);
    let coarser_values = coarser.values(&coarse_points);
    let gram = integrate_products(&finer_values, None, &finer_values, None, &rule.weights);
    let rhs = integrate_products(&finer_values, None, &coarser_values, None, &rule.weights);
    solve_constraint_system(gram, rhs)
}

/// Shared kernel for the two side-matching operations; an empty branch reduces
/// the general case to plain orientation matching.
fn compute_side_weights(
    finer: &BasisRc,
    finer_ancestral_side: usize,
    volume_refinements: &RefinementBranch,
    coarser: &BasisRc,
    coarser_side: usize,
    permutation: usize,
) -> SubBasisReconciliationWeights {
    let function_space = finer.function_space();
    assert_eq!(
        function_space,
        coarser.function_space(),
        "bases must agree on function space"
    );

    let fine_topology = finer.domain_topology();
    let coarse_topology = coarser.domain_topology();
    let d = fine_topology.dimension();
    let side_dim = d - 1;
    let min_dim = function_space.minimum_continuity_dimension(d);

    let finer_side = volume_refinements
        .resolve_ancestral_side(finer_ancestral_side)
        .unwrap_or_else(|| {
            log::error!(
                "refinement branch {:?} does not stay on ancestral side {}",
                volume_refinements,
                finer_ancestral_side
            );
            panic!("fine cell does not touch ancestral side {}", finer_ancestral_side)
        });
    let side_refinements = volume_refinements
        .side_branch(finer_ancestral_side)
        .expect("side branch exists whenever the ancestral side resolves");

    let fine_ordinals = finer.dof_ordinals_for_subcell(side_dim, finer_side, min_dim);
    let coarse_ordinals = coarser.dof_ordinals_for_subcell(side_dim, coarser_side, min_dim);

    if finer.id() == coarser.id()
        && finer_side == coarser_side
        && permutation == 0
        && volume_refinements.is_empty()
    {
        let n = fine_ordinals.len();
        return SubBasisReconciliationWeights {
            fine_ordinals,
            coarse_ordinals,
            weights: DMatrix::identity(n, n),
        };
    }
    if fine_ordinals.is_empty() || coarse_ordinals.is_empty() {
        let weights = DMatrix::zeros(fine_ordinals.len(), coarse_ordinals.len());
        return SubBasisReconciliationWeights { fine_ordinals, coarse_ordinals, weights };
    }

    let side_topology = fine_topology.side_topology(finer_side);
    assert_eq!(
        side_topology,
        coarse_topology.side_topology(coarser_side),
        "matched sides must share a topology"
    );

    let rule = cubature(side_topology, 2 * finer.degree());

    // Fine evaluation: side cubature points lifted into the fine cell's frame.
    let fine_volume_points = embed_side_points(fine_topology, finer_side, &rule.points);

    // Coarse evaluation: the same side points pushed out through the side-level
    // refinement branch into the permuted ancestral side frame, then lifted into
    // the coarse cell's frame.
    let permuted_side_nodes = side_topology.permuted_reference_nodes(permutation);
    let fine_side_nodes_in_coarse_side = side_refinements.descendant_nodes(&permuted_side_nodes);
    let coarse_side_points =
        CellGeometry::new(side_topology, fine_side_nodes_in_coarse_side).map_points(&rule.points);
    let coarse_volume_points = embed_side_points(coarse_topology, coarser_side, &coarse_side_points);

    let finer_values = finer.values(&fine_volume_points);
    let coarser_values = coarser.values(&coarse_volume_points);

    let gram = integrate_products(
        &finer_values,
        Some(&fine_ordinals),
        &finer_values,
        Some(&fine_ordinals),
        &rule.weights,
    );
    let rhs = integrate_products(
        &finer_values,
        Some(&fine_ordinals),
        &coarser_values,
        Some(&coarse_ordinals),
        &rule.weights,
    );
    let weights = solve_constraint_system(gram, rhs);
    SubBasisReconciliationWeights { fine_ordinals, coarse_ordinals, weights }
}
