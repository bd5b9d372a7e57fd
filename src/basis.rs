//! The basis evaluator.
//!
//! Bases are nodal (Lagrange) families at runtime polynomial degree:
//!
//! - [`Basis::h_grad`]: continuity-carrying tensor-product bases on Gauss-Lobatto
//!   support points, with every degree of freedom classified to the reference
//!   subcell (vertex, edge, face or interior) its node lies on;
//! - [`Basis::h_vol`]: discontinuous tensor-product bases on interior Gauss
//!   points, every degree of freedom associated with the cell interior;
//! - [`Basis::vectorized`]: a rank-one (vector-valued) wrapper around a scalar
//!   basis, component-major;
//! - [`Basis::flux`]: a side-supported trace family (the normal-flux space of a
//!   DPG formulation), one discontinuous Lagrange set per cell side, classified
//!   H(div) so that side restriction keeps exactly the side's own dofs.
//!
//! Every basis gets a process-wide stable [`BasisId`] at construction; caches key
//! on these handles rather than on addresses.

use crate::quadrature::{gauss, gauss_lobatto_points};
use crate::topology::CellTopology;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type BasisRc = Arc<Basis>;

/// Stable identity handle for a constructed basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BasisId(u64);

static NEXT_BASIS_ID: AtomicU64 = AtomicU64::new(0);

fn fresh_basis_id() -> BasisId {
    BasisId(NEXT_BASIS_ID.fetch_add(1, Ordering::Relaxed))
}

/// The function-space classification of a basis. This is a closed set; the
/// minimum continuity dimension below is a fixed table, not a free choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionSpace {
    HGrad,
    HCurl,
    HDiv,
    HVol,
}

impl FunctionSpace {
    /// The smallest subcell dimension that carries inter-element continuity for
    /// this space: vertices for H1-conforming scalars, edges for H(curl), sides
    /// for H(div), and the full cell (no continuity) for discontinuous spaces.
    pub fn minimum_continuity_dimension(&self, space_dim: usize) -> usize {
        match self {
            FunctionSpace::HGrad => 0,
            FunctionSpace::HCurl => 1,
            FunctionSpace::HDiv => space_dim - 1,
            FunctionSpace::HVol => space_dim,
        }
    }
}

/// Values of every basis function at a set of reference points, shaped
/// `(fields, points[, components])`. Scalar bases have a single component.
#[derive(Debug, Clone)]
pub struct BasisValues {
    fields: usize,
    num_points: usize,
    components: usize,
    data: Vec<f64>,
}

impl BasisValues {
    fn zeros(fields: usize, num_points: usize, components: usize) -> Self {
        BasisValues { fields, num_points, components, data: vec![0.0; fields * num_points * components] }
    }

    pub fn fields(&self) -> usize {
        self.fields
    }

    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn components(&self) -> usize {
        self.components
    }

    pub fn value(&self, field: usize, point: usize, component: usize) -> f64 {
        self.data[(field * self.num_points + point) * self.components + component]
    }

    fn set(&mut self, field: usize, point: usize, component: usize, value: f64) {
        self.data[(field * self.num_points + point) * self.components + component] = value;
    }
}

#[derive(Debug)]
enum BasisKind {
    /// Tensor-product Lagrange basis; `nodes_1d` holds the per-axis support
    /// points, the first axis varying fastest in the dof ordering.
    Nodal { nodes_1d: Vec<f64> },
    /// Vector-valued wrapper, component-major over the scalar dofs.
    Vector { component: BasisRc, components: usize },
    /// Per-side discontinuous Lagrange trace family; dofs are grouped side by
    /// side, each side carrying a copy of `side_basis` in the side's own frame.
    SideTrace { side_basis: BasisRc },
}

/// A finite element basis on a reference cell.
#[derive(Debug)]
pub struct Basis {
    id: BasisId,
    topology: CellTopology,
    degree: usize,
    function_space: FunctionSpace,
    kind: BasisKind,
    /// Per scalar dof: the reference subcell (dim, ordinal) it is associated
    /// with.
    dof_subcells: Vec<(usize, usize)>,
    /// Per scalar dof: its support point in the reference cell.
    node_points: DMatrix<f64>,
}

impl Basis {
    /// H1-conforming nodal basis of the given degree on Gauss-Lobatto points.
    pub fn h_grad(topology: CellTopology, degree: usize) -> BasisRc {
        let d = topology.dimension();
        assert!(d == 0 || degree >= 1, "an H^1 basis needs degree >= 1");
        let nodes_1d = if d == 0 { Vec::new() } else { gauss_lobatto_points(degree + 1) };
        Self::nodal(topology, degree, FunctionSpace::HGrad, nodes_1d)
    }

    /// Discontinuous ("volume") nodal basis of the given degree on interior
    /// Gauss points.
    pub fn h_vol(topology: CellTopology, degree: usize) -> BasisRc {
        let d = topology.dimension();
        let nodes_1d = if d == 0 { Vec::new() } else { gauss(degree + 1).1 };
        Self::nodal(topology, degree, FunctionSpace::HVol, nodes_1d)
    }

    fn nodal(
        topology: CellTopology,
        degree: usize,
        function_space: FunctionSpace,
        nodes_1d: Vec<f64>,
    ) -> BasisRc {
        assert_eq!(
            topology.tensorial_degree(),
            0,
            "nodal bases are defined on base shapes, not {:?}",
            topology
        );
        assert!(
            topology.is_hypercube(),
            "nodal bases are tensor-product; {:?} is not a hypercube",
            topology
        );
        let d = topology.dimension();
        let per_axis = nodes_1d.len().max(1);
        let cardinality = per_axis.pow(d as u32);
        let mut node_points = DMatrix::zeros(cardinality, d);
        for dof in 0..cardinality {
            let mut rem = dof;
            for axis in 0..d {
                node_points[(dof, axis)] = nodes_1d[rem % per_axis];
                rem /= per_axis;
            }
        }
        let dof_subcells = match function_space {
            FunctionSpace::HGrad => {
                (0..cardinality).map(|dof| classify_point(topology, &node_points, dof)).collect()
            }
            FunctionSpace::HVol => vec![(d, 0); cardinality],
            other => panic!("no nodal construction for {:?}", other),
        };
        Arc::new(Basis {
            id: fresh_basis_id(),
            topology,
            degree,
            function_space,
            kind: BasisKind::Nodal { nodes_1d },
            dof_subcells,
            node_points,
        })
    }

    /// Vector-valued (rank-one) basis over a scalar component basis.
    pub fn vectorized(component: &BasisRc, components: usize) -> BasisRc {
        assert!(component.range_rank() == 0, "only scalar bases can be vectorized");
        assert!(components >= 1);
        let card = component.cardinality();
        let mut dof_subcells = Vec::with_capacity(card * components);
        for _ in 0..components {
            dof_subcells.extend_from_slice(&component.dof_subcells);
        }
        let mut node_points = DMatrix::zeros(card * components, component.node_points.ncols());
        for c in 0..components {
            for dof in 0..card {
                node_points.row_mut(c * card + dof).copy_from(&component.node_points.row(dof));
            }
        }
        Arc::new(Basis {
            id: fresh_basis_id(),
            topology: component.topology,
            degree: component.degree,
            function_space: component.function_space,
            kind: BasisKind::Vector { component: component.clone(), components },
            dof_subcells,
            node_points,
        })
    }

    /// Side-supported normal-flux trace basis: one discontinuous Lagrange set
    /// per side of the cell, in the side's own reference frame. Classified
    /// H(div), so restricting to a side at the H(div) minimum continuity
    /// dimension yields exactly that side's dofs.
    pub fn flux(topology: CellTopology, degree: usize) -> BasisRc {
        let d = topology.dimension();
        assert!(d >= 1, "a point has no sides to carry fluxes");
        let side_topology = topology.side_topology(0);
        let side_basis = Basis::h_vol(side_topology, degree);
        let per_side = side_basis.cardinality();
        let num_sides = topology.side_count();
        let mut dof_subcells = Vec::with_capacity(num_sides * per_side);
        let mut node_points = DMatrix::zeros(num_sides * per_side, d);
        for side in 0..num_sides {
            assert_eq!(
                topology.side_topology(side),
                side_topology,
                "flux bases require all sides of {:?} to share a topology",
                topology
            );
            let embedding =
                crate::geometry::CellGeometry::new(side_topology, topology.side_reference_nodes(side));
            let mapped = embedding.map_points(&side_basis.node_points);
            for i in 0..per_side {
                dof_subcells.push((d - 1, side));
                node_points.row_mut(side * per_side + i).copy_from(&mapped.row(i));
            }
        }
        Arc::new(Basis {
            id: fresh_basis_id(),
            topology,
            degree,
            function_space: FunctionSpace::HDiv,
            kind: BasisKind::SideTrace { side_basis },
            dof_subcells,
            node_points,
        })
    }

    pub fn id(&self) -> BasisId {
        self.id
    }

    pub fn cardinality(&self) -> usize {
        self.dof_subcells.len()
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn domain_topology(&self) -> CellTopology {
        self.topology
    }

    pub fn function_space(&self) -> FunctionSpace {
        self.function_space
    }

    /// Rank of the range: 0 for scalar-valued bases, 1 for vector-valued.
    pub fn range_rank(&self) -> usize {
        match self.kind {
            BasisKind::Vector { .. } => 1,
            _ => 0,
        }
    }

    /// Number of range components (1 for scalar bases).
    pub fn range_dimension(&self) -> usize {
        match self.kind {
            BasisKind::Vector { components, .. } => components,
            _ => 1,
        }
    }

    /// The reference subcell each degree of freedom is associated with.
    pub fn dof_subcell(&self, dof: usize) -> (usize, usize) {
        self.dof_subcells[dof]
    }

    /// Reference support points, one row per degree of freedom. The coefficient
    /// of a nodal dof is the (component) value of the represented function at
    /// its support point.
    pub fn node_points(&self) -> &DMatrix<f64> {
        &self.node_points
    }

    /// For a vector-valued dof, the component it contributes to (0 for scalar
    /// bases).
    pub fn dof_component(&self, dof: usize) -> usize {
        match &self.kind {
            BasisKind::Vector { component, .. } => dof / component.cardinality(),
            _ => 0,
        }
    }

    /// The ordered set of dof ordinals associated with subcells of dimension at
    /// least `min_dim` contained in the closure of subcell `(dim, ordinal)`.
    pub fn dof_ordinals_for_subcell(&self, dim: usize, ordinal: usize, min_dim: usize) -> Vec<usize> {
        let topology = self.topology;
        (0..self.cardinality())
            .filter(|&dof| {
                let (sdim, sord) = self.dof_subcells[dof];
                sdim >= min_dim && subcell_in_closure(topology, sdim, sord, dim, ordinal)
            })
            .collect()
    }

    /// Evaluates every basis function at the given reference points (one point
    /// per row). The result is shaped `(cardinality, num_points[, components])`.
    pub fn values(&self, points: &DMatrix<f64>) -> BasisValues {
        assert_eq!(
            points.ncols(),
            self.topology.dimension(),
            "evaluation points must live in the {:?} frame",
            self.topology
        );
        let num_points = points.nrows();
        match &self.kind {
            BasisKind::Nodal { nodes_1d } => {
                let mut values = BasisValues::zeros(self.cardinality(), num_points, 1);
                let d = self.topology.dimension();
                let per_axis = nodes_1d.len().max(1);
                for dof in 0..self.cardinality() {
                    for p in 0..num_points {
                        let mut phi = 1.0;
                        let mut rem = dof;
                        for axis in 0..d {
                            let i = rem % per_axis;
                            rem /= per_axis;
                            phi *= lagrange_1d(nodes_1d, i, points[(p, axis)]);
                        }
                        values.set(dof, p, 0, phi);
                    }
                }
                values
            }
            BasisKind::Vector { component, components } => {
                let scalar = component.values(points);
                let card = component.cardinality();
                let mut values = BasisValues::zeros(card * components, num_points, *components);
                for c in 0..*components {
                    for dof in 0..card {
                        for p in 0..num_points {
                            values.set(c * card + dof, p, c, scalar.value(dof, p, 0));
                        }
                    }
                }
                values
            }
            BasisKind::SideTrace { side_basis } => self.side_trace_values(side_basis, points),
        }
    }

    fn side_trace_values(&self, side_basis: &BasisRc, points: &DMatrix<f64>) -> BasisValues {
        let topology = self.topology;
        let d = topology.dimension();
        let num_points = points.nrows();
        let per_side = side_basis.cardinality();
        let mut values = BasisValues::zeros(self.cardinality(), num_points, 1);
        for p in 0..num_points {
            let point: Vec<f64> = points.row(p).iter().copied().collect();
            let Some(side) = side_containing_point(topology, &point) else {
                // Interior points see no trace function; side reconciliation only
                // ever evaluates at points on a side.
                continue;
            };
            let local = side_local_coordinates(topology, side, &point);
            let side_values = side_basis.values(&local);
            for i in 0..per_side {
                values.set(side * per_side + i, p, 0, side_values.value(i, 0, 0));
            }
        }
        values
    }
}

/// 1D Lagrange cardinal function `i` on the given support points.
fn lagrange_1d(nodes: &[f64], i: usize, x: f64) -> f64 {
    let xi = nodes[i];
    nodes
        .iter()
        .enumerate()
        .filter(|&(j, _)| j != i)
        .map(|(_, &xj)| (x - xj) / (xi - xj))
        .product()
}

/// The lowest-dimensional subcell of a hypercube reference cell whose closure
/// contains the given node point.
fn classify_point(topology: CellTopology, points: &DMatrix<f64>, row: usize) -> (usize, usize) {
    let d = topology.dimension();
    for dim in 0..=d {
        for ordinal in 0..topology.subcell_count(dim) {
            let fixed = topology.subcell_fixed_axes(dim, ordinal);
            if fixed.iter().all(|&(axis, value)| (points[(row, axis)] - value).abs() < 1e-12) {
                return (dim, ordinal);
            }
        }
    }
    unreachable!("point lies outside the reference cell")
}

/// Whether subcell `(sdim, sord)` lies in the closure of subcell `(dim, ordinal)`.
fn subcell_in_closure(
    topology: CellTopology,
    sdim: usize,
    sord: usize,
    dim: usize,
    ordinal: usize,
) -> bool {
    if sdim > dim {
        return false;
    }
    let inner = topology.subcell_nodes(sdim, sord);
    let outer = topology.subcell_nodes(dim, ordinal);
    inner.iter().all(|n| outer.contains(n))
}

/// The side of the reference cell the point lies on, if any.
fn side_containing_point(topology: CellTopology, point: &[f64]) -> Option<usize> {
    let d = topology.dimension();
    (0..topology.side_count()).find(|&side| {
        topology
            .subcell_fixed_axes(d - 1, side)
            .iter()
            .all(|&(axis, value)| (point[axis] - value).abs() < 1e-9)
    })
}

/// Side-local coordinates (one row) of a volume reference point known to lie on
/// the given side, inverting the affine side embedding.
fn side_local_coordinates(topology: CellTopology, side: usize, point: &[f64]) -> DMatrix<f64> {
    let side_nodes = topology.side_reference_nodes(side);
    let side_topology = topology.side_topology(side);
    let side_dim = side_topology.dimension();
    let d = topology.dimension();
    let n = side_nodes.nrows();
    let mut center = vec![0.0; d];
    for i in 0..n {
        for k in 0..d {
            center[k] += side_nodes[(i, k)] / n as f64;
        }
    }
    let mut local = DMatrix::zeros(1, side_dim);
    for axis in 0..side_dim {
        // the side node whose side-local coordinate is +1 along this axis alone
        let hi = match (side_dim, axis) {
            (1, 0) => 1,
            (2, 0) => 1,
            (2, 1) => 3,
            _ => unreachable!(),
        };
        let mut dir = vec![0.0; d];
        let mut norm2 = 0.0;
        for k in 0..d {
            dir[k] = (side_nodes[(hi, k)] - side_nodes[(0, k)]) / 2.0;
            norm2 += dir[k] * dir[k];
        }
        let mut t = 0.0;
        for k in 0..d {
            t += (point[k] - center[k]) * dir[k];
        }
        local[(0, axis)] = t / norm2;
    }
    local
}
