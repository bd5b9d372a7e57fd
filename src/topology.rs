//! The cell topology oracle.
//!
//! A [`CellTopology`] is a base [`CellShape`] optionally extended by a number of
//! tensorial (interval) factors, as used for space-time elements. The oracle
//! answers the combinatorial queries the rest of the crate builds on: node counts,
//! sub-entity (vertex/edge/face/side) adjacency, canonical reference-node
//! coordinates, and the enumeration of node permutations realizing the symmetries
//! of the topology.
//!
//! Hypercube topologies (point, line, quad, hexahedron, and any tensorial
//! extension of them) enumerate the full symmetry group of the d-cube as signed
//! axis permutations, so the permutation count is `2^d * d!` (2, 8, 48, 384 for
//! dimensions 1 through 4). The triangle carries its six dihedral symmetries from
//! a fixed table, doubled under a single tensorial extension.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// The base shape of a reference cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellShape {
    Node,
    Line,
    Triangle,
    Quad,
    Hexahedron,
}

/// Reference vertices of the quadrilateral, counterclockwise:
///
/// ```text
/// 3_________2
/// |         |
/// |         |
/// 0_________1
/// ```
const QUAD_VERTICES: [[f64; 2]; 4] = [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]];

const HEX_VERTICES: [[f64; 3]; 8] = [
    [-1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0],
    [1.0, 1.0, -1.0],
    [-1.0, 1.0, -1.0],
    [-1.0, -1.0, 1.0],
    [1.0, -1.0, 1.0],
    [1.0, 1.0, 1.0],
    [-1.0, 1.0, 1.0],
];

const TRIANGLE_VERTICES: [[f64; 2]; 3] = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];

const QUAD_EDGES: [[usize; 2]; 4] = [[0, 1], [1, 2], [2, 3], [3, 0]];
const TRIANGLE_EDGES: [[usize; 2]; 3] = [[0, 1], [1, 2], [2, 0]];
const HEX_EDGES: [[usize; 2]; 12] = [
    [0, 1],
    [1, 2],
    [2, 3],
    [3, 0],
    [4, 5],
    [5, 6],
    [6, 7],
    [7, 4],
    [0, 4],
    [1, 5],
    [2, 6],
    [3, 7],
];
const HEX_FACES: [[usize; 4]; 6] = [
    [0, 1, 5, 4],
    [1, 2, 6, 5],
    [2, 3, 7, 6],
    [0, 4, 7, 3],
    [0, 3, 2, 1],
    [4, 5, 6, 7],
];

/// Dihedral symmetries of the triangle, as vertex reorderings. Index 0 is the
/// identity, indices 1-2 are rotations, indices 3-5 reflections.
const TRIANGLE_PERMUTATIONS: [[usize; 3]; 6] =
    [[0, 1, 2], [1, 2, 0], [2, 0, 1], [0, 2, 1], [2, 1, 0], [1, 0, 2]];

impl CellShape {
    pub fn dimension(&self) -> usize {
        match self {
            CellShape::Node => 0,
            CellShape::Line => 1,
            CellShape::Triangle | CellShape::Quad => 2,
            CellShape::Hexahedron => 3,
        }
    }

    pub fn node_count(&self) -> usize {
        match self {
            CellShape::Node => 1,
            CellShape::Line => 2,
            CellShape::Triangle => 3,
            CellShape::Quad => 4,
            CellShape::Hexahedron => 8,
        }
    }

    /// Whether the shape is a hypercube (node/line/quad/hexahedron). Hypercubes
    /// admit the signed-axis-permutation symmetry enumeration and arbitrary
    /// tensorial extension.
    pub fn is_hypercube(&self) -> bool {
        !matches!(self, CellShape::Triangle)
    }

    /// Reference coordinates of a vertex.
    pub fn vertex(&self, node: usize) -> Vec<f64> {
        assert!(node < self.node_count(), "vertex {} out of range for {:?}", node, self);
        match self {
            CellShape::Node => vec![],
            CellShape::Line => vec![if node == 0 { -1.0 } else { 1.0 }],
            CellShape::Triangle => TRIANGLE_VERTICES[node].to_vec(),
            CellShape::Quad => QUAD_VERTICES[node].to_vec(),
            CellShape::Hexahedron => HEX_VERTICES[node].to_vec(),
        }
    }

    /// Number of subcells of the given dimension. The cell itself counts as its
    /// own (and only) subcell of full dimension.
    pub fn subcell_count(&self, dim: usize) -> usize {
        let d = self.dimension();
        assert!(dim <= d, "subcell dimension {} exceeds cell dimension {}", dim, d);
        if dim == d {
            return 1;
        }
        match (self, dim) {
            (_, 0) => self.node_count(),
            (CellShape::Triangle, 1) => 3,
            (CellShape::Quad, 1) => 4,
            (CellShape::Hexahedron, 1) => 12,
            (CellShape::Hexahedron, 2) => 6,
            _ => unreachable!(),
        }
    }

    /// Vertex ordinals of the subcell `(dim, ordinal)`.
    pub fn subcell_nodes(&self, dim: usize, ordinal: usize) -> Vec<usize> {
        let d = self.dimension();
        assert!(
            ordinal < self.subcell_count(dim),
            "subcell ({}, {}) out of range for {:?}",
            dim,
            ordinal,
            self
        );
        if dim == d {
            return (0..self.node_count()).collect();
        }
        match (self, dim) {
            (_, 0) => vec![ordinal],
            (CellShape::Triangle, 1) => TRIANGLE_EDGES[ordinal].to_vec(),
            (CellShape::Quad, 1) => QUAD_EDGES[ordinal].to_vec(),
            (CellShape::Hexahedron, 1) => HEX_EDGES[ordinal].to_vec(),
            (CellShape::Hexahedron, 2) => HEX_FACES[ordinal].to_vec(),
            _ => unreachable!(),
        }
    }

    /// The shape of the subcell `(dim, ordinal)`.
    pub fn subcell_shape(&self, dim: usize, ordinal: usize) -> CellShape {
        let nodes = self.subcell_nodes(dim, ordinal).len();
        match (dim, nodes) {
            (0, _) => CellShape::Node,
            (1, _) => CellShape::Line,
            (2, 3) => CellShape::Triangle,
            (2, 4) => CellShape::Quad,
            (3, 8) => CellShape::Hexahedron,
            _ => unreachable!(),
        }
    }
}

/// A cell topology: a base shape extended by `tensorial_degree` interval factors.
///
/// Nodes of the extended topology are ordered component-major: all base nodes
/// paired with the first combination of tensorial endpoints, then the next
/// combination, and so on, with the first tensorial factor varying fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellTopology {
    shape: CellShape,
    tensorial_degree: usize,
}

impl CellTopology {
    pub fn new(shape: CellShape, tensorial_degree: usize) -> Self {
        CellTopology { shape, tensorial_degree }
    }

    pub fn node() -> Self {
        Self::new(CellShape::Node, 0)
    }

    pub fn line() -> Self {
        Self::new(CellShape::Line, 0)
    }

    pub fn triangle() -> Self {
        Self::new(CellShape::Triangle, 0)
    }

    pub fn quad() -> Self {
        Self::new(CellShape::Quad, 0)
    }

    pub fn hexahedron() -> Self {
        Self::new(CellShape::Hexahedron, 0)
    }

    pub fn shape(&self) -> CellShape {
        self.shape
    }

    pub fn tensorial_degree(&self) -> usize {
        self.tensorial_degree
    }

    pub fn dimension(&self) -> usize {
        self.shape.dimension() + self.tensorial_degree
    }

    pub fn node_count(&self) -> usize {
        self.shape.node_count() << self.tensorial_degree
    }

    pub fn is_hypercube(&self) -> bool {
        self.shape.is_hypercube()
    }

    /// The identity used for topology-compatibility preconditions: two bases can
    /// be reconciled against each other only when their domains share a base key.
    pub fn base_key(&self) -> CellTopology {
        *self
    }

    /// Reference coordinates of a node of the (possibly extended) topology.
    pub fn node_coordinates(&self, node: usize) -> Vec<f64> {
        assert!(node < self.node_count(), "node {} out of range for {:?}", node, self);
        let base_count = self.shape.node_count();
        let mut coords = self.shape.vertex(node % base_count);
        let mut tensor_bits = node / base_count;
        for _ in 0..self.tensorial_degree {
            coords.push(if tensor_bits & 1 == 0 { -1.0 } else { 1.0 });
            tensor_bits >>= 1;
        }
        coords
    }

    /// Canonical reference-node coordinates, one row per node.
    pub fn reference_nodes(&self) -> DMatrix<f64> {
        let n = self.node_count();
        let d = self.dimension();
        let mut nodes = DMatrix::zeros(n, d);
        for i in 0..n {
            let coords = self.node_coordinates(i);
            for k in 0..d {
                nodes[(i, k)] = coords[k];
            }
        }
        nodes
    }

    /// Reference-node coordinates under the given node permutation: row `i` holds
    /// the coordinates of node `permutation(i)`.
    pub fn permuted_reference_nodes(&self, permutation: usize) -> DMatrix<f64> {
        let reference = self.reference_nodes();
        let n = self.node_count();
        let mut nodes = DMatrix::zeros(n, self.dimension());
        for i in 0..n {
            nodes.row_mut(i).copy_from(&reference.row(self.node_permutation(permutation, i)));
        }
        nodes
    }

    /// Compose per-factor node arrays into the extended topology's node array,
    /// component-major. `components[0]` must carry the base shape's nodes; each
    /// subsequent entry is the two-node array of one tensorial factor.
    pub fn initialize_nodes(&self, components: &[DMatrix<f64>]) -> DMatrix<f64> {
        assert_eq!(
            components.len(),
            1 + self.tensorial_degree,
            "expected one component per tensorial factor plus the base shape"
        );
        assert_eq!(components[0].nrows(), self.shape.node_count());
        assert_eq!(components[0].ncols(), self.shape.dimension());
        for c in &components[1..] {
            assert_eq!((c.nrows(), c.ncols()), (2, 1), "tensorial factors are two-node intervals");
        }
        let n = self.node_count();
        let d: usize = components.iter().map(|c| c.ncols()).sum();
        let base_count = self.shape.node_count();
        let mut nodes = DMatrix::zeros(n, d);
        for node in 0..n {
            let mut col = 0;
            let mut remainder = node;
            for c in components {
                let local = remainder % c.nrows();
                remainder /= c.nrows();
                for k in 0..c.ncols() {
                    nodes[(node, col + k)] = c[(local, k)];
                }
                col += c.ncols();
            }
            debug_assert!(remainder == 0 || base_count == 0);
        }
        nodes
    }

    /// Number of enumerated node permutations.
    pub fn node_permutation_count(&self) -> usize {
        if self.is_hypercube() {
            let d = self.dimension();
            (1..=d).map(|k| 2 * k).product::<usize>().max(1)
        } else {
            match self.tensorial_degree {
                0 => TRIANGLE_PERMUTATIONS.len(),
                1 => TRIANGLE_PERMUTATIONS.len() * 2,
                _ => panic!(
                    "node permutations unsupported for {:?} with tensorial degree {}",
                    self.shape, self.tensorial_degree
                ),
            }
        }
    }

    /// The image of `node` under permutation number `permutation`. Permutation 0
    /// is always the identity.
    pub fn node_permutation(&self, permutation: usize, node: usize) -> usize {
        assert!(
            permutation < self.node_permutation_count(),
            "permutation {} out of range for {:?} (count {})",
            permutation,
            self,
            self.node_permutation_count()
        );
        assert!(node < self.node_count());
        if self.is_hypercube() {
            self.hypercube_permutation(permutation, node)
        } else {
            match self.tensorial_degree {
                0 => TRIANGLE_PERMUTATIONS[permutation][node],
                1 => {
                    let base_count = self.shape.node_count();
                    let base_perm = permutation / 2;
                    let flip = permutation % 2 == 1;
                    let base = TRIANGLE_PERMUTATIONS[base_perm][node % base_count];
                    let t = node / base_count;
                    let t = if flip { 1 - t } else { t };
                    base + base_count * t
                }
                _ => unreachable!(),
            }
        }
    }

    /// The image of `node` under the inverse of permutation number `permutation`,
    /// so that `node_permutation_inverse(p, node_permutation(p, n)) == n`.
    pub fn node_permutation_inverse(&self, permutation: usize, node: usize) -> usize {
        let n = self.node_count();
        for pre in 0..n {
            if self.node_permutation(permutation, pre) == node {
                return pre;
            }
        }
        unreachable!("permutation {} of {:?} is not a bijection", permutation, self)
    }

    fn hypercube_permutation(&self, permutation: usize, node: usize) -> usize {
        let d = self.dimension();
        if d == 0 {
            return node;
        }
        let sign_mask = permutation % (1 << d);
        let axis_perm = nth_permutation(d, permutation >> d);
        let coords = self.node_coordinates(node);
        let mut image = vec![0.0; d];
        for k in 0..d {
            let sign = if sign_mask >> k & 1 == 0 { 1.0 } else { -1.0 };
            image[k] = sign * coords[axis_perm[k]];
        }
        self.node_with_coordinates(&image)
    }

    fn node_with_coordinates(&self, coords: &[f64]) -> usize {
        let n = self.node_count();
        'nodes: for node in 0..n {
            let candidate = self.node_coordinates(node);
            for (a, b) in candidate.iter().zip(coords) {
                if (a - b).abs() > 1e-12 {
                    continue 'nodes;
                }
            }
            return node;
        }
        unreachable!("no node of {:?} at coordinates {:?}", self, coords)
    }

    /// Number of subcells of the given dimension. Tensorial extensions answer
    /// only node-level and whole-cell queries.
    pub fn subcell_count(&self, dim: usize) -> usize {
        if self.tensorial_degree == 0 {
            self.shape.subcell_count(dim)
        } else if dim == 0 {
            self.node_count()
        } else if dim == self.dimension() {
            1
        } else {
            panic!("subcell queries unsupported for tensorial topology {:?}", self)
        }
    }

    /// Vertex ordinals of subcell `(dim, ordinal)`.
    pub fn subcell_nodes(&self, dim: usize, ordinal: usize) -> Vec<usize> {
        assert_eq!(
            self.tensorial_degree, 0,
            "subcell adjacency unsupported for tensorial topology {:?}",
            self
        );
        self.shape.subcell_nodes(dim, ordinal)
    }

    /// Number of sides (subcells of codimension one).
    pub fn side_count(&self) -> usize {
        let d = self.dimension();
        assert!(d > 0, "a point has no sides");
        self.subcell_count(d - 1)
    }

    /// The topology of the given side.
    pub fn side_topology(&self, side: usize) -> CellTopology {
        assert_eq!(self.tensorial_degree, 0, "side queries unsupported for tensorial topology");
        let d = self.dimension();
        CellTopology::new(self.shape.subcell_shape(d - 1, side), 0)
    }

    /// Maps a side-local node ordinal to the cell-level node ordinal.
    pub fn side_node(&self, side: usize, local_node: usize) -> usize {
        let d = self.dimension();
        self.subcell_nodes(d - 1, side)[local_node]
    }

    /// Reference coordinates of the side's nodes in the cell's frame, one row per
    /// side node: the geometry through which side-local points embed into the cell.
    pub fn side_reference_nodes(&self, side: usize) -> DMatrix<f64> {
        let d = self.dimension();
        let side_nodes = self.subcell_nodes(d - 1, side);
        let reference = self.reference_nodes();
        let mut nodes = DMatrix::zeros(side_nodes.len(), d);
        for (i, &node) in side_nodes.iter().enumerate() {
            nodes.row_mut(i).copy_from(&reference.row(node));
        }
        nodes
    }

    /// The axes (and values) fixed on subcell `(dim, ordinal)` of a hypercube
    /// reference cell; free axes vary over the subcell. Used to classify which
    /// subcell a reference point lies on.
    pub fn subcell_fixed_axes(&self, dim: usize, ordinal: usize) -> Vec<(usize, f64)> {
        assert!(self.is_hypercube(), "fixed-axes queries are hypercube-only");
        let nodes = self.subcell_nodes(dim, ordinal);
        let d = self.dimension();
        let mut fixed = Vec::new();
        for axis in 0..d {
            let v0 = self.node_coordinates(nodes[0])[axis];
            if nodes.iter().all(|&n| (self.node_coordinates(n)[axis] - v0).abs() < 1e-12) {
                fixed.push((axis, v0));
            }
        }
        fixed
    }
}

/// The `k`-th permutation of `0..d` in lexicographic order (factorial number
/// system).
fn nth_permutation(d: usize, mut k: usize) -> Vec<usize> {
    let mut remaining: Vec<usize> = (0..d).collect();
    let mut factorials = vec![1usize; d];
    for i in 1..d {
        factorials[i] = factorials[i - 1] * i;
    }
    let mut perm = Vec::with_capacity(d);
    for i in (0..d).rev() {
        let idx = k / factorials[i];
        k %= factorials[i];
        perm.push(remaining.remove(idx));
    }
    perm
}
