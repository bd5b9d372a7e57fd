//! The reference geometry mapper.
//!
//! A [`CellGeometry`] pairs a topology with one coordinate per topology node and
//! maps reference points through the induced multilinear (vertex-Lagrange)
//! element map: affine on lines and triangles, bilinear on quads, trilinear on
//! hexahedra. Reconciliation uses these maps with *reference* coordinates as the
//! "physical" node placement, e.g. to push cubature points from a refined child
//! cell out into its ancestor's reference frame.

use crate::topology::{CellShape, CellTopology};
use itertools::izip;
use nalgebra::DMatrix;

/// A topology with a concrete placement for each of its nodes.
#[derive(Debug, Clone)]
pub struct CellGeometry {
    topology: CellTopology,
    /// One row per topology node; the column count is the embedding dimension,
    /// which may differ from the topology's own dimension (e.g. a line side of a
    /// quad placed in the quad's two-dimensional reference frame).
    nodes: DMatrix<f64>,
}

impl CellGeometry {
    pub fn new(topology: CellTopology, nodes: DMatrix<f64>) -> Self {
        assert_eq!(
            nodes.nrows(),
            topology.node_count(),
            "node placement must cover every node of {:?}",
            topology
        );
        CellGeometry { topology, nodes }
    }

    /// The identity placement: every node at its canonical reference position.
    pub fn reference(topology: CellTopology) -> Self {
        Self::new(topology, topology.reference_nodes())
    }

    /// The reference placement permuted by the given node permutation.
    pub fn permuted_reference(topology: CellTopology, permutation: usize) -> Self {
        Self::new(topology, topology.permuted_reference_nodes(permutation))
    }

    /// Maps reference points (one per row) through the multilinear element map
    /// defined by the node placement.
    pub fn map_points(&self, reference_points: &DMatrix<f64>) -> DMatrix<f64> {
        assert_eq!(
            reference_points.ncols(),
            self.topology.dimension(),
            "reference points must live in the {:?} frame",
            self.topology
        );
        let num_points = reference_points.nrows();
        let embed_dim = self.nodes.ncols();
        let mut mapped = DMatrix::zeros(num_points, embed_dim);
        for p in 0..num_points {
            let point: Vec<f64> = reference_points.row(p).iter().copied().collect();
            let shape_values = vertex_shape_values(self.topology, &point);
            for (phi, node) in izip!(&shape_values, self.nodes.row_iter()) {
                for k in 0..embed_dim {
                    mapped[(p, k)] += phi * node[k];
                }
            }
        }
        mapped
    }
}

/// Values of the vertex (degree-one Lagrange) shape functions at a reference
/// point, one entry per topology node.
fn vertex_shape_values(topology: CellTopology, point: &[f64]) -> Vec<f64> {
    assert_eq!(
        topology.tensorial_degree(),
        0,
        "geometry maps are defined on base shapes, not {:?}",
        topology
    );
    match topology.shape() {
        CellShape::Node => vec![1.0],
        CellShape::Triangle => {
            let (x, y) = (point[0], point[1]);
            vec![1.0 - x - y, x, y]
        }
        // Hypercube shapes: products of 1D hat functions matched to the +/-1
        // vertex coordinates.
        shape => {
            let n = shape.node_count();
            let d = shape.dimension();
            (0..n)
                .map(|node| {
                    let vertex = shape.vertex(node);
                    (0..d).map(|k| (1.0 + point[k] * vertex[k]) / 2.0).product()
                })
                .collect()
        }
    }
}
