use nalgebra::DMatrix;
use petrov::topology::{CellShape, CellTopology};
use rustc_hash::FxHashMap;

fn check_dimension(topology: CellTopology) {
    assert_eq!(
        topology.dimension(),
        topology.shape().dimension() + topology.tensorial_degree(),
        "{:?}",
        topology
    );
}

fn expected_permutation_count(topology: CellTopology) -> usize {
    if topology.is_hypercube() {
        (1..=topology.dimension()).map(|d| 2 * d).product::<usize>().max(1)
    } else {
        let base = 6; // dihedral group of the triangle
        match topology.tensorial_degree() {
            0 => base,
            1 => base * 2,
            _ => unreachable!("unsupported tensorial degree"),
        }
    }
}

/// All permutations must be distinct bijections, and the declared inverse must
/// actually invert.
fn check_permutations(topology: CellTopology) {
    let count = topology.node_permutation_count();
    assert_eq!(count, expected_permutation_count(topology), "{:?}", topology);
    let node_count = topology.node_count();
    let mut seen: FxHashMap<Vec<usize>, usize> = FxHashMap::default();
    for permutation in 0..count {
        let mut image = Vec::with_capacity(node_count);
        for node in 0..node_count {
            let permuted = topology.node_permutation(permutation, node);
            assert_eq!(
                topology.node_permutation_inverse(permutation, permuted),
                node,
                "inverse of permutation {} of {:?} fails at node {}",
                permutation,
                topology,
                node
            );
            image.push(permuted);
        }
        let mut sorted = image.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), node_count, "permutation {} of {:?} has duplicates", permutation, topology);
        if let Some(&previous) = seen.get(&image) {
            panic!(
                "permutation {} of {:?} repeats the node ordering of permutation {}",
                permutation, topology, previous
            );
        }
        seen.insert(image, permutation);
    }
}

fn base_shapes() -> Vec<CellShape> {
    vec![CellShape::Node, CellShape::Line, CellShape::Quad, CellShape::Triangle, CellShape::Hexahedron]
}

#[test]
fn base_shape_permutations() {
    for shape in base_shapes() {
        check_permutations(CellTopology::new(shape, 0));
    }
}

#[test]
fn one_tensor_extension_permutations() {
    for shape in base_shapes() {
        let topology = CellTopology::new(shape, 1);
        check_dimension(topology);
        check_permutations(topology);
    }
}

#[test]
fn multi_tensor_hypercube_permutations() {
    // hypercube extensions up to four dimensions total
    let max_dimension = 4;
    for shape in [CellShape::Node, CellShape::Line, CellShape::Quad, CellShape::Hexahedron] {
        for degree in 0..=(max_dimension - shape.dimension()) {
            let topology = CellTopology::new(shape, degree);
            check_dimension(topology);
            check_permutations(topology);
        }
    }
}

#[test]
fn permutation_counts_follow_the_hypercube_symmetry_group() {
    assert_eq!(CellTopology::line().node_permutation_count(), 2);
    assert_eq!(CellTopology::quad().node_permutation_count(), 8);
    assert_eq!(CellTopology::hexahedron().node_permutation_count(), 48);
    assert_eq!(CellTopology::new(CellShape::Hexahedron, 1).node_permutation_count(), 384);
    assert_eq!(CellTopology::triangle().node_permutation_count(), 6);
    assert_eq!(CellTopology::new(CellShape::Triangle, 1).node_permutation_count(), 12);
}

#[test]
fn initialize_nodes_line() {
    let line_x = DMatrix::from_row_slice(2, 1, &[0.0, 1.0]);
    let topology = CellTopology::new(CellShape::Line, 0);
    let nodes = topology.initialize_nodes(&[line_x.clone()]);
    assert_eq!(nodes, line_x);
}

#[test]
fn initialize_nodes_quad_from_tensor_lines() {
    let line_x = DMatrix::from_row_slice(2, 1, &[0.0, 1.0]);
    let line_y = DMatrix::from_row_slice(2, 1, &[2.0, 4.0]);
    let topology = CellTopology::new(CellShape::Line, 1);
    let nodes = topology.initialize_nodes(&[line_x, line_y]);
    // all x-nodes paired with y0, then with y1
    let expected =
        DMatrix::from_row_slice(4, 2, &[0.0, 2.0, 1.0, 2.0, 0.0, 4.0, 1.0, 4.0]);
    assert_eq!(nodes, expected);
}

#[test]
fn initialize_nodes_hexahedron_from_tensor_lines() {
    let line_x = DMatrix::from_row_slice(2, 1, &[0.0, 1.0]);
    let line_y = DMatrix::from_row_slice(2, 1, &[2.0, 4.0]);
    let line_z = DMatrix::from_row_slice(2, 1, &[-3.0, 3.0]);
    let topology = CellTopology::new(CellShape::Line, 2);
    let nodes = topology.initialize_nodes(&[line_x, line_y, line_z]);
    let expected = DMatrix::from_row_slice(
        8,
        3,
        &[
            0.0, 2.0, -3.0, //
            1.0, 2.0, -3.0, //
            0.0, 4.0, -3.0, //
            1.0, 4.0, -3.0, //
            0.0, 2.0, 3.0, //
            1.0, 2.0, 3.0, //
            0.0, 4.0, 3.0, //
            1.0, 4.0, 3.0,
        ],
    );
    assert_eq!(nodes, expected);
}

#[test]
fn permuted_reference_nodes_realize_the_permutation() {
    let quad = CellTopology::quad();
    for permutation in 0..quad.node_permutation_count() {
        let permuted = quad.permuted_reference_nodes(permutation);
        for node in 0..quad.node_count() {
            let image = quad.node_permutation(permutation, node);
            let coords = quad.node_coordinates(image);
            assert_eq!(permuted[(node, 0)], coords[0]);
            assert_eq!(permuted[(node, 1)], coords[1]);
        }
    }
}
