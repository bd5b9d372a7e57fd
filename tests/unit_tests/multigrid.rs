use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use petrov::dof::{DofInterpreter, GlobalDofAssignment};
use petrov::mesh::{ElementType, Mesh};
use petrov::multigrid::GmgProlongation;
use petrov::projection::{project_onto_mesh, ExactSolution};
use petrov::reconciliation::BasisReconciliation;
use petrov::topology::CellTopology;
use std::collections::BTreeSet;

/// The identity property: diagonal entries 1, off-diagonal entries 0 (to
/// 1e-14), and exactly one stored nonzero per row.
fn assert_matrix_is_identity(matrix: &CsrMatrix<f64>) {
    assert_eq!(matrix.nrows(), matrix.ncols());
    let tol = 1e-14;
    for row_index in 0..matrix.nrows() {
        let row = matrix.row(row_index);
        let mut diagonal_found = false;
        for (&column, &value) in row.col_indices().iter().zip(row.values()) {
            if column == row_index {
                assert!((value - 1.0).abs() < tol, "diagonal of row {} is {}", row_index, value);
                diagonal_found = true;
            } else {
                assert!(value.abs() < tol, "off-diagonal ({}, {}) is {}", row_index, column, value);
            }
        }
        assert!(diagonal_found, "no diagonal entry in row {}", row_index);
        assert_eq!(row.nnz(), 1, "row {} should hold exactly its diagonal", row_index);
    }
}

fn identity_prolongation(mesh: &Mesh, use_static_condensation: bool) {
    let mut engine = BasisReconciliation::new();
    let dofs = GlobalDofAssignment::new(mesh, &mut engine, use_static_condensation);
    let mut gmg = GmgProlongation::new(mesh, mesh, &dofs, &dofs, use_static_condensation);
    gmg.construct_prolongation_operator(&mut engine).unwrap();
    assert_matrix_is_identity(gmg.prolongation_operator().unwrap());
}

#[test]
fn identity_prolongation_uniform_2d() {
    let element_type = ElementType::poisson(CellTopology::quad(), 1);
    let mesh = Mesh::rectilinear([1.0, 1.0], [2, 2], &element_type);
    identity_prolongation(&mesh, false);
}

#[test]
fn identity_prolongation_uniform_2d_condensed() {
    let element_type = ElementType::poisson(CellTopology::quad(), 1);
    let mesh = Mesh::rectilinear([1.0, 1.0], [2, 2], &element_type);
    identity_prolongation(&mesh, true);
}

#[test]
fn identity_prolongation_uniform_1d() {
    let element_type = ElementType::poisson(CellTopology::line(), 2);
    let mesh = Mesh::interval(0.0, 1.0, 3, &element_type);
    identity_prolongation(&mesh, false);
}

#[test]
fn identity_prolongation_hanging_node_2d() {
    // a 1x2 quad mesh with the bottom element refined once: the hanging
    // interface must not disturb the identity
    let element_type = ElementType::poisson(CellTopology::quad(), 1);
    let mut mesh = Mesh::rectilinear([1.0, 1.0], [1, 2], &element_type);
    mesh.h_refine(&BTreeSet::from([0]));
    identity_prolongation(&mesh, false);
}

#[test]
fn identity_prolongation_hanging_node_2d_higher_order() {
    let element_type = ElementType::poisson(CellTopology::quad(), 2);
    let mut mesh = Mesh::rectilinear([1.0, 1.0], [1, 2], &element_type);
    mesh.h_refine(&BTreeSet::from([0]));
    identity_prolongation(&mesh, false);
}

#[test]
fn identity_prolongation_with_roles_swapped() {
    let element_type = ElementType::poisson(CellTopology::quad(), 1);
    let mesh = Mesh::rectilinear([1.0, 1.0], [2, 2], &element_type);
    let mut engine = BasisReconciliation::new();
    let dofs = GlobalDofAssignment::new(&mesh, &mut engine, false);
    let mut gmg = GmgProlongation::new(&mesh, &mesh, &dofs, &dofs, false);
    gmg.set_fine_coarse_roles_swapped(true);
    gmg.construct_prolongation_operator(&mut engine).unwrap();
    assert_matrix_is_identity(gmg.prolongation_operator().unwrap());
}

/// Projects the exact solution on both meshes, prolongs the coarse global
/// vector, and checks the result against the fine projection, both globally and
/// imported back onto every fine cell.
fn check_prolongation_reproduces_exact_solution(
    coarse_mesh: &Mesh,
    fine_mesh: &Mesh,
    solution: &ExactSolution,
    tol: f64,
) {
    let mut engine = BasisReconciliation::new();
    let coarse_dofs = GlobalDofAssignment::new(coarse_mesh, &mut engine, false);
    let fine_dofs = GlobalDofAssignment::new(fine_mesh, &mut engine, false);

    let coarse = project_onto_mesh(coarse_mesh, solution, &coarse_dofs).unwrap();
    let fine = project_onto_mesh(fine_mesh, solution, &fine_dofs).unwrap();

    let mut gmg = GmgProlongation::new(coarse_mesh, fine_mesh, &coarse_dofs, &fine_dofs, false);
    gmg.construct_prolongation_operator(&mut engine).unwrap();
    let prolonged: DVector<f64> = gmg.apply(&coarse.global);

    let global_difference = (&prolonged - &fine.global).amax();
    assert!(
        global_difference < tol,
        "prolonged coarse solution differs from the fine projection by {}",
        global_difference
    );

    for &cell in fine_mesh.active_cells() {
        let imported = fine_dofs.import_cell_solution(cell, &prolonged);
        let direct = &fine.cell_coefficients[&cell];
        let difference = (&imported - direct).amax();
        assert!(difference < tol, "cell {}: local difference {}", cell, difference);
    }
}

#[test]
fn line_mesh_h_prolongation_is_exact() {
    // one coarse interval, refined once; phi = x^2 is exactly representable at
    // H1 order 3, so the prolonged coarse solution must equal the fine one
    let element_type = ElementType::poisson(CellTopology::line(), 3);
    let coarse_mesh = Mesh::interval(0.0, 1.0, 1, &element_type);
    let mut fine_mesh = coarse_mesh.deep_copy();
    fine_mesh.h_refine(&BTreeSet::from([0]));

    let mut solution = ExactSolution::new();
    solution.set_scalar(0, |x| x[0] * x[0]);
    solution.set_scalar(1, |x| 2.0 * x[0]);
    check_prolongation_reproduces_exact_solution(&coarse_mesh, &fine_mesh, &solution, 1e-12);
}

#[test]
fn line_mesh_h_prolongation_of_a_constant() {
    let element_type = ElementType::poisson(CellTopology::line(), 2);
    let coarse_mesh = Mesh::interval(0.0, 1.0, 1, &element_type);
    let mut fine_mesh = coarse_mesh.deep_copy();
    fine_mesh.h_refine(&BTreeSet::from([0]));

    let mut solution = ExactSolution::new();
    solution.set_scalar(0, |_| 2.0);
    solution.set_scalar(1, |_| 0.0);
    check_prolongation_reproduces_exact_solution(&coarse_mesh, &fine_mesh, &solution, 1e-12);
}

#[test]
fn quad_mesh_p_prolongation_of_a_constant() {
    // 2x2 Poisson mesh at H1 order 1; the fine mesh p-refines one cell. The
    // constant must prolong exactly.
    let element_type = ElementType::poisson(CellTopology::quad(), 1);
    let coarse_mesh = Mesh::rectilinear([1.0, 1.0], [2, 2], &element_type);
    let mut fine_mesh = coarse_mesh.deep_copy();
    fine_mesh.p_refine(&BTreeSet::from([0]));

    let mut solution = ExactSolution::new();
    solution.set_scalar(0, |_| 3.14159);
    solution.set_vector(1, |_| vec![0.0, 0.0]);
    check_prolongation_reproduces_exact_solution(&coarse_mesh, &fine_mesh, &solution, 1e-12);
}

#[test]
fn quad_mesh_p_prolongation_of_a_polynomial() {
    let element_type = ElementType::poisson(CellTopology::quad(), 3);
    let coarse_mesh = Mesh::rectilinear([1.0, 1.0], [2, 2], &element_type);
    let mut fine_mesh = coarse_mesh.deep_copy();
    fine_mesh.p_refine(&BTreeSet::from([1]));

    let mut solution = ExactSolution::new();
    solution.set_scalar(0, |x| x[0] * x[0] + x[1]);
    solution.set_vector(1, |x| vec![2.0 * x[0], 1.0]);
    check_prolongation_reproduces_exact_solution(&coarse_mesh, &fine_mesh, &solution, 1e-12);
}

#[test]
fn quad_mesh_h_prolongation_of_a_constant() {
    // one coarse quad refined uniformly once: two of each child's sides match
    // ancestral sides, the other two are interior and prolong through the
    // traced field variables
    let element_type = ElementType::poisson(CellTopology::quad(), 1);
    let coarse_mesh = Mesh::rectilinear([1.0, 1.0], [1, 1], &element_type);
    let mut fine_mesh = coarse_mesh.deep_copy();
    fine_mesh.h_refine(&BTreeSet::from([0]));

    let mut solution = ExactSolution::new();
    solution.set_scalar(0, |_| 3.14159);
    solution.set_vector(1, |_| vec![0.0, 0.0]);
    check_prolongation_reproduces_exact_solution(&coarse_mesh, &fine_mesh, &solution, 1e-12);
}

#[test]
fn quad_mesh_h_prolongation_of_a_polynomial() {
    let element_type = ElementType::poisson(CellTopology::quad(), 3);
    let coarse_mesh = Mesh::rectilinear([1.0, 1.0], [1, 1], &element_type);
    let mut fine_mesh = coarse_mesh.deep_copy();
    fine_mesh.h_refine(&BTreeSet::from([0]));

    let mut solution = ExactSolution::new();
    solution.set_scalar(0, |x| x[0] * x[0] + x[1]);
    solution.set_vector(1, |x| vec![2.0 * x[0], 1.0]);
    check_prolongation_reproduces_exact_solution(&coarse_mesh, &fine_mesh, &solution, 1e-12);
}

#[test]
fn two_by_two_h_prolongation_creates_hanging_nodes() {
    // refining one cell of a 2x2 mesh leaves hanging nodes on the fine mesh;
    // prolongation of a representable solution must still be exact
    let element_type = ElementType::poisson(CellTopology::quad(), 2);
    let coarse_mesh = Mesh::rectilinear([1.0, 1.0], [2, 2], &element_type);
    let mut fine_mesh = coarse_mesh.deep_copy();
    fine_mesh.h_refine(&BTreeSet::from([0]));

    let mut solution = ExactSolution::new();
    solution.set_scalar(0, |x| x[0] + 2.0 * x[1] - 0.5);
    solution.set_vector(1, |_| vec![1.0, 2.0]);
    check_prolongation_reproduces_exact_solution(&coarse_mesh, &fine_mesh, &solution, 1e-12);
}

#[test]
#[should_panic(expected = "no governing coarse cell")]
fn unrelated_meshes_are_a_fatal_error() {
    let element_type = ElementType::poisson(CellTopology::quad(), 1);
    let coarse_mesh = Mesh::rectilinear([1.0, 1.0], [1, 1], &element_type);
    // an independently built mesh whose second cell has no ancestry in the
    // coarse mesh
    let fine_mesh = Mesh::rectilinear([1.0, 2.0], [1, 2], &element_type);

    let mut engine = BasisReconciliation::new();
    let coarse_dofs = GlobalDofAssignment::new(&coarse_mesh, &mut engine, false);
    let fine_dofs = GlobalDofAssignment::new(&fine_mesh, &mut engine, false);
    let mut gmg = GmgProlongation::new(&coarse_mesh, &fine_mesh, &coarse_dofs, &fine_dofs, false);
    let _ = gmg.construct_prolongation_operator(&mut engine);
}
