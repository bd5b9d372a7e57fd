use nalgebra::DVector;
use petrov::dof::{local_from_global_matrix, DofInterpreter, GlobalDofAssignment};
use petrov::mesh::{ElementType, Mesh};
use petrov::projection::{project_onto_mesh, ExactSolution};
use petrov::reconciliation::BasisReconciliation;
use petrov::topology::CellTopology;
use std::collections::BTreeSet;

fn poisson_solution_2d() -> ExactSolution {
    // phi = 0.5 x + 2 y - 0.75, psi = grad phi: representable at H1 order >= 2
    let mut solution = ExactSolution::new();
    solution.set_scalar(0, |x| 0.5 * x[0] + 2.0 * x[1] - 0.75);
    solution.set_vector(1, |_| vec![0.5, 2.0]);
    solution
}

/// Imported local coefficients must agree with direct projection whenever the
/// projected function satisfies the mesh's continuity constraints.
fn check_import_matches_projection(mesh: &Mesh, solution: &ExactSolution, tol: f64) {
    let mut engine = BasisReconciliation::new();
    let dofs = GlobalDofAssignment::new(mesh, &mut engine, false);
    let projected = project_onto_mesh(mesh, solution, &dofs).unwrap();
    for &cell in mesh.active_cells() {
        let imported = dofs.import_cell_solution(cell, &projected.global);
        let direct = &projected.cell_coefficients[&cell];
        let difference = (&imported - direct).amax();
        assert!(
            difference < tol,
            "cell {}: imported and projected coefficients differ by {}",
            cell,
            difference
        );
    }
}

#[test]
fn conforming_mesh_global_dof_count() {
    let element_type = ElementType::poisson(CellTopology::quad(), 1);
    let mesh = Mesh::rectilinear([1.0, 1.0], [2, 2], &element_type);
    let mut engine = BasisReconciliation::new();
    let dofs = GlobalDofAssignment::new(&mesh, &mut engine, false);
    // fields: 4 cells x (1 + 2); traces: 9 vertices; fluxes: 12 edges x 1
    assert_eq!(dofs.global_dof_count(), 12 + 9 + 12);

    let condensed = GlobalDofAssignment::new(&mesh, &mut engine, true);
    assert_eq!(condensed.global_dof_count(), 9 + 12);
}

#[test]
fn conforming_local_dofs_are_all_fitted() {
    let element_type = ElementType::poisson(CellTopology::quad(), 1);
    let mesh = Mesh::rectilinear([1.0, 1.0], [2, 2], &element_type);
    let mut engine = BasisReconciliation::new();
    let dofs = GlobalDofAssignment::new(&mesh, &mut engine, false);
    for &cell in mesh.active_cells() {
        let map = dofs.local_from_global(cell);
        for local in 0..map.local_dof_count() {
            assert!(
                map.fitted_global(local).is_some(),
                "cell {} local dof {} should be unconstrained on a conforming mesh",
                cell,
                local
            );
        }
        // densified, the constraint matrix has exactly one unit-magnitude entry
        // per row
        let matrix = local_from_global_matrix(map, dofs.global_dof_count());
        for row in matrix.row_iter() {
            let nonzero: Vec<f64> = row.iter().copied().filter(|v| *v != 0.0).collect();
            assert_eq!(nonzero.len(), 1);
            assert_eq!(nonzero[0].abs(), 1.0);
        }
    }
}

#[test]
fn shared_dofs_agree_across_flipped_edges() {
    let element_type = ElementType::poisson(CellTopology::quad(), 2);
    let mesh = Mesh::rectilinear([2.0, 1.0], [2, 1], &element_type);
    check_import_matches_projection(&mesh, &poisson_solution_2d(), 1e-12);
}

#[test]
fn hanging_edge_constraints_reproduce_conforming_data() {
    let element_type = ElementType::poisson(CellTopology::quad(), 2);
    let mut mesh = Mesh::rectilinear([1.0, 1.0], [1, 2], &element_type);
    mesh.h_refine(&BTreeSet::from([0]));
    check_import_matches_projection(&mesh, &poisson_solution_2d(), 1e-12);
}

#[test]
fn p_enriched_edge_constraints_reproduce_conforming_data() {
    let element_type = ElementType::poisson(CellTopology::quad(), 2);
    let mut mesh = Mesh::rectilinear([2.0, 1.0], [2, 1], &element_type);
    mesh.p_refine(&BTreeSet::from([1]));
    check_import_matches_projection(&mesh, &poisson_solution_2d(), 1e-12);
}

#[test]
fn hanging_edge_owns_no_global_dofs() {
    let element_type = ElementType::poisson(CellTopology::quad(), 1);
    let mut conforming = Mesh::rectilinear([1.0, 1.0], [1, 2], &element_type);
    let mut hanging = conforming.deep_copy();

    // refine the bottom cell of the hanging mesh only
    hanging.h_refine(&BTreeSet::from([0]));
    let mut engine = BasisReconciliation::new();
    let hanging_dofs = GlobalDofAssignment::new(&hanging, &mut engine, false);

    // uniform refinement of both cells, for comparison
    conforming.h_refine(&BTreeSet::from([0, 1]));
    let conforming_dofs = GlobalDofAssignment::new(&conforming, &mut engine, false);

    // the hanging mesh has fewer dofs: fewer cells, and its constrained
    // interface edges carry no skeleton dofs of their own
    assert!(hanging_dofs.global_dof_count() < conforming_dofs.global_dof_count());
}

#[test]
fn import_scales_linearly_in_the_global_vector() {
    let element_type = ElementType::poisson(CellTopology::line(), 2);
    let mesh = Mesh::interval(0.0, 1.0, 3, &element_type);
    let mut engine = BasisReconciliation::new();
    let dofs = GlobalDofAssignment::new(&mesh, &mut engine, false);
    let ones = DVector::from_element(dofs.global_dof_count(), 1.0);
    let twos = DVector::from_element(dofs.global_dof_count(), 2.0);
    for &cell in mesh.active_cells() {
        let a = dofs.import_cell_solution(cell, &ones);
        let b = dofs.import_cell_solution(cell, &twos);
        assert!((&b - &a * 2.0).amax() < 1e-15);
    }
}
