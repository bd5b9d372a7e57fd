use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DVector};
use petrov::basis::{Basis, BasisRc};
use petrov::reconciliation::BasisReconciliation;
use petrov::refinement::{RefinementBranch, RefinementPattern};
use petrov::topology::CellTopology;

/// Evaluates the function with the given basis coefficients at reference points.
fn evaluate(basis: &BasisRc, coefficients: &DVector<f64>, points: &DMatrix<f64>) -> Vec<f64> {
    let values = basis.values(points);
    (0..points.nrows())
        .map(|p| (0..basis.cardinality()).map(|f| coefficients[f] * values.value(f, p, 0)).sum())
        .collect()
}

/// Coefficients representing `f` exactly in a scalar nodal basis.
fn interpolate(basis: &BasisRc, f: impl Fn(&[f64]) -> f64) -> DVector<f64> {
    let nodes = basis.node_points();
    DVector::from_fn(basis.cardinality(), |i, _| {
        let point: Vec<f64> = nodes.row(i).iter().copied().collect();
        f(&point)
    })
}

fn sample_points_2d() -> DMatrix<f64> {
    DMatrix::from_row_slice(4, 2, &[-0.7, 0.3, 0.1, -0.9, 0.55, 0.25, -1.0, 1.0])
}

#[test]
fn p_reconciliation_reproduces_coarse_polynomials() {
    let mut engine = BasisReconciliation::new();
    let fine = Basis::h_vol(CellTopology::quad(), 3);
    let coarse = Basis::h_vol(CellTopology::quad(), 1);
    let weights = engine.constrained_weights(&fine, &coarse).clone();
    assert_eq!(weights.nrows(), fine.cardinality());
    assert_eq!(weights.ncols(), coarse.cardinality());

    let f = |x: &[f64]| 2.0 * x[0] - 3.0 * x[1] + 0.25 * x[0] * x[1] - 1.0;
    let coarse_coefficients = interpolate(&coarse, f);
    let fine_coefficients = &weights * &coarse_coefficients;

    let points = sample_points_2d();
    let values = evaluate(&fine, &fine_coefficients, &points);
    for (p, value) in values.iter().enumerate() {
        let x = [points[(p, 0)], points[(p, 1)]];
        assert!((value - f(&x)).abs() < 1e-13, "point {}: {} vs {}", p, value, f(&x));
    }
}

#[test]
fn p_reconciliation_on_the_hexahedron() {
    let mut engine = BasisReconciliation::new();
    let fine = Basis::h_grad(CellTopology::hexahedron(), 2);
    let coarse = Basis::h_grad(CellTopology::hexahedron(), 1);
    let weights = engine.constrained_weights(&fine, &coarse).clone();

    let f = |x: &[f64]| 1.0 + x[0] - 2.0 * x[1] * x[2];
    let coarse_coefficients = interpolate(&coarse, f);
    let fine_coefficients = &weights * &coarse_coefficients;
    let points = DMatrix::from_row_slice(2, 3, &[0.3, -0.2, 0.7, -0.9, 0.4, -0.1]);
    for (p, value) in evaluate(&fine, &fine_coefficients, &points).iter().enumerate() {
        let x = [points[(p, 0)], points[(p, 1)], points[(p, 2)]];
        assert!((value - f(&x)).abs() < 1e-13);
    }
}

#[test]
fn h_reconciliation_reproduces_the_coarse_function_on_the_child() {
    let mut engine = BasisReconciliation::new();
    let fine = Basis::h_vol(CellTopology::line(), 2);
    let coarse = Basis::h_vol(CellTopology::line(), 2);
    let branch = RefinementBranch::from_steps(vec![(RefinementPattern::LineHalving, 0)]);
    let weights = engine.constrained_weights_refined(&fine, &branch, &coarse).clone();

    // the child cell [-1, 0]: fine reference t maps to parent x = (t - 1) / 2
    let f = |x: &[f64]| 0.5 * x[0] * x[0] - x[0] + 2.0;
    let coarse_coefficients = interpolate(&coarse, f);
    let fine_coefficients = &weights * &coarse_coefficients;
    let points = DMatrix::from_row_slice(3, 1, &[-0.8, 0.0, 0.9]);
    for (p, value) in evaluate(&fine, &fine_coefficients, &points).iter().enumerate() {
        let parent = [(points[(p, 0)] - 1.0) / 2.0];
        assert!((value - f(&parent)).abs() < 1e-13);
    }
}

#[test]
fn two_level_h_reconciliation_composes_the_branch() {
    let mut engine = BasisReconciliation::new();
    let basis = Basis::h_vol(CellTopology::line(), 1);
    let branch = RefinementBranch::from_steps(vec![
        (RefinementPattern::LineHalving, 1),
        (RefinementPattern::LineHalving, 0),
    ]);
    let weights = engine.constrained_weights_refined(&basis, &branch, &basis).clone();

    // grandchild [0, 0.5]: fine t maps to ancestor x = (t + 1) / 4
    let f = |x: &[f64]| 3.0 * x[0] - 0.5;
    let coarse_coefficients = interpolate(&basis, f);
    let fine_coefficients = &weights * &coarse_coefficients;
    let points = DMatrix::from_row_slice(2, 1, &[-0.5, 0.5]);
    for (p, value) in evaluate(&basis, &fine_coefficients, &points).iter().enumerate() {
        let ancestor = [(points[(p, 0)] + 1.0) / 4.0];
        assert!((value - f(&ancestor)).abs() < 1e-13);
    }
}

#[test]
fn side_reconciliation_degenerates_to_the_identity() {
    let mut engine = BasisReconciliation::new();
    let basis = Basis::h_grad(CellTopology::quad(), 3);
    let weights = engine.constrained_weights_for_side(&basis, 2, &basis, 2, 0).clone();
    assert_eq!(weights.fine_ordinals, weights.coarse_ordinals);
    assert_eq!(weights.fine_ordinals.len(), 4);
    assert_matrix_eq!(weights.weights, DMatrix::identity(4, 4));
}

#[test]
fn side_reconciliation_matches_a_lower_order_side() {
    let mut engine = BasisReconciliation::new();
    let fine = Basis::h_grad(CellTopology::quad(), 2);
    let coarse = Basis::h_grad(CellTopology::quad(), 1);
    let weights = engine.constrained_weights_for_side(&fine, 0, &coarse, 0, 0).clone();
    assert_eq!(weights.fine_ordinals.len(), 3);
    assert_eq!(weights.coarse_ordinals.len(), 2);

    // a function linear along the bottom side: exactly representable both ways
    let f = |x: &[f64]| 0.5 - 0.25 * x[0];
    let coarse_side_coefficients =
        DVector::from_fn(2, |j, _| {
            let ordinal = weights.coarse_ordinals[j];
            let point: Vec<f64> = coarse.node_points().row(ordinal).iter().copied().collect();
            f(&point)
        });
    let fine_side_coefficients = &weights.weights * &coarse_side_coefficients;
    for (i, &ordinal) in weights.fine_ordinals.iter().enumerate() {
        let point: Vec<f64> = fine.node_points().row(ordinal).iter().copied().collect();
        assert!((fine_side_coefficients[i] - f(&point)).abs() < 1e-13);
    }
}

#[test]
fn refined_side_reconciliation_tracks_the_ancestral_side() {
    let mut engine = BasisReconciliation::new();
    let fine = Basis::h_grad(CellTopology::quad(), 2);
    let coarse = Basis::h_grad(CellTopology::quad(), 2);
    // child 1 of a quartered quad, matched along ancestral side 0
    let branch = RefinementBranch::from_steps(vec![(RefinementPattern::QuadQuartering, 1)]);
    let weights =
        engine.constrained_weights_for_refined_side(&fine, 0, &branch, &coarse, 0, 0).clone();
    assert_eq!(weights.fine_ordinals.len(), 3);
    assert_eq!(weights.coarse_ordinals.len(), 3);

    // child 1 spans the right half [0, 1] x [-1, 0]: its side-0 coordinate x_f
    // maps to the ancestral coordinate x = (x_f + 1) / 2
    let g = |x: f64| x * x - 0.5 * x + 0.125;
    let coarse_side_coefficients = DVector::from_fn(3, |j, _| {
        let ordinal = weights.coarse_ordinals[j];
        g(coarse.node_points()[(ordinal, 0)])
    });
    let fine_side_coefficients = &weights.weights * &coarse_side_coefficients;
    for (i, &ordinal) in weights.fine_ordinals.iter().enumerate() {
        let x_fine = fine.node_points()[(ordinal, 0)];
        let x_ancestral = (x_fine + 1.0) / 2.0;
        assert!(
            (fine_side_coefficients[i] - g(x_ancestral)).abs() < 1e-13,
            "ordinal {}: {} vs {}",
            ordinal,
            fine_side_coefficients[i],
            g(x_ancestral)
        );
    }
}

#[test]
fn refined_side_reconciliation_with_an_empty_branch_matches_plain_side_weights() {
    let mut engine = BasisReconciliation::new();
    let fine = Basis::h_grad(CellTopology::quad(), 3);
    let coarse = Basis::h_grad(CellTopology::quad(), 2);
    let plain = engine.constrained_weights_for_side(&fine, 1, &coarse, 1, 1).clone();
    let through_branch = engine
        .constrained_weights_for_refined_side(&fine, 1, &RefinementBranch::empty(), &coarse, 1, 1)
        .clone();
    assert_eq!(plain.fine_ordinals, through_branch.fine_ordinals);
    assert_eq!(plain.coarse_ordinals, through_branch.coarse_ordinals);
    assert_matrix_eq!(plain.weights, through_branch.weights);
}

#[test]
fn flux_side_reconciliation_keeps_only_the_matched_side() {
    let mut engine = BasisReconciliation::new();
    let fine = Basis::flux(CellTopology::quad(), 1);
    let coarse = Basis::flux(CellTopology::quad(), 0);
    let weights = engine.constrained_weights_for_side(&fine, 3, &coarse, 3, 0).clone();
    assert_eq!(weights.fine_ordinals, vec![6, 7]);
    assert_eq!(weights.coarse_ordinals, vec![3]);
    // a constant flux is reproduced exactly
    let fine_coefficients = &weights.weights * &DVector::from_element(1, 2.5);
    for i in 0..2 {
        assert!((fine_coefficients[i] - 2.5).abs() < 1e-13);
    }
}

#[test]
fn memoization_is_bitwise_stable_across_all_four_operations() {
    let mut engine = BasisReconciliation::new();
    let fine = Basis::h_grad(CellTopology::quad(), 3);
    let coarse = Basis::h_grad(CellTopology::quad(), 1);
    let branch = RefinementBranch::from_steps(vec![(RefinementPattern::QuadQuartering, 2)]);

    let p_first = engine.constrained_weights(&fine, &coarse).clone();
    let side_first = engine.constrained_weights_for_side(&fine, 0, &coarse, 0, 1).clone();
    let h_first = engine.constrained_weights_refined(&fine, &branch, &coarse).clone();
    let general_first =
        engine.constrained_weights_for_refined_side(&fine, 2, &branch, &coarse, 2, 1).clone();

    assert_eq!(&p_first, engine.constrained_weights(&fine, &coarse));
    let side_second = engine.constrained_weights_for_side(&fine, 0, &coarse, 0, 1);
    assert_eq!(side_first.weights, side_second.weights);
    assert_eq!(&h_first, engine.constrained_weights_refined(&fine, &branch, &coarse));
    let general_second =
        engine.constrained_weights_for_refined_side(&fine, 2, &branch, &coarse, 2, 1);
    assert_eq!(general_first.weights, general_second.weights);
}
