//! The cubature provider: quadrature rules per topology and polynomial degree.
//!
//! One-dimensional Gauss-Legendre rules are computed by Newton iteration on the
//! Legendre recurrence; tensor products of these cover the hypercube topologies,
//! and a collapsed-coordinate (Duffy) transformation covers the triangle. Rules
//! returned by [`cubature`] integrate polynomials exactly up to the requested
//! degree.

use crate::topology::{CellShape, CellTopology};
use itertools::izip;
use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;

/// A quadrature rule: one reference point per row, and a weight per point.
#[derive(Debug, Clone)]
pub struct QuadratureRule {
    pub points: DMatrix<f64>,
    pub weights: DVector<f64>,
}

impl QuadratureRule {
    pub fn num_points(&self) -> usize {
        self.weights.len()
    }
}

/// Legendre polynomial values by the three-term recurrence.
///
/// The derivative formula divides by `x^2 - 1`, so it is valid only in the open
/// interval (-1, 1).
#[derive(Debug)]
struct LegendreRecurrence {
    n: usize,
    x: f64,
    // p1 = P_n(x), p2 = P_{n-1}(x)
    p1: f64,
    p2: f64,
}

impl LegendreRecurrence {
    fn evaluate(n: usize, x: f64) -> Self {
        // m P_m(x) = (2m - 1) x P_{m-1}(x) - (m - 1) P_{m-2}(x)
        let mut p1 = 1.0;
        let mut p2 = 0.0;
        let mut p3;
        for m in 1..=n {
            let m = m as f64;
            p3 = p2;
            p2 = p1;
            p1 = ((2.0 * m - 1.0) * x * p2 - (m - 1.0) * p3) / m;
        }
        Self { n, x, p1, p2 }
    }

    fn value(&self) -> f64 {
        self.p1
    }

    fn derivative(&self) -> f64 {
        let n = self.n as f64;
        n * (self.x * self.p1 - self.p2) / (self.x * self.x - 1.0)
    }

    fn second_derivative(&self) -> f64 {
        let n = self.n as f64;
        (2.0 * self.x * self.derivative() - n * (n + 1.0) * self.value()) / (1.0 - self.x * self.x)
    }
}

/// Gauss-Legendre quadrature on [-1, 1]. With `n` points the rule is exact for
/// polynomials of degree up to `2n - 1`.
///
/// # Panics
///
/// Panics if zero points are requested.
pub fn gauss(num_points: usize) -> (Vec<f64>, Vec<f64>) {
    let n = num_points;
    assert!(n > 0, "number of points must be positive");

    let m = (n + 1) / 2;
    let mut points = Vec::with_capacity(n);
    let mut weights = Vec::with_capacity(n);

    // Find the first m roots; the rest follow by symmetry.
    for i in 0..m {
        let mut x = (PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        loop {
            let rec = LegendreRecurrence::evaluate(n, x);
            let dx = -rec.value() / rec.derivative();
            x += dx;
            if dx.abs() <= 1e-15 {
                break;
            }
        }
        let dp = LegendreRecurrence::evaluate(n, x).derivative();
        let w = 2.0 / ((1.0 - x * x) * dp * dp);
        points.push(x);
        weights.push(w);
    }
    for i in m..n {
        let mirror = n - i - 1;
        points.push(-points[mirror]);
        weights.push(weights[mirror]);
    }
    (weights, points)
}

/// Gauss-Lobatto points on [-1, 1]: the endpoints plus the roots of P'_{n-1}.
/// These are the support points of the conforming nodal bases.
///
/// # Panics
///
/// Panics if fewer than two points are requested.
pub fn gauss_lobatto_points(num_points: usize) -> Vec<f64> {
    let n = num_points;
    assert!(n >= 2, "Gauss-Lobatto needs at least the two endpoints");
    let mut points = vec![0.0; n];
    points[0] = -1.0;
    points[n - 1] = 1.0;
    // Interior points are roots of P'_{n-1}; the cosine guess below is close
    // enough for Newton to converge in a handful of steps. Only the left half is
    // solved for; the right half mirrors it so the point set is exactly
    // symmetric, which downstream node-location matching relies on.
    for i in 1..=(n - 1) / 2 {
        let mut x = -(PI * i as f64 / (n as f64 - 1.0)).cos();
        loop {
            let rec = LegendreRecurrence::evaluate(n - 1, x);
            let dx = -rec.derivative() / rec.second_derivative();
            x += dx;
            if dx.abs() <= 1e-15 {
                break;
            }
        }
        points[i] = x;
        points[n - 1 - i] = -x;
    }
    if n % 2 == 1 {
        points[n / 2] = 0.0;
    }
    points
}

/// A quadrature rule for the given topology, exact for polynomials of (tensor)
/// degree at most `degree`.
///
/// # Panics
///
/// Panics for tensorial topologies; cubature is provided on base shapes only.
pub fn cubature(topology: CellTopology, degree: usize) -> QuadratureRule {
    assert_eq!(
        topology.tensorial_degree(),
        0,
        "cubature is provided for base shapes only, not {:?}",
        topology
    );
    match topology.shape() {
        CellShape::Node => QuadratureRule {
            points: DMatrix::zeros(1, 0),
            weights: DVector::from_element(1, 1.0),
        },
        CellShape::Line => tensor_rule(degree, 1),
        CellShape::Quad => tensor_rule(degree, 2),
        CellShape::Hexahedron => tensor_rule(degree, 3),
        CellShape::Triangle => triangle_rule(degree),
    }
}

fn tensor_rule(degree: usize, dim: usize) -> QuadratureRule {
    let n = degree / 2 + 1;
    let (w1, p1) = gauss(n);
    let num_points = n.pow(dim as u32);
    let mut points = DMatrix::zeros(num_points, dim);
    let mut weights = DVector::zeros(num_points);
    for idx in 0..num_points {
        let mut rem = idx;
        let mut w = 1.0;
        for axis in 0..dim {
            let i = rem % n;
            rem /= n;
            points[(idx, axis)] = p1[i];
            w *= w1[i];
        }
        weights[idx] = w;
    }
    QuadratureRule { points, weights }
}

/// Collapsed-coordinate rule on the unit triangle {x, y >= 0, x + y <= 1}.
///
/// The square [-1,1]^2 maps onto the triangle through x = (1+u)(1-v)/4,
/// y = (1+v)/2, whose Jacobian (1-v)/8 raises the polynomial degree in the
/// collapsed direction by one; the v-direction therefore uses one extra point.
fn triangle_rule(degree: usize) -> QuadratureRule {
    let nu = degree / 2 + 1;
    let nv = (degree + 1) / 2 + 1;
    let (wu, pu) = gauss(nu);
    let (wv, pv) = gauss(nv);
    let num_points = nu * nv;
    let mut points = DMatrix::zeros(num_points, 2);
    let mut weights = DVector::zeros(num_points);
    let mut idx = 0;
    for (&v, &wj) in izip!(&pv, &wv) {
        for (&u, &wi) in izip!(&pu, &wu) {
            points[(idx, 0)] = (1.0 + u) * (1.0 - v) / 4.0;
            points[(idx, 1)] = (1.0 + v) / 2.0;
            weights[idx] = wi * wj * (1.0 - v) / 8.0;
            idx += 1;
        }
    }
    QuadratureRule { points, weights }
}
