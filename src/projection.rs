//! Projection of closed-form solutions onto a mesh's local bases.
//!
//! The nodal bases make projection a point-evaluation: a dof's coefficient is
//! the represented function's value at the dof's (physical) support point, which
//! reproduces any function the basis can represent exactly. Trace and flux
//! coefficients are derived from the field variables they trace — the plain
//! value for traces, the outward-normal component (in the cell's own
//! orientation) for fluxes — mirroring how a DPG solution populates its skeleton
//! unknowns from the fields.

use crate::dof::{gather_global_from_local, DofInterpreter};
use crate::mesh::{CellId, Mesh, VarKind};
use eyre::{eyre, Result};
use nalgebra::{DMatrix, DVector};
use rustc_hash::FxHashMap;

type ScalarFn = Box<dyn Fn(&[f64]) -> f64>;
type VectorFn = Box<dyn Fn(&[f64]) -> Vec<f64>>;

enum FieldFunction {
    Scalar(ScalarFn),
    Vector(VectorFn),
}

/// Closed-form values for the field variables of a trial system; trace and flux
/// variables are filled in from the fields they trace.
#[derive(Default)]
pub struct ExactSolution {
    fields: FxHashMap<usize, FieldFunction>,
}

impl ExactSolution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_scalar(&mut self, var_id: usize, f: impl Fn(&[f64]) -> f64 + 'static) -> &mut Self {
        self.fields.insert(var_id, FieldFunction::Scalar(Box::new(f)));
        self
    }

    pub fn set_vector(
        &mut self,
        var_id: usize,
        f: impl Fn(&[f64]) -> Vec<f64> + 'static,
    ) -> &mut Self {
        self.fields.insert(var_id, FieldFunction::Vector(Box::new(f)));
        self
    }

    fn scalar(&self, var_id: usize) -> Result<&ScalarFn> {
        match self.fields.get(&var_id) {
            Some(FieldFunction::Scalar(f)) => Ok(f),
            Some(FieldFunction::Vector(_)) => {
                Err(eyre!("variable {} needs a scalar function", var_id))
            }
            None => Err(eyre!("no function provided for variable {}", var_id)),
        }
    }

    fn vector(&self, var_id: usize) -> Result<&VectorFn> {
        match self.fields.get(&var_id) {
            Some(FieldFunction::Vector(f)) => Ok(f),
            Some(FieldFunction::Scalar(_)) => {
                Err(eyre!("variable {} needs a vector function", var_id))
            }
            None => Err(eyre!("no function provided for variable {}", var_id)),
        }
    }
}

/// A solution projected onto one mesh: per-cell local coefficients and the
/// gathered global vector.
pub struct ProjectedSolution {
    pub cell_coefficients: FxHashMap<CellId, DVector<f64>>,
    pub global: DVector<f64>,
}

/// Projects the exact solution onto every active cell and gathers the global
/// coefficient vector through the interpreter.
pub fn project_onto_mesh(
    mesh: &Mesh,
    solution: &ExactSolution,
    interpreter: &impl DofInterpreter,
) -> Result<ProjectedSolution> {
    let mut cell_coefficients = FxHashMap::default();
    for &cell in mesh.active_cells() {
        cell_coefficients.insert(cell, project_onto_cell(mesh, cell, solution)?);
    }
    let global = gather_global_from_local(mesh, interpreter, &cell_coefficients);
    Ok(ProjectedSolution { cell_coefficients, global })
}

/// Local coefficients of the exact solution on one cell.
pub fn project_onto_cell(
    mesh: &Mesh,
    cell: CellId,
    solution: &ExactSolution,
) -> Result<DVector<f64>> {
    let element_type = mesh.element_type(cell).clone();
    let geometry = mesh.cell_geometry(cell);
    let mut local = DVector::zeros(element_type.local_dof_count());
    for var in element_type.vars() {
        let node_points = var.basis.node_points();
        for (i, &ordinal) in var.local_ordinals().iter().enumerate() {
            let mut reference = DMatrix::zeros(1, node_points.ncols());
            reference.row_mut(0).copy_from(&node_points.row(ordinal));
            let physical = geometry.map_points(&reference);
            let x: Vec<f64> = physical.row(0).iter().copied().collect();
            let value = match var.kind {
                VarKind::Field => {
                    if var.basis.range_rank() == 0 {
                        (solution.scalar(var.id)?)(&x)
                    } else {
                        let component = var.basis.dof_component(ordinal);
                        (solution.vector(var.id)?)(&x)[component]
                    }
                }
                VarKind::Trace => {
                    let traced = var
                        .traced_field
                        .ok_or_else(|| eyre!("trace variable {} traces no field", var.name))?;
                    (solution.scalar(traced)?)(&x)
                }
                VarKind::Flux => {
                    let traced = var
                        .traced_field
                        .ok_or_else(|| eyre!("flux variable {} traces no field", var.name))?;
                    let (_, side) = var.basis.dof_subcell(ordinal);
                    let normal = mesh.side_outward_normal(cell, side);
                    if mesh.dimension() == 1 {
                        (solution.scalar(traced)?)(&x) * normal[0]
                    } else {
                        let field = (solution.vector(traced)?)(&x);
                        field.iter().zip(&normal).map(|(v, n)| v * n).sum()
                    }
                }
            };
            local[var.local_offset() + i] = value;
        }
    }
    Ok(local)
}
