//! The geometric multigrid prolongation operator.
//!
//! [`GmgProlongation`] assembles the sparse global operator `P` mapping a coarse
//! mesh's solution coefficients to a fine mesh's coefficients, cell by cell:
//! every fine active cell finds its governing coarse cell (the nearest ancestor
//! active in the coarse mesh), requests the constrained weights relating the two
//! cells' bases from the [`BasisReconciliation`] engine, and composes them with
//! the coarse interpreter's local-from-global constraint matrix. Each fine local
//! dof that mirrors a single global fine dof contributes one sparse row.
//!
//! Field variables reconcile whole-cell; trace and flux variables reconcile side
//! by side against the matching ancestral side. A fine side with no ancestral
//! counterpart lies strictly inside the governing coarse cell, and its trace
//! values are drawn from the coarse *field* variable the trace mirrors (with the
//! outward-normal parity sign for fluxes) by an L2 projection onto the fine side
//! basis.
//!
//! When the fine and coarse meshes coincide, `P` restricted to the shared dofs is
//! exactly the identity; this is the operator's primary correctness invariant.

use crate::basis::BasisId;
use crate::dof::{DofInterpreter, GlobalDofAssignment};
use crate::geometry::CellGeometry;
use crate::mesh::{CellId, ElementType, Mesh, TrialVar, VarKind};
use crate::quadrature::cubature;
use crate::reconciliation::{
    embed_side_points, integrate_products, solve_constraint_system, vertex_permutation,
    BasisReconciliation, SubBasisReconciliationWeights,
};
use crate::refinement::RefinementBranch;
use crate::topology::CellTopology;
use eyre::ensure;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rustc_hash::FxHashMap;
use std::sync::Arc;

type TracedKey = (BasisId, usize, BasisId, RefinementBranch, Vec<i64>);

/// One multigrid level pair: a coarse and a fine view of a refinement hierarchy,
/// with their dof interpreters. The fine mesh must descend from the coarse mesh
/// (or equal it), with comparable cell ids, as produced by
/// [`Mesh::deep_copy`] followed by refinements.
pub struct GmgProlongation<'a> {
    coarse_mesh: &'a Mesh,
    fine_mesh: &'a Mesh,
    coarse_dofs: &'a GlobalDofAssignment,
    fine_dofs: &'a GlobalDofAssignment,
    use_static_condensation: bool,
    fine_coarse_roles_swapped: bool,
    traced_weights: FxHashMap<TracedKey, SubBasisReconciliationWeights>,
    prolongation: Option<CsrMatrix<f64>>,
}

impl<'a> GmgProlongation<'a> {
    pub fn new(
        coarse_mesh: &'a Mesh,
        fine_mesh: &'a Mesh,
        coarse_dofs: &'a GlobalDofAssignment,
        fine_dofs: &'a GlobalDofAssignment,
        use_static_condensation: bool,
    ) -> Self {
        GmgProlongation {
            coarse_mesh,
            fine_mesh,
            coarse_dofs,
            fine_dofs,
            use_static_condensation,
            fine_coarse_roles_swapped: false,
            traced_weights: FxHashMap::default(),
            prolongation: None,
        }
    }

    /// When the nominal fine and coarse meshes are geometrically identical but
    /// differ in conformity, the weight computation can be run with the roles
    /// reversed and applied transposed.
    pub fn set_fine_coarse_roles_swapped(&mut self, swapped: bool) {
        self.fine_coarse_roles_swapped = swapped;
    }

    /// The assembled operator, once constructed.
    pub fn prolongation_operator(&self) -> Option<&CsrMatrix<f64>> {
        self.prolongation.as_ref()
    }

    /// Applies the assembled operator to a coarse global vector.
    pub fn apply(&self, coarse: &DVector<f64>) -> DVector<f64> {
        let matrix = self.prolongation.as_ref().expect("operator has been constructed");
        matrix * coarse
    }

    /// Assembles the prolongation operator for the current mesh states. Must be
    /// re-run if either mesh is refined afterwards.
    pub fn construct_prolongation_operator(
        &mut self,
        reconciliation: &mut BasisReconciliation,
    ) -> eyre::Result<&CsrMatrix<f64>> {
        ensure!(
            self.coarse_dofs.use_static_condensation() == self.use_static_condensation
                && self.fine_dofs.use_static_condensation() == self.use_static_condensation,
            "dof interpreters disagree with the operator's static-condensation mode"
        );

        let num_rows = self.fine_dofs.global_dof_count();
        let num_cols = self.coarse_dofs.global_dof_count();
        let mut coo = CooMatrix::new(num_rows, num_cols);
        let mut row_written = vec![false; num_rows];

        let fine_mesh = self.fine_mesh;
        let coarse_mesh = self.coarse_mesh;
        for &fine_cell in fine_mesh.active_cells() {
            let (coarse_cell, branch) = self.governing_coarse_cell(fine_cell);
            let fine_type = fine_mesh.element_type(fine_cell).clone();
            let coarse_type = coarse_mesh.element_type(coarse_cell).clone();

            for fine_var in fine_type.vars() {
                let Some(coarse_var) = coarse_type.var_with_id(fine_var.id) else {
                    // deliberately silent: level pairs may carry different
                    // variable sets, and the solver chooses compatible ones
                    log::debug!(
                        "variable {} absent on coarse cell {}; skipping",
                        fine_var.name,
                        coarse_cell
                    );
                    continue;
                };
                match fine_var.kind {
                    VarKind::Field => self.prolong_field_var(
                        reconciliation,
                        fine_cell,
                        coarse_cell,
                        &branch,
                        fine_var,
                        coarse_var,
                        &mut coo,
                        &mut row_written,
                    ),
                    VarKind::Trace | VarKind::Flux => self.prolong_side_var(
                        reconciliation,
                        fine_cell,
                        coarse_cell,
                        &branch,
                        fine_var,
                        coarse_var,
                        &coarse_type,
                        &mut coo,
                        &mut row_written,
                    ),
                }
            }
        }

        self.prolongation = Some(CsrMatrix::from(&coo));
        Ok(self.prolongation.as_ref().unwrap())
    }

    /// The nearest ancestor of `fine_cell` active in the coarse mesh, and the
    /// refinement branch connecting them.
    ///
    /// # Panics
    ///
    /// Panics when no governing cell exists: the meshes are then not related by
    /// refinement, which is a topology inconsistency in the caller's setup.
    fn governing_coarse_cell(&self, fine_cell: CellId) -> (CellId, RefinementBranch) {
        let mut current = fine_cell;
        loop {
            if self.coarse_mesh.is_active(current) {
                let branch = self
                    .fine_mesh
                    .refinement_branch(fine_cell, current)
                    .expect("current is an ancestor of fine_cell by construction");
                return (current, branch);
            }
            match self.fine_mesh.cell(current).parent {
                Some(parent) => current = parent,
                None => {
                    log::error!(
                        "fine cell {} has no ancestor active in the coarse mesh",
                        fine_cell
                    );
                    panic!("no governing coarse cell found for fine cell {}", fine_cell);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn prolong_field_var(
        &self,
        reconciliation: &mut BasisReconciliation,
        fine_cell: CellId,
        coarse_cell: CellId,
        branch: &RefinementBranch,
        fine_var: &TrialVar,
        coarse_var: &TrialVar,
        coo: &mut CooMatrix<f64>,
        row_written: &mut [bool],
    ) {
        if self.use_static_condensation {
            // condensed-out dofs are excluded from the operator on both sides
            return;
        }
        let weights = if self.fine_coarse_roles_swapped {
            let reversed = if branch.is_empty() {
                reconciliation.constrained_weights(&coarse_var.basis, &fine_var.basis).clone()
            } else {
                reconciliation
                    .constrained_weights_refined(&coarse_var.basis, branch, &fine_var.basis)
                    .clone()
            };
            reversed.transpose()
        } else if branch.is_empty() {
            reconciliation.constrained_weights(&fine_var.basis, &coarse_var.basis).clone()
        } else {
            reconciliation
                .constrained_weights_refined(&fine_var.basis, branch, &coarse_var.basis)
                .clone()
        };
        let block = SubBasisReconciliationWeights {
            fine_ordinals: (0..fine_var.basis.cardinality()).collect(),
            coarse_ordinals: (0..coarse_var.basis.cardinality()).collect(),
            weights,
        };
        self.contribute_block(fine_cell, coarse_cell, fine_var, coarse_var, &block, coo, row_written);
    }

    #[allow(clippy::too_many_arguments)]
    fn prolong_side_var(
        &mut self,
        reconciliation: &mut BasisReconciliation,
        fine_cell: CellId,
        coarse_cell: CellId,
        branch: &RefinementBranch,
        fine_var: &TrialVar,
        coarse_var: &TrialVar,
        coarse_type: &Arc<ElementType>,
        coo: &mut CooMatrix<f64>,
        row_written: &mut [bool],
    ) {
        let fine_topology = self.fine_mesh.cell(fine_cell).topology;
        let coarse_topology = self.coarse_mesh.cell(coarse_cell).topology;
        for side in 0..fine_topology.side_count() {
            let ancestral_side = (0..coarse_topology.side_count())
                .find(|&s| branch.resolve_ancestral_side(s) == Some(side));
            if let Some(ancestral_side) = ancestral_side {
                // The governing cell *is* the fine cell's ancestor, so both views
                // of the ancestral side share geometry; the search still runs to
                // validate it.
                let permutation = vertex_permutation(
                    coarse_topology,
                    ancestral_side,
                    &self.fine_mesh.cell_nodes(coarse_cell),
                    coarse_topology,
                    ancestral_side,
                    &self.coarse_mesh.cell_nodes(coarse_cell),
                );
                let block = if self.fine_coarse_roles_swapped {
                    let reversed = if branch.is_empty() {
                        reconciliation
                            .constrained_weights_for_side(
                                &coarse_var.basis,
                                ancestral_side,
                                &fine_var.basis,
                                side,
                                permutation,
                            )
                            .clone()
                    } else {
                        panic!("fine/coarse role swap requires geometrically identical meshes")
                    };
                    SubBasisReconciliationWeights {
                        fine_ordinals: reversed.coarse_ordinals,
                        coarse_ordinals: reversed.fine_ordinals,
                        weights: reversed.weights.transpose(),
                    }
                } else if branch.is_empty() {
                    reconciliation
                        .constrained_weights_for_side(
                            &fine_var.basis,
                            side,
                            &coarse_var.basis,
                            ancestral_side,
                            permutation,
                        )
                        .clone()
                } else {
                    reconciliation
                        .constrained_weights_for_refined_side(
                            &fine_var.basis,
                            ancestral_side,
                            branch,
                            &coarse_var.basis,
                            ancestral_side,
                            permutation,
                        )
                        .clone()
                };
                self.contribute_block(
                    fine_cell,
                    coarse_cell,
                    fine_var,
                    coarse_var,
                    &block,
                    coo,
                    row_written,
                );
            } else {
                // A side interior to the governing cell: prolong from the traced
                // field variable.
                if self.use_static_condensation {
                    continue;
                }
                let Some(traced_id) = fine_var.traced_field else {
                    continue;
                };
                let Some(coarse_field) = coarse_type.var_with_id(traced_id) else {
                    log::debug!(
                        "traced field {} absent on coarse cell {}; skipping interior side",
                        traced_id,
                        coarse_cell
                    );
                    continue;
                };
                let block = self.traced_field_weights(
                    fine_cell,
                    side,
                    fine_var,
                    coarse_field,
                    branch,
                    coarse_topology,
                );
                self.contribute_block(
                    fine_cell,
                    coarse_cell,
                    fine_var,
                    coarse_field,
                    &block,
                    coo,
                    row_written,
                );
            }
        }
    }

    /// L2 projection of the coarse field variable (restricted to a fine interior
    /// side, through the refinement branch) onto the fine side basis. For flux
    /// variables the field is contracted with the fine side's outward normal.
    fn traced_field_weights(
        &mut self,
        fine_cell: CellId,
        side: usize,
        fine_var: &TrialVar,
        coarse_field: &TrialVar,
        branch: &RefinementBranch,
        coarse_topology: CellTopology,
    ) -> SubBasisReconciliationWeights {
        let fine_basis = &fine_var.basis;
        let fine_topology = fine_basis.domain_topology();
        let d = fine_topology.dimension();
        let normal = self.fine_mesh.side_outward_normal(fine_cell, side);
        let normal_key: Vec<i64> = normal.iter().map(|&x| (x * 1e9).round() as i64).collect();
        let key =
            (fine_basis.id(), side, coarse_field.basis.id(), branch.clone(), normal_key);
        if let Some(cached) = self.traced_weights.get(&key) {
            return cached.clone();
        }

        let min_dim = match fine_var.kind {
            VarKind::Trace => 0,
            VarKind::Flux => d - 1,
            VarKind::Field => unreachable!("field variables are prolonged whole-cell"),
        };
        let fine_ordinals = fine_basis.dof_ordinals_for_subcell(d - 1, side, min_dim);
        let coarse_cardinality = coarse_field.basis.cardinality();
        if fine_ordinals.is_empty() {
            let weights = SubBasisReconciliationWeights {
                fine_ordinals,
                coarse_ordinals: (0..coarse_cardinality).collect(),
                weights: DMatrix::zeros(0, coarse_cardinality),
            };
            self.traced_weights.insert(key, weights.clone());
            return weights;
        }

        let side_topology = fine_topology.side_topology(side);
        let cubature_degree = 2 * fine_basis.degree().max(coarse_field.basis.degree());
        let rule = cubature(side_topology, cubature_degree);

        let fine_points = embed_side_points(fine_topology, side, &rule.points);
        let descendant_nodes = branch.descendant_nodes_in_reference(coarse_topology);
        let coarse_points =
            CellGeometry::new(fine_topology, descendant_nodes).map_points(&fine_points);

        let fine_values = fine_basis.values(&fine_points);
        let coarse_values = coarse_field.basis.values(&coarse_points);

        let gram = integrate_products(
            &fine_values,
            Some(&fine_ordinals),
            &fine_values,
            Some(&fine_ordinals),
            &rule.weights,
        );
        // cross matrix against the traced field: scalar values for traces, the
        // normal component for fluxes
        let mut rhs = DMatrix::zeros(fine_ordinals.len(), coarse_cardinality);
        for (i, &fo) in fine_ordinals.iter().enumerate() {
            for j in 0..coarse_cardinality {
                let mut entry = 0.0;
                for p in 0..rule.num_points() {
                    let target: f64 = match fine_var.kind {
                        VarKind::Trace => coarse_values.value(j, p, 0),
                        VarKind::Flux => (0..coarse_values.components())
                            .map(|k| coarse_values.value(j, p, k) * normal[k])
                            .sum(),
                        VarKind::Field => unreachable!(),
                    };
                    entry += rule.weights[p] * fine_values.value(fo, p, 0) * target;
                }
                rhs[(i, j)] = entry;
            }
        }
        let weights = SubBasisReconciliationWeights {
            fine_ordinals,
            coarse_ordinals: (0..coarse_cardinality).collect(),
            weights: solve_constraint_system(gram, rhs),
        };
        self.traced_weights.insert(key, weights.clone());
        weights
    }

    /// Writes the rows of one reconciled block into the global operator: every
    /// fine local dof mirroring a single global fine dof gets the weight row
    /// composed with the coarse constraint matrix. Shared rows are written once;
    /// later contributions are identical by the determinism of the memoized
    /// weights.
    #[allow(clippy::too_many_arguments)]
    fn contribute_block(
        &self,
        fine_cell: CellId,
        coarse_cell: CellId,
        fine_var: &TrialVar,
        coarse_var: &TrialVar,
        block: &SubBasisReconciliationWeights,
        coo: &mut CooMatrix<f64>,
        row_written: &mut [bool],
    ) {
        let fine_map = self.fine_dofs.local_from_global(fine_cell);
        let coarse_map = self.coarse_dofs.local_from_global(coarse_cell);
        for (i, &fine_ordinal) in block.fine_ordinals.iter().enumerate() {
            let Some(fine_local) = fine_var.local_index_of_ordinal(fine_ordinal) else {
                continue;
            };
            let Some((row, sign)) = fine_map.fitted_global(fine_local) else {
                // constrained fine dofs own no global row; the owning side's
                // cells write those rows
                continue;
            };
            if row_written[row] {
                continue;
            }
            row_written[row] = true;
            let mut entries: FxHashMap<usize, f64> = FxHashMap::default();
            for (j, &coarse_ordinal) in block.coarse_ordinals.iter().enumerate() {
                let weight = block.weights[(i, j)];
                if weight == 0.0 {
                    continue;
                }
                let Some(coarse_local) = coarse_var.local_index_of_ordinal(coarse_ordinal) else {
                    continue;
                };
                for &(column, coarse_weight) in coarse_map.row(coarse_local) {
                    *entries.entry(column).or_insert(0.0) += sign * weight * coarse_weight;
                }
            }
            for (column, value) in entries {
                if value.abs() > 1e-14 {
                    coo.push(row, column, value);
                }
            }
        }
    }
}
