//! Degree-of-freedom interpretation: the translation between cell-local and
//! global dof numbering on nonconforming hp-meshes.
//!
//! [`GlobalDofAssignment`] implements a minimum-rule assignment. Field dofs are
//! owned per active cell (and dropped entirely under static condensation).
//! Trace and flux dofs are owned by unconstrained skeleton sides at the minimum
//! order among the adjacent cells, identified by the physical location of their
//! support points; nodal bases make the point-value semantics of a dof explicit,
//! so two views of a shared node agree exactly. Local dofs on hanging or
//! p-enriched sides carry no global dof of their own: they are expressed through
//! the reconciliation engine's constrained weights against the owning side's
//! basis, which is precisely the role the engine's side operations play in a
//! minimum-rule assignment.
//!
//! Flux dofs are stored globally in the owning side's orientation with a parity
//! sign: the owner's local coefficient equals the global value, the opposite
//! cell's local coefficient is its negative.

use crate::mesh::{CellId, Mesh, TrialVar, VarKind};
use crate::reconciliation::{vertex_permutation, BasisReconciliation};
use crate::refinement::RefinementBranch;
use nalgebra::{DMatrix, DVector};
use rustc_hash::FxHashMap;

/// The per-cell constraint matrix: one sparse row per local dof, expressing the
/// local coefficient as a weighted sum of global coefficients.
#[derive(Debug, Clone, Default)]
pub struct LocalGlobalMap {
    rows: Vec<Vec<(usize, f64)>>,
}

impl LocalGlobalMap {
    pub fn local_dof_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, local: usize) -> &[(usize, f64)] {
        &self.rows[local]
    }

    /// The single global dof this local dof mirrors (with unit-magnitude
    /// weight), if it is not a constrained combination.
    pub fn fitted_global(&self, local: usize) -> Option<(usize, f64)> {
        match self.rows[local].as_slice() {
            &[(global, weight)] if weight.abs() == 1.0 => Some((global, weight)),
            _ => None,
        }
    }
}

/// Translation between local and global dof numbering for one mesh state.
pub trait DofInterpreter {
    fn global_dof_count(&self) -> usize;

    fn local_from_global(&self, cell: CellId) -> &LocalGlobalMap;

    /// Scatters a global coefficient vector into one cell's local coefficients.
    fn import_cell_solution(&self, cell: CellId, global: &DVector<f64>) -> DVector<f64> {
        let map = self.local_from_global(cell);
        let mut local = DVector::zeros(map.local_dof_count());
        for (i, row) in map.rows.iter().enumerate() {
            local[i] = row.iter().map(|&(g, w)| w * global[g]).sum();
        }
        local
    }
}

/// The relation of a cell side to the mesh skeleton.
#[derive(Debug, Clone)]
enum SideStatus {
    /// Boundary side, or the governing (coarse) side of a hanging interface.
    Unconstrained { neighbor: Option<(CellId, usize)> },
    /// A side of a refined cell facing a coarser active neighbor: governed by
    /// the neighbor through the recorded ancestry.
    Constrained {
        owner: CellId,
        owner_side: usize,
        ancestor: CellId,
        ancestral_side: usize,
        branch: RefinementBranch,
    },
}

#[derive(Debug)]
pub struct GlobalDofAssignment {
    global_dof_count: usize,
    maps: FxHashMap<CellId, LocalGlobalMap>,
    use_static_condensation: bool,
}

impl DofInterpreter for GlobalDofAssignment {
    fn global_dof_count(&self) -> usize {
        self.global_dof_count
    }

    fn local_from_global(&self, cell: CellId) -> &LocalGlobalMap {
        self.maps.get(&cell).expect("cell is active in the interpreted mesh")
    }
}

impl GlobalDofAssignment {
    pub fn use_static_condensation(&self) -> bool {
        self.use_static_condensation
    }

    /// Builds the minimum-rule assignment for the mesh's current state. The
    /// reconciliation engine supplies the constrained weights for hanging and
    /// p-enriched sides.
    pub fn new(
        mesh: &Mesh,
        reconciliation: &mut BasisReconciliation,
        use_static_condensation: bool,
    ) -> GlobalDofAssignment {
        let statuses = classify_sides(mesh);
        let mut builder = Builder {
            mesh,
            statuses,
            next_global: 0,
            field_blocks: FxHashMap::default(),
            locations: FxHashMap::default(),
            use_static_condensation,
        };
        builder.register_global_dofs();
        let maps = builder.build_maps(reconciliation);
        GlobalDofAssignment {
            global_dof_count: builder.next_global,
            maps,
            use_static_condensation,
        }
    }
}

/// Quantized physical coordinates, the identity of a nodal dof location. The
/// grid is far coarser than evaluation roundoff and far finer than any node
/// spacing.
fn point_key(coords: &[f64]) -> Vec<i64> {
    coords.iter().map(|&x| (x * 1e9).round() as i64).collect()
}

fn classify_sides(mesh: &Mesh) -> FxHashMap<(CellId, usize), SideStatus> {
    let mut by_key: FxHashMap<Vec<usize>, Vec<(CellId, usize)>> = FxHashMap::default();
    for &cell in mesh.active_cells() {
        for side in 0..mesh.cell(cell).topology.side_count() {
            by_key.entry(mesh.side_key(cell, side)).or_default().push((cell, side));
        }
    }

    let mut statuses = FxHashMap::default();
    for &cell in mesh.active_cells() {
        for side in 0..mesh.cell(cell).topology.side_count() {
            let entries = &by_key[&mesh.side_key(cell, side)];
            let status = if let Some(&neighbor) = entries.iter().find(|&&(c, _)| c != cell) {
                SideStatus::Unconstrained { neighbor: Some(neighbor) }
            } else {
                constrained_status(mesh, &by_key, cell, side)
            };
            statuses.insert((cell, side), status);
        }
    }
    statuses
}

/// Walks the ancestry of `(cell, side)` looking for an active cell whose side
/// geometrically contains it; absent one, the side is unconstrained (mesh
/// boundary, or itself the governing side of finer neighbors).
fn constrained_status(
    mesh: &Mesh,
    by_key: &FxHashMap<Vec<usize>, Vec<(CellId, usize)>>,
    cell: CellId,
    side: usize,
) -> SideStatus {
    let mut current = cell;
    let mut current_side = side;
    let mut steps = Vec::new();
    loop {
        let record = mesh.cell(current);
        let (Some(parent), Some((pattern, child_index))) = (record.parent, record.birth) else {
            return SideStatus::Unconstrained { neighbor: None };
        };
        let parent_side = (0..pattern.parent_topology().side_count()).find(|&s| {
            pattern.children_for_side(s).contains(&(child_index, current_side))
        });
        let Some(parent_side) = parent_side else {
            // interior to the parent: cannot be governed from outside
            return SideStatus::Unconstrained { neighbor: None };
        };
        steps.push((pattern, child_index));
        if let Some(entries) = by_key.get(&mesh.side_key(parent, parent_side)) {
            if let Some(&(owner, owner_side)) = entries.iter().find(|&&(c, _)| c != cell) {
                steps.reverse();
                return SideStatus::Constrained {
                    owner,
                    owner_side,
                    ancestor: parent,
                    ancestral_side: parent_side,
                    branch: RefinementBranch::from_steps(steps),
                };
            }
        }
        current = parent;
        current_side = parent_side;
    }
}

struct Builder<'a> {
    mesh: &'a Mesh,
    statuses: FxHashMap<(CellId, usize), SideStatus>,
    next_global: usize,
    /// (cell, var id) -> first global dof of the cell's field block.
    field_blocks: FxHashMap<(CellId, usize), usize>,
    /// var id -> dof location -> global dof.
    locations: FxHashMap<usize, FxHashMap<Vec<i64>, usize>>,
    use_static_condensation: bool,
}

impl<'a> Builder<'a> {
    /// Whether this cell is the minimum-rule owner of the side's skeleton
    /// entity: the side is unconstrained and either has no neighbor or wins the
    /// (order, cell id) tie-break against it.
    fn owns_side(&self, cell: CellId, side: usize) -> bool {
        match &self.statuses[&(cell, side)] {
            SideStatus::Constrained { .. } => false,
            SideStatus::Unconstrained { neighbor: None } => true,
            SideStatus::Unconstrained { neighbor: Some((other, _)) } => {
                let own = self.mesh.element_type(cell).h1_order();
                let theirs = self.mesh.element_type(*other).h1_order();
                (own, cell) < (theirs, *other)
            }
        }
    }

    /// The cell governing the side's global dofs (the minimum-rule owner).
    fn side_owner(&self, cell: CellId, side: usize) -> (CellId, usize) {
        match &self.statuses[&(cell, side)] {
            SideStatus::Constrained { owner, owner_side, .. } => (*owner, *owner_side),
            SideStatus::Unconstrained { neighbor } => match neighbor {
                Some((other, other_side)) if !self.owns_side(cell, side) => (*other, *other_side),
                _ => (cell, side),
            },
        }
    }

    fn side_dof_locations(&self, cell: CellId, side: usize, var: &TrialVar) -> Vec<(usize, Vec<i64>)> {
        let d = self.mesh.dimension();
        let min_dim = match var.kind {
            VarKind::Trace => 0,
            VarKind::Flux => d - 1,
            VarKind::Field => unreachable!("field variables have no side dofs"),
        };
        let geometry = self.mesh.cell_geometry(cell);
        let ordinals = var.basis.dof_ordinals_for_subcell(d - 1, side, min_dim);
        let node_points = var.basis.node_points();
        ordinals
            .into_iter()
            .map(|ordinal| {
                let mut reference = DMatrix::zeros(1, node_points.ncols());
                reference.row_mut(0).copy_from(&node_points.row(ordinal));
                let physical = geometry.map_points(&reference);
                let coords: Vec<f64> = physical.row(0).iter().copied().collect();
                (ordinal, point_key(&coords))
            })
            .collect()
    }

    fn register_global_dofs(&mut self) {
        let mesh = self.mesh;
        for &cell in mesh.active_cells() {
            let element_type = mesh.element_type(cell).clone();
            for var in element_type.vars() {
                match var.kind {
                    VarKind::Field => {
                        if !self.use_static_condensation {
                            self.field_blocks.insert((cell, var.id), self.next_global);
                            self.next_global += var.local_dof_count();
                        }
                    }
                    VarKind::Trace | VarKind::Flux => {
                        for side in 0..mesh.cell(cell).topology.side_count() {
                            if !self.owns_side(cell, side) {
                                continue;
                            }
                            for (_, key) in self.side_dof_locations(cell, side, var) {
                                let next = &mut self.next_global;
                                self.locations
                                    .entry(var.id)
                                    .or_default()
                                    .entry(key)
                                    .or_insert_with(|| {
                                        let g = *next;
                                        *next += 1;
                                        g
                                    });
                            }
                        }
                    }
                }
            }
        }
    }

    fn build_maps(&self, reconciliation: &mut BasisReconciliation) -> FxHashMap<CellId, LocalGlobalMap> {
        let mut maps = FxHashMap::default();
        for &cell in self.mesh.active_cells() {
            maps.insert(cell, self.build_cell_map(cell, reconciliation));
        }
        maps
    }

    fn build_cell_map(&self, cell: CellId, reconciliation: &mut BasisReconciliation) -> LocalGlobalMap {
        let mesh = self.mesh;
        let element_type = mesh.element_type(cell).clone();
        let mut rows: Vec<Option<Vec<(usize, f64)>>> = vec![None; element_type.local_dof_count()];

        for var in element_type.vars() {
            match var.kind {
                VarKind::Field => {
                    if let Some(&block) = self.field_blocks.get(&(cell, var.id)) {
                        for i in 0..var.local_dof_count() {
                            rows[var.local_offset() + i] = Some(vec![(block + i, 1.0)]);
                        }
                    } else {
                        // condensed away: local dofs exist, global dofs do not
                        for i in 0..var.local_dof_count() {
                            rows[var.local_offset() + i] = Some(Vec::new());
                        }
                    }
                }
                VarKind::Trace | VarKind::Flux => {
                    self.fill_side_var_rows(cell, var, reconciliation, &mut rows);
                }
            }
        }

        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(local, row)| {
                row.unwrap_or_else(|| {
                    panic!("local dof {} of cell {} was never interpreted", local, cell)
                })
            })
            .collect();
        LocalGlobalMap { rows }
    }

    fn fill_side_var_rows(
        &self,
        cell: CellId,
        var: &TrialVar,
        reconciliation: &mut BasisReconciliation,
        rows: &mut [Option<Vec<(usize, f64)>>],
    ) {
        let mesh = self.mesh;
        let num_sides = mesh.cell(cell).topology.side_count();
        let var_locations = &self.locations[&var.id];

        // First pass: exact matches against owned dof locations. A nodal dof is
        // its support point's value, so coinciding locations mean coinciding
        // dofs, regardless of which side of the interface enumerated them.
        for side in 0..num_sides {
            let sign = self.flux_parity(cell, side, var.kind);
            for (ordinal, key) in self.side_dof_locations(cell, side, var) {
                let local = var
                    .local_index_of_ordinal(ordinal)
                    .expect("side dofs participate in the local ordering");
                if rows[local].is_some() {
                    continue;
                }
                if let Some(&global) = var_locations.get(&key) {
                    rows[local] = Some(vec![(global, sign)]);
                }
            }
        }

        // Second pass: constrained sides, expressed through reconciliation
        // weights against the owning side's basis.
        for side in 0..num_sides {
            let (owner, owner_side) = self.side_owner(cell, side);
            if owner == cell {
                continue;
            }
            let owner_var = mesh
                .element_type(owner)
                .var_with_id(var.id)
                .expect("adjacent element types carry the same trial variables")
                .clone();
            let sign = self.flux_parity(cell, side, var.kind);
            let weights = match &self.statuses[&(cell, side)] {
                SideStatus::Unconstrained { .. } => {
                    let permutation = vertex_permutation(
                        mesh.cell(cell).topology,
                        side,
                        &mesh.cell_nodes(cell),
                        mesh.cell(owner).topology,
                        owner_side,
                        &mesh.cell_nodes(owner),
                    );
                    reconciliation
                        .constrained_weights_for_side(
                            &var.basis,
                            side,
                            &owner_var.basis,
                            owner_side,
                            permutation,
                        )
                        .clone()
                }
                SideStatus::Constrained { ancestor, ancestral_side, branch, .. } => {
                    let permutation = vertex_permutation(
                        mesh.cell(*ancestor).topology,
                        *ancestral_side,
                        &mesh.cell_nodes(*ancestor),
                        mesh.cell(owner).topology,
                        owner_side,
                        &mesh.cell_nodes(owner),
                    );
                    reconciliation
                        .constrained_weights_for_refined_side(
                            &var.basis,
                            *ancestral_side,
                            branch,
                            &owner_var.basis,
                            owner_side,
                            permutation,
                        )
                        .clone()
                }
            };

            // the owner's side dofs are location-owned; resolve their globals
            let owner_locations = self.side_dof_locations(owner, owner_side, &owner_var);
            let owner_globals: FxHashMap<usize, usize> = owner_locations
                .into_iter()
                .map(|(ordinal, key)| (ordinal, var_locations[&key]))
                .collect();

            for (i, &fine_ordinal) in weights.fine_ordinals.iter().enumerate() {
                let local = var
                    .local_index_of_ordinal(fine_ordinal)
                    .expect("side dofs participate in the local ordering");
                if rows[local].is_some() {
                    continue;
                }
                let mut row = Vec::new();
                for (j, &coarse_ordinal) in weights.coarse_ordinals.iter().enumerate() {
                    let weight = weights.weights[(i, j)];
                    if weight.abs() > 1e-14 {
                        row.push((owner_globals[&coarse_ordinal], sign * weight));
                    }
                }
                rows[local] = Some(row);
            }
        }
    }

    /// The sign relating this cell's local coefficient to the side entity's
    /// global dof: -1 for flux dofs seen from the non-owning cell (whose outward
    /// normal opposes the owner's), +1 otherwise.
    fn flux_parity(&self, cell: CellId, side: usize, kind: VarKind) -> f64 {
        match kind {
            VarKind::Flux if self.side_owner(cell, side).0 != cell => -1.0,
            _ => 1.0,
        }
    }
}

/// Gathers per-cell local coefficient vectors into a global vector through the
/// fitted (unconstrained) dofs. Shared dofs are written by every adjacent cell;
/// consistent local data makes the writes agree.
pub fn gather_global_from_local(
    mesh: &Mesh,
    interpreter: &impl DofInterpreter,
    local_coefficients: &FxHashMap<CellId, DVector<f64>>,
) -> DVector<f64> {
    let mut global = DVector::zeros(interpreter.global_dof_count());
    for &cell in mesh.active_cells() {
        let map = interpreter.local_from_global(cell);
        let local = &local_coefficients[&cell];
        for i in 0..map.local_dof_count() {
            if let Some((g, sign)) = map.fitted_global(i) {
                global[g] = sign * local[i];
            }
        }
    }
    global
}

/// A dense materialization of a cell's constraint matrix, mostly useful in
/// tests.
pub fn local_from_global_matrix(map: &LocalGlobalMap, global_dof_count: usize) -> DMatrix<f64> {
    let mut matrix = DMatrix::zeros(map.local_dof_count(), global_dof_count);
    for i in 0..map.local_dof_count() {
        for &(g, w) in map.row(i) {
            matrix[(i, g)] = w;
        }
    }
    matrix
}
