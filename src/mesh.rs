//! A compact hp-mesh: cells with refinement ancestry, and the trial-variable
//! element types living on them.
//!
//! The mesh keeps the full refinement tree (inactive ancestors included), since
//! reconciliation and prolongation both walk ancestry chains. New vertices
//! created by refinement are deduplicated through labels (edge midpoints and
//! cell centers keyed by their defining vertex ids), so a hanging vertex is
//! shared when the neighbor refines later.

use crate::basis::{Basis, BasisRc};
use crate::geometry::CellGeometry;
use crate::refinement::{RefinementBranch, RefinementPattern};
use crate::topology::CellTopology;
use nalgebra::DMatrix;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

pub type CellId = usize;

/// The role a trial variable plays in a DPG system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarKind {
    /// A volume ("field") variable, discontinuous across cells.
    Field,
    /// A conforming trace variable: the restriction of an H1 volume basis to the
    /// cell boundary.
    Trace,
    /// A normal-flux variable on the mesh skeleton, single-valued up to parity.
    Flux,
}

/// Declarative description of one trial variable; element types instantiate the
/// concrete bases from these at their own polynomial order.
#[derive(Debug, Clone)]
pub struct VarSpec {
    /// Stable identity used to match variables across meshes and element types.
    pub id: usize,
    pub name: &'static str,
    pub kind: VarKind,
    /// Basis degree relative to the element type's H1 order.
    pub degree_offset: i32,
    /// Vector-valued with one component per space dimension (ignored in 1D).
    pub vector: bool,
    /// For trace/flux variables: the id of the field variable they trace.
    pub traced_field: Option<usize>,
}

/// A trial variable instantiated at a concrete polynomial order.
#[derive(Debug, Clone)]
pub struct TrialVar {
    pub id: usize,
    pub name: &'static str,
    pub kind: VarKind,
    pub basis: BasisRc,
    pub traced_field: Option<usize>,
    local_offset: usize,
    /// Basis ordinals carrying local dofs, in local order. All ordinals for
    /// field and flux variables; the boundary-associated ordinals for traces.
    local_ordinals: Vec<usize>,
}

impl TrialVar {
    /// Number of local dofs the variable contributes to a cell.
    pub fn local_dof_count(&self) -> usize {
        self.local_ordinals.len()
    }

    /// The cell-local dof index of the `i`-th participating basis ordinal.
    pub fn local_offset(&self) -> usize {
        self.local_offset
    }

    pub fn local_ordinals(&self) -> &[usize] {
        &self.local_ordinals
    }

    /// Cell-local dof index for a basis ordinal, if the ordinal carries one.
    pub fn local_index_of_ordinal(&self, ordinal: usize) -> Option<usize> {
        self.local_ordinals.iter().position(|&o| o == ordinal).map(|i| self.local_offset + i)
    }
}

/// The trial-variable layout shared by all cells of one shape and order.
#[derive(Debug)]
pub struct ElementType {
    topology: CellTopology,
    h1_order: usize,
    vars: Vec<TrialVar>,
    specs: Vec<VarSpec>,
    local_dof_count: usize,
}

impl ElementType {
    pub fn new(topology: CellTopology, h1_order: usize, specs: Vec<VarSpec>) -> Arc<ElementType> {
        assert!(h1_order >= 1, "H1 order must be at least one");
        let d = topology.dimension();
        let mut vars = Vec::with_capacity(specs.len());
        let mut offset = 0;
        for spec in &specs {
            let degree = (h1_order as i32 + spec.degree_offset).max(0) as usize;
            let basis = match spec.kind {
                VarKind::Field => {
                    let scalar = Basis::h_vol(topology, degree);
                    if spec.vector && d > 1 {
                        Basis::vectorized(&scalar, d)
                    } else {
                        scalar
                    }
                }
                VarKind::Trace => Basis::h_grad(topology, degree.max(1)),
                VarKind::Flux => Basis::flux(topology, degree),
            };
            let local_ordinals: Vec<usize> = match spec.kind {
                VarKind::Field | VarKind::Flux => (0..basis.cardinality()).collect(),
                // a conforming trace keeps only the boundary dofs of its H1 basis
                VarKind::Trace => (0..basis.cardinality())
                    .filter(|&dof| basis.dof_subcell(dof).0 < d)
                    .collect(),
            };
            let count = local_ordinals.len();
            vars.push(TrialVar {
                id: spec.id,
                name: spec.name,
                kind: spec.kind,
                basis,
                traced_field: spec.traced_field,
                local_offset: offset,
                local_ordinals,
            });
            offset += count;
        }
        Arc::new(ElementType { topology, h1_order, vars, specs, local_dof_count: offset })
    }

    /// The standard DPG Poisson trial system: a scalar field, its gradient
    /// field, a conforming value trace and a normal-flux trace.
    pub fn poisson(topology: CellTopology, h1_order: usize) -> Arc<ElementType> {
        ElementType::new(
            topology,
            h1_order,
            vec![
                VarSpec {
                    id: 0,
                    name: "phi",
                    kind: VarKind::Field,
                    degree_offset: -1,
                    vector: false,
                    traced_field: None,
                },
                VarSpec {
                    id: 1,
                    name: "psi",
                    kind: VarKind::Field,
                    degree_offset: -1,
                    vector: true,
                    traced_field: None,
                },
                VarSpec {
                    id: 2,
                    name: "phi_hat",
                    kind: VarKind::Trace,
                    degree_offset: 0,
                    vector: false,
                    traced_field: Some(0),
                },
                VarSpec {
                    id: 3,
                    name: "psi_n_hat",
                    kind: VarKind::Flux,
                    degree_offset: -1,
                    vector: false,
                    traced_field: Some(1),
                },
            ],
        )
    }

    /// The same element type one polynomial order higher.
    pub fn p_refined(&self) -> Arc<ElementType> {
        ElementType::new(self.topology, self.h1_order + 1, self.specs.clone())
    }

    pub fn topology(&self) -> CellTopology {
        self.topology
    }

    pub fn h1_order(&self) -> usize {
        self.h1_order
    }

    pub fn vars(&self) -> &[TrialVar] {
        &self.vars
    }

    pub fn var_with_id(&self, id: usize) -> Option<&TrialVar> {
        self.vars.iter().find(|v| v.id == id)
    }

    pub fn local_dof_count(&self) -> usize {
        self.local_dof_count
    }
}

#[derive(Debug, Clone)]
pub struct Cell {
    pub id: CellId,
    pub topology: CellTopology,
    /// Vertex ids in the topology's node order.
    pub vertices: Vec<usize>,
    pub parent: Option<CellId>,
    /// The refinement pattern and child index that created this cell.
    pub birth: Option<(RefinementPattern, usize)>,
    pub children: Vec<CellId>,
}

/// Vertex identity labels for refinement-created vertices; keyed by the defining
/// vertex ids so neighboring refinements share midpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum VertexLabel {
    Midpoint(usize, usize),
    Center([usize; 4]),
}

#[derive(Debug, Clone)]
pub struct Mesh {
    dimension: usize,
    cells: Vec<Cell>,
    vertex_coordinates: Vec<Vec<f64>>,
    active_cells: BTreeSet<CellId>,
    element_types: Vec<Arc<ElementType>>,
    vertex_labels: FxHashMap<VertexLabel, usize>,
}

impl Mesh {
    /// A 1D mesh of `num_cells` equal intervals spanning `[x_left, x_right]`.
    pub fn interval(
        x_left: f64,
        x_right: f64,
        num_cells: usize,
        element_type: &Arc<ElementType>,
    ) -> Mesh {
        assert!(num_cells > 0);
        assert!(x_right > x_left);
        assert_eq!(element_type.topology(), CellTopology::line());
        let h = (x_right - x_left) / num_cells as f64;
        let vertex_coordinates: Vec<Vec<f64>> =
            (0..=num_cells).map(|i| vec![x_left + h * i as f64]).collect();
        let cells: Vec<Cell> = (0..num_cells)
            .map(|i| Cell {
                id: i,
                topology: CellTopology::line(),
                vertices: vec![i, i + 1],
                parent: None,
                birth: None,
                children: Vec::new(),
            })
            .collect();
        Mesh {
            dimension: 1,
            active_cells: (0..num_cells).collect(),
            element_types: vec![element_type.clone(); num_cells],
            cells,
            vertex_coordinates,
            vertex_labels: FxHashMap::default(),
        }
    }

    /// A 2D mesh of `counts[0] x counts[1]` axis-aligned quads covering a
    /// rectangle of the given dimensions anchored at the origin.
    pub fn rectilinear(
        dimensions: [f64; 2],
        counts: [usize; 2],
        element_type: &Arc<ElementType>,
    ) -> Mesh {
        let [nx, ny] = counts;
        assert!(nx > 0 && ny > 0);
        assert_eq!(element_type.topology(), CellTopology::quad());
        let hx = dimensions[0] / nx as f64;
        let hy = dimensions[1] / ny as f64;
        let mut vertex_coordinates = Vec::with_capacity((nx + 1) * (ny + 1));
        for j in 0..=ny {
            for i in 0..=nx {
                vertex_coordinates.push(vec![hx * i as f64, hy * j as f64]);
            }
        }
        let vid = |i: usize, j: usize| j * (nx + 1) + i;
        let mut cells = Vec::with_capacity(nx * ny);
        for j in 0..ny {
            for i in 0..nx {
                cells.push(Cell {
                    id: cells.len(),
                    topology: CellTopology::quad(),
                    vertices: vec![vid(i, j), vid(i + 1, j), vid(i + 1, j + 1), vid(i, j + 1)],
                    parent: None,
                    birth: None,
                    children: Vec::new(),
                });
            }
        }
        Mesh {
            dimension: 2,
            active_cells: (0..nx * ny).collect(),
            element_types: vec![element_type.clone(); nx * ny],
            cells,
            vertex_coordinates,
            vertex_labels: FxHashMap::default(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id]
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn active_cells(&self) -> &BTreeSet<CellId> {
        &self.active_cells
    }

    pub fn is_active(&self, id: CellId) -> bool {
        self.active_cells.contains(&id)
    }

    pub fn element_type(&self, id: CellId) -> &Arc<ElementType> {
        &self.element_types[id]
    }

    pub fn vertex(&self, id: usize) -> &[f64] {
        &self.vertex_coordinates[id]
    }

    /// Physical coordinates of the cell's vertices, one row per topology node.
    pub fn cell_nodes(&self, id: CellId) -> DMatrix<f64> {
        let cell = &self.cells[id];
        let mut nodes = DMatrix::zeros(cell.vertices.len(), self.dimension);
        for (row, &v) in cell.vertices.iter().enumerate() {
            for k in 0..self.dimension {
                nodes[(row, k)] = self.vertex_coordinates[v][k];
            }
        }
        nodes
    }

    pub fn cell_geometry(&self, id: CellId) -> CellGeometry {
        CellGeometry::new(self.cells[id].topology, self.cell_nodes(id))
    }

    /// Sorted vertex ids of a cell side, the key identifying the geometric side
    /// entity regardless of orientation.
    pub fn side_key(&self, id: CellId, side: usize) -> Vec<usize> {
        let cell = &self.cells[id];
        let mut key: Vec<usize> = cell
            .topology
            .subcell_nodes(cell.topology.dimension() - 1, side)
            .iter()
            .map(|&n| cell.vertices[n])
            .collect();
        key.sort_unstable();
        key
    }

    /// Outward unit normal of a cell side. Sides of the supported cell shapes
    /// are straight, so the normal is constant along the side.
    pub fn side_outward_normal(&self, id: CellId, side: usize) -> Vec<f64> {
        let cell = &self.cells[id];
        match self.dimension {
            1 => vec![if side == 0 { -1.0 } else { 1.0 }],
            2 => {
                let topo = cell.topology;
                let a = cell.vertices[topo.side_node(side, 0)];
                let b = cell.vertices[topo.side_node(side, 1)];
                let (ax, ay) = (self.vertex_coordinates[a][0], self.vertex_coordinates[a][1]);
                let (bx, by) = (self.vertex_coordinates[b][0], self.vertex_coordinates[b][1]);
                let (tx, ty) = (bx - ax, by - ay);
                let len = (tx * tx + ty * ty).sqrt();
                // counterclockwise cells put the outward normal to the right of
                // the side direction
                vec![ty / len, -tx / len]
            }
            d => panic!("no normal computation for dimension {}", d),
        }
    }

    /// h-refines every listed cell with its topology's isotropic pattern.
    ///
    /// # Panics
    ///
    /// Panics if a listed cell is not active.
    pub fn h_refine(&mut self, ids: &BTreeSet<CellId>) {
        for &id in ids {
            assert!(self.active_cells.contains(&id), "cannot h-refine inactive cell {}", id);
            let topology = self.cells[id].topology;
            let pattern = RefinementPattern::isotropic(topology);
            let child_vertices = self.child_vertex_ids(id, pattern);
            let element_type = self.element_types[id].clone();
            let mut child_ids = Vec::with_capacity(child_vertices.len());
            for (child_index, vertices) in child_vertices.into_iter().enumerate() {
                let child_id = self.cells.len();
                self.cells.push(Cell {
                    id: child_id,
                    topology,
                    vertices,
                    parent: Some(id),
                    birth: Some((pattern, child_index)),
                    children: Vec::new(),
                });
                self.element_types.push(element_type.clone());
                child_ids.push(child_id);
            }
            self.cells[id].children = child_ids.clone();
            self.active_cells.remove(&id);
            self.active_cells.extend(child_ids);
        }
    }

    /// p-refines every listed cell: bumps its element type one order.
    pub fn p_refine(&mut self, ids: &BTreeSet<CellId>) {
        for &id in ids {
            assert!(self.active_cells.contains(&id), "cannot p-refine inactive cell {}", id);
            self.element_types[id] = self.element_types[id].p_refined();
        }
    }

    /// An independent copy sharing nothing mutable with `self`; refinements of
    /// the copy leave the original untouched. Cell ids remain comparable across
    /// the copy and the original, which is what lets a multigrid level pair
    /// relate its meshes.
    pub fn deep_copy(&self) -> Mesh {
        self.clone()
    }

    /// The chain of refinement steps leading from `ancestor` down to
    /// `descendant`, or `None` if `ancestor` is not on `descendant`'s ancestry
    /// path. The empty branch relates a cell to itself.
    pub fn refinement_branch(&self, descendant: CellId, ancestor: CellId) -> Option<RefinementBranch> {
        let mut steps = Vec::new();
        let mut current = descendant;
        while current != ancestor {
            let cell = &self.cells[current];
            let (pattern, child_index) = cell.birth?;
            steps.push((pattern, child_index));
            current = cell.parent?;
        }
        steps.reverse();
        Some(RefinementBranch::from_steps(steps))
    }

    fn child_vertex_ids(&mut self, id: CellId, pattern: RefinementPattern) -> Vec<Vec<usize>> {
        let vertices = self.cells[id].vertices.clone();
        match pattern {
            RefinementPattern::LineHalving => {
                let [a, b] = [vertices[0], vertices[1]];
                let m = self.midpoint_vertex(a, b);
                vec![vec![a, m], vec![m, b]]
            }
            RefinementPattern::QuadQuartering => {
                let [v0, v1, v2, v3] = [vertices[0], vertices[1], vertices[2], vertices[3]];
                let m01 = self.midpoint_vertex(v0, v1);
                let m12 = self.midpoint_vertex(v1, v2);
                let m23 = self.midpoint_vertex(v2, v3);
                let m30 = self.midpoint_vertex(v3, v0);
                let c = self.center_vertex([v0, v1, v2, v3]);
                vec![
                    vec![v0, m01, c, m30],
                    vec![m01, v1, m12, c],
                    vec![c, m12, v2, m23],
                    vec![m30, c, m23, v3],
                ]
            }
            RefinementPattern::Null(_) => panic!("null pattern does not refine"),
        }
    }

    fn midpoint_vertex(&mut self, a: usize, b: usize) -> usize {
        let label = VertexLabel::Midpoint(a.min(b), a.max(b));
        if let Some(&v) = self.vertex_labels.get(&label) {
            return v;
        }
        let coords: Vec<f64> = (0..self.dimension)
            .map(|k| 0.5 * (self.vertex_coordinates[a][k] + self.vertex_coordinates[b][k]))
            .collect();
        let v = self.vertex_coordinates.len();
        self.vertex_coordinates.push(coords);
        self.vertex_labels.insert(label, v);
        v
    }

    fn center_vertex(&mut self, mut ids: [usize; 4]) -> usize {
        ids.sort_unstable();
        let label = VertexLabel::Center(ids);
        if let Some(&v) = self.vertex_labels.get(&label) {
            return v;
        }
        let coords: Vec<f64> = (0..self.dimension)
            .map(|k| ids.iter().map(|&i| self.vertex_coordinates[i][k]).sum::<f64>() / 4.0)
            .collect();
        let v = self.vertex_coordinates.len();
        self.vertex_coordinates.push(coords);
        self.vertex_labels.insert(label, v);
        v
    }
}
