mod dof;
mod multigrid;
mod reconciliation;
mod topology;
