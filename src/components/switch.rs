//! Resistive switch.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::attribute::{ArenaRef, Attr};
use crate::components::node::SimNode;
use crate::components::{stamp_admittance, MnaComponent, SwitchComponent};
use crate::solver::scalar::MnaScalar;

/// Two-state switch modeled as a high/low resistance branch. The solver
/// stamps one system matrix per combination of switch states, so toggling at
/// runtime only selects a different precomputed factorization.
pub struct Switch<S: MnaScalar> {
    name: String,
    subsystem: usize,
    node1: Arc<SimNode<S>>,
    node2: Arc<SimNode<S>>,
    open_conductance: S,
    closed_conductance: S,
    closed: bool,
    idx1: Option<usize>,
    idx2: Option<usize>,
}

impl<S: MnaScalar> Switch<S> {
    pub fn new(
        name: &str,
        node1: Arc<SimNode<S>>,
        node2: Arc<SimNode<S>>,
        open_resistance: f64,
        closed_resistance: f64,
        _arena: &ArenaRef,
    ) -> Self {
        Self {
            name: name.to_owned(),
            subsystem: 0,
            node1,
            node2,
            open_conductance: S::from_real(1.0 / open_resistance),
            closed_conductance: S::from_real(1.0 / closed_resistance),
            closed: false,
            idx1: None,
            idx2: None,
        }
    }

    pub fn set_subsystem(&mut self, subsystem: usize) {
        self.subsystem = subsystem;
    }

    pub fn set_closed(&mut self, closed: bool) {
        self.closed = closed;
    }
}

impl<S: MnaScalar> MnaComponent<S> for Switch<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn mna_initialize(&mut self, _omega: f64, _dt: f64, _left_vector: Attr<DVector<S>>) {
        self.idx1 = self.node1.matrix_index(0);
        self.idx2 = self.node2.matrix_index(0);
    }

    fn apply_system_matrix_stamp(&self, m: &mut DMatrix<S>) {
        self.apply_switch_system_matrix_stamp(m, self.closed);
    }

    fn tasks(&self) -> crate::scheduler::TaskList {
        Vec::new()
    }
}

impl<S: MnaScalar> SwitchComponent<S> for Switch<S> {
    fn is_closed(&self) -> bool {
        self.closed
    }

    fn apply_switch_system_matrix_stamp(&self, m: &mut DMatrix<S>, closed: bool) {
        let g = if closed {
            self.closed_conductance
        } else {
            self.open_conductance
        };
        stamp_admittance(m, g, self.idx1, self.idx2);
    }
}
