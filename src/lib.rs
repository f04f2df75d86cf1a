//! Dynamic power-system simulation built on Modified Nodal Analysis and a
//! task-graph scheduler.
//!
//! A simulation step is a DAG of per-component tasks resolved from attribute
//! read/write declarations, level-scheduled and executed sequentially,
//! thread-parallel or rank-parallel. The MNA solver precomputes one LU
//! factorization per switch-state key; partitioned subsystems are coupled by
//! traveling-wave decoupling lines whose ring-buffer tails are exchanged over
//! a broadcast fabric every tick.

pub mod attribute;
pub mod components;
pub mod error;
pub mod io;
pub mod scheduler;
pub mod simulation;
pub mod solver;
pub mod system;
pub mod testcases;
pub mod transport;

pub mod prelude {
    pub use crate::attribute::{Attr, AttributeArena, AttributeId};
    pub use crate::components::decoupling_line::DecouplingLine;
    pub use crate::components::node::{PhaseType, SimNode};
    pub use crate::components::{
        Behaviour, HarmonicComponent, MnaComponent, SignalComponent, SwitchComponent,
    };
    pub use crate::error::{Error, Result};
    pub use crate::scheduler::distributed::DistributedScheduler;
    pub use crate::scheduler::parallel::ThreadPoolScheduler;
    pub use crate::scheduler::sequential::SequentialScheduler;
    pub use crate::scheduler::{resolve_dependencies, Scheduler, Task, TaskList};
    pub use crate::simulation::Simulation;
    pub use crate::solver::scalar::{Domain, MnaScalar};
    pub use crate::solver::{MnaSolver, SwitchKey, SWITCH_NUM};
    pub use crate::system::SystemTopology;
    pub use crate::transport::{LocalFabric, Transport};
}
