use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Simulation errors. All of these are fatal at the system boundary; there is
/// no per-tick recovery.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("dependency cycle among tasks: {tasks:?}")]
    Scheduling { tasks: Vec<String> },

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("singular system matrix for switch state {key:#x}")]
    SingularMatrix { key: u64 },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed csv input: {0}")]
    Csv(#[from] csv::Error),
}
