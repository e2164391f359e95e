use std::path::PathBuf;

/// Problems with the inputs of a run. Any of these aborts the run before a sample is touched.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("The manifest does not contain any sample ids.")]
    EmptyManifest,

    #[error("The worker pool is empty; at least one running machine is required.")]
    EmptyPool,

    #[error("Worker index {index} is out of range for a pool of {pool_size} machines.")]
    WorkerOutOfRange { index: usize, pool_size: usize },

    #[error("Unable to read the manifest {path:?}")]
    UnreadableManifest {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Host '{host}' is not a member of the worker pool: {}", pool.join(", "))]
    UnknownHost { host: String, pool: Vec<String> },

    #[error("Stage '{stage}' is defined more than once.")]
    DuplicateStage { stage: String },

    #[error("Stages '{first}' and '{second}' would publish into the same directory {dir}.")]
    DuplicateStageDir {
        first: String,
        second: String,
        dir: String,
    },

    #[error("Output '{key}' of stage '{stage}' is already produced by an earlier stage.")]
    DuplicateOutput { stage: String, key: String },

    #[error(
        "Stage '{stage}' consumes '{key}', which is not produced by any earlier stage. \
         Inputs may only reference the resolved reads or outputs of earlier stages."
    )]
    UnknownInput { stage: String, key: String },
}
