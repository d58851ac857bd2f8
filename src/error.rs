use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Task {task} depends on unknown task {missing}")]
    UnknownDependency { task: String, missing: String },

    #[error("Cyclic dependency between tasks: {}", .ids.join(", "))]
    CyclicDependency { ids: Vec<String> },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid transition for task {id} from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Engine already registered: {name}@{version}")]
    DuplicateEngine { name: String, version: String },

    #[error("Engine not found: {0}")]
    EngineNotFound(String),
}

impl Error {
    /// True for errors detected before any task runs.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::DuplicateTask(_)
                | Error::UnknownDependency { .. }
                | Error::CyclicDependency { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
