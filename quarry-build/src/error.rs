use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("quota exceeded: {used} bytes over {limit} byte limit")]
    QuotaExceeded { used: u64, limit: u64 },

    #[error("command failed: {command} (exit {exit_code:?})\nstdout: {stdout}\nstderr: {stderr}")]
    Exec {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("command timed out after {0:?}: {1}")]
    Timeout(std::time::Duration, String),

    #[error("hook {stage} failed: {cause}")]
    Hook { stage: String, cause: String },

    #[error("build failed for {package} at stage {stage}: {cause}")]
    Build {
        package: String,
        stage: String,
        cause: String,
    },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("recipe error: {0}")]
    Recipe(#[from] quarry_recipe::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
