pub mod archive;
pub mod artifact_cache;
pub mod error;
pub mod history;
pub mod installed_db;

pub use artifact_cache::{ArtifactCache, ArtifactMetadata, EvictionPolicy, NoRemoteStore, RemoteArtifactStore};
pub use error::{Error, Result};
pub use history::{Action, HistoryEvent, HistoryLog};
pub use installed_db::{InstalledDb, InstalledRecord};
