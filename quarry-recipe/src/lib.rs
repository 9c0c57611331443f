pub mod cache_db;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod recipe;
pub mod version;

pub use cache_db::IndexCacheDb;
pub use error::{Error, Result};
pub use fingerprint::fingerprint;
pub use index::{IndexEntry, RecipeIndex};
pub use recipe::{BuildSystem, Dependencies, Dependency, Recipe};
pub use version::{compare as compare_versions, Constraint, ConstraintOp};
