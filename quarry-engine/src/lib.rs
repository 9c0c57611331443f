//! Resolver & scheduler, transactional installer, remover, and upgrade
//! orchestrator: the top-level components that turn a set of requested
//! packages into an ordered, concurrent sequence of build and install
//! operations against the Installed Database.

pub mod error;
pub mod graph;
pub mod installer;
pub mod remover;
pub mod resolver;
pub mod upgrade;

pub use error::{Error, Result};
pub use graph::{DependencyGraph, PkgId};
pub use installer::{install, InstallerConfig};
pub use remover::{remove, RemoverConfig};
pub use resolver::{DependencyMode, Plan, ResolveOptions, Resolver};
pub use upgrade::{run as run_upgrade, PackageOutcome, UpgradeCandidate, UpgradeConfig, UpgradeReport};
