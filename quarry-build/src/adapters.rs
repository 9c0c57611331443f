//! Build-system adapters: the command sequence run for each
//! recognized build-system tag.

use std::path::{Path, PathBuf};

use quarry_recipe::BuildSystem;

/// One step of a build-system's command sequence: an argv, an optional
/// working directory relative to the source tree, and whether `DESTDIR`
/// should be pointed at the sandbox for this step.
#[derive(Debug, Clone)]
pub struct Step {
    pub argv: Vec<String>,
    pub relative_cwd: Option<PathBuf>,
    pub needs_destdir: bool,
}

fn step(argv: &[&str]) -> Step {
    Step {
        argv: argv.iter().map(|s| s.to_string()).collect(),
        relative_cwd: None,
        needs_destdir: false,
    }
}

fn step_in(argv: &[&str], cwd: &str) -> Step {
    Step {
        argv: argv.iter().map(|s| s.to_string()).collect(),
        relative_cwd: Some(PathBuf::from(cwd)),
        needs_destdir: false,
    }
}

fn install_step(argv: &[&str]) -> Step {
    Step {
        argv: argv.iter().map(|s| s.to_string()).collect(),
        relative_cwd: None,
        needs_destdir: true,
    }
}

fn install_step_in(argv: &[&str], cwd: &str) -> Step {
    Step {
        argv: argv.iter().map(|s| s.to_string()).collect(),
        relative_cwd: Some(PathBuf::from(cwd)),
        needs_destdir: true,
    }
}

/// The command sequence for `system`, given the source directory (used only
/// to probe for an optional `./configure` under `make`).
pub fn command_sequence(system: BuildSystem, source_dir: &Path, node_script: Option<&str>) -> Vec<Step> {
    match system {
        BuildSystem::Cmake => vec![
            step_in(&["cmake", ".."], "build"),
            step_in(&["make", "-j"], "build"),
            install_step_in(&["make", "install"], "build"),
        ],
        BuildSystem::Meson => vec![
            step(&["meson", "build", "."]),
            step_in(&["ninja"], "build"),
            install_step_in(&["ninja", "install"], "build"),
        ],
        BuildSystem::Autotools => vec![
            step(&["./configure"]),
            step(&["make", "-j"]),
            install_step(&["make", "install"]),
        ],
        BuildSystem::Ninja => vec![step(&["ninja"]), install_step(&["ninja", "install"])],
        BuildSystem::Python => vec![
            step(&["pip", "wheel", ".", "-w", "build"]),
            install_step(&["python3", "setup.py", "install", "--root=."]),
        ],
        BuildSystem::Cargo => vec![step(&["cargo", "build", "--release"])],
        BuildSystem::Node => {
            let mut steps = vec![step(&["npm", "install"])];
            if let Some(script) = node_script {
                steps.push(step(&["npm", "run", script]));
            }
            steps
        }
        BuildSystem::Make => {
            let mut steps = Vec::new();
            if source_dir.join("configure").exists() {
                steps.push(step(&["./configure"]));
            }
            steps.push(step(&["make", "-j"]));
            steps.push(install_step(&["make", "install"]));
            steps
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cargo_sequence_is_single_step() {
        let steps = command_sequence(BuildSystem::Cargo, Path::new("."), None);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].argv, vec!["cargo", "build", "--release"]);
    }

    #[test]
    fn cmake_sequence_has_three_steps_with_destdir_install() {
        let steps = command_sequence(BuildSystem::Cmake, Path::new("."), None);
        assert_eq!(steps.len(), 3);
        assert!(steps[2].needs_destdir);
    }

    #[test]
    fn make_detects_optional_configure() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("configure"), "#!/bin/sh\n").unwrap();
        let steps = command_sequence(BuildSystem::Make, dir.path(), None);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].argv[0], "./configure");
    }

    #[test]
    fn make_without_configure_skips_it() {
        let dir = tempdir().unwrap();
        let steps = command_sequence(BuildSystem::Make, dir.path(), None);
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn node_includes_script_when_given() {
        let steps = command_sequence(BuildSystem::Node, Path::new("."), Some("build"));
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].argv, vec!["npm", "run", "build"]);
    }
}
