//! Recipe model and parsing.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::version::Constraint;

/// Recognized build-system tags. `Unset` triggers auto-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSystem {
    Make,
    Autotools,
    Cmake,
    Meson,
    Ninja,
    Cargo,
    Python,
    Node,
}

impl fmt::Display for BuildSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildSystem::Make => "make",
            BuildSystem::Autotools => "autotools",
            BuildSystem::Cmake => "cmake",
            BuildSystem::Meson => "meson",
            BuildSystem::Ninja => "ninja",
            BuildSystem::Cargo => "cargo",
            BuildSystem::Python => "python",
            BuildSystem::Node => "node",
        };
        write!(f, "{s}")
    }
}

/// A single dependency: a bare name, or a name with a version constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub constraint: Option<Constraint>,
}

impl<'de> Deserialize<'de> for Dependency {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DepVisitor;

        impl<'de> Visitor<'de> for DepVisitor {
            type Value = Dependency;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a dependency name string or a {name, version} map")
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Dependency, E>
            where
                E: de::Error,
            {
                Some(v)
                    .map(parse_inline_name_constraint)
                    .ok_or_else(|| de::Error::custom("empty dependency"))
            }

            fn visit_string<E>(self, v: String) -> std::result::Result<Dependency, E>
            where
                E: de::Error,
            {
                self.visit_str(&v)
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Dependency, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut name: Option<String> = None;
                let mut version: Option<String> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "name" => name = Some(map.next_value()?),
                        "version" | "constraint" => version = Some(map.next_value()?),
                        _ => {
                            let _ = map.next_value::<serde_yaml::Value>()?;
                        }
                    }
                }
                let name = name.ok_or_else(|| de::Error::missing_field("name"))?;
                let constraint = version.as_deref().and_then(Constraint::parse);
                Ok(Dependency { name, constraint })
            }
        }

        deserializer.deserialize_any(DepVisitor)
    }
}

impl Serialize for Dependency {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match &self.constraint {
            None => serializer.serialize_str(&self.name),
            Some(c) => serializer.serialize_str(&format!("{}{}{}", self.name, c.op, c.version)),
        }
    }
}

fn parse_inline_name_constraint(raw: &str) -> Dependency {
    for op in ["caret@^", "tilde@~", "ge@>=", "le@<=", "gt@>", "lt@<", "eq@="] {
        let marker = op.split('@').nth(1).unwrap();
        if let Some(idx) = raw.find(marker) {
            let (name, rest) = raw.split_at(idx);
            let constraint_str = &rest[marker.len()..];
            if let Some(constraint) = Constraint::parse(&format!("{marker}{constraint_str}")) {
                return Dependency {
                    name: name.trim().to_string(),
                    constraint: Some(constraint),
                };
            }
        }
    }
    Dependency {
        name: raw.trim().to_string(),
        constraint: None,
    }
}

/// Build and runtime dependency sets. Accepts either a flat list (applied to
/// both build and runtime) or an explicit `{build, runtime}` map on parse;
/// the authoritative in-memory shape is always this map (see open question
/// resolution in DESIGN.md).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Dependencies {
    pub build: Vec<Dependency>,
    pub runtime: Vec<Dependency>,
}

impl<'de> Deserialize<'de> for Dependencies {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DepsVisitor;

        impl<'de> Visitor<'de> for DepsVisitor {
            type Value = Dependencies;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a dependency list or a {build, runtime} map")
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Dependencies, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(dep) = seq.next_element::<Dependency>()? {
                    items.push(dep);
                }
                Ok(Dependencies {
                    build: items.clone(),
                    runtime: items,
                })
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Dependencies, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut build = Vec::new();
                let mut runtime = Vec::new();
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "build" => build = map.next_value()?,
                        "runtime" => runtime = map.next_value()?,
                        _ => {
                            let _ = map.next_value::<serde_yaml::Value>()?;
                        }
                    }
                }
                Ok(Dependencies { build, runtime })
            }
        }

        deserializer.deserialize_any(DepsVisitor)
    }
}

/// A string field that may be given as a bare scalar or a list; joined with
/// newlines when a list, matching how the recipe corpus renders multi-line
/// free text as YAML block sequences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlexibleString(pub String);

impl<'de> Deserialize<'de> for FlexibleString {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FSVisitor;

        impl<'de> Visitor<'de> for FSVisitor {
            type Value = FlexibleString;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string or a list of strings")
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<FlexibleString, E>
            where
                E: de::Error,
            {
                Ok(FlexibleString(v.to_string()))
            }

            fn visit_string<E>(self, v: String) -> std::result::Result<FlexibleString, E>
            where
                E: de::Error,
            {
                Ok(FlexibleString(v))
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<FlexibleString, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut lines = Vec::new();
                while let Some(line) = seq.next_element::<String>()? {
                    lines.push(line);
                }
                Ok(FlexibleString(lines.join("\n")))
            }
        }

        deserializer.deserialize_any(FSVisitor)
    }
}

/// A mapping from lifecycle stage name to a list of shell-command strings.
pub type HookMap = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    #[serde(deserialize_with = "de_version")]
    pub version: String,
    #[serde(default)]
    pub build_system: Option<BuildSystem>,
    #[serde(default)]
    pub summary: Option<FlexibleString>,
    #[serde(default)]
    pub description: Option<FlexibleString>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub update_regex: Option<String>,
    #[serde(default, alias = "depends")]
    pub dependencies: Dependencies,
    #[serde(default)]
    pub manifest_files: Vec<String>,
    #[serde(default)]
    pub hooks: HookMap,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Populated at load time, not part of the serialized form.
    #[serde(skip)]
    pub source_dir: PathBuf,
}

/// `version` may be given as a YAML string or a bare number (`1.0` parses as
/// a float); normalize both to a string.
fn de_version<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum VersionField {
        Str(String),
        Num(serde_json::Number),
    }

    match VersionField::deserialize(deserializer)? {
        VersionField::Str(s) => Ok(s),
        VersionField::Num(n) => Ok(n.to_string()),
    }
}

impl Recipe {
    /// Parse a recipe from YAML or JSON source text, dispatching on the
    /// given file extension.
    pub fn parse(source: &str, extension: &str) -> Result<Self> {
        match extension {
            "yaml" | "yml" => Ok(serde_yaml::from_str(source)?),
            "json" => Ok(serde_json::from_str(source)?),
            other => Err(Error::UnknownFormat(other.to_string())),
        }
    }

    /// Load and parse a recipe file, recording its containing directory as
    /// the source directory used by fingerprinting and the build pipeline.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let mut recipe = Self::parse(&text, extension)?;
        recipe.source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(recipe)
    }

    pub fn auto_detect_build_system(&self) -> BuildSystem {
        if let Some(bs) = self.build_system {
            return bs;
        }
        let dir = &self.source_dir;
        let exists = |name: &str| dir.join(name).exists();
        if exists("CMakeLists.txt") {
            BuildSystem::Cmake
        } else if exists("meson.build") {
            BuildSystem::Meson
        } else if exists("configure") {
            BuildSystem::Autotools
        } else if exists("pyproject.toml") || exists("setup.py") {
            BuildSystem::Python
        } else if exists("Cargo.toml") {
            BuildSystem::Cargo
        } else if exists("package.json") {
            BuildSystem::Node
        } else {
            BuildSystem::Make
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_recipe() {
        let yaml = r#"
name: foo
version: 1.0.0
"#;
        let recipe = Recipe::parse(yaml, "yaml").unwrap();
        assert_eq!(recipe.name, "foo");
        assert_eq!(recipe.version, "1.0.0");
    }

    #[test]
    fn parse_numeric_version() {
        let yaml = "name: foo\nversion: 1.0\n";
        let recipe = Recipe::parse(yaml, "yaml").unwrap();
        assert_eq!(recipe.version, "1");
    }

    #[test]
    fn parse_flat_dependency_list() {
        let yaml = r#"
name: foo
version: 1.0.0
depends:
  - bar
  - baz>=2.0.0
"#;
        let recipe = Recipe::parse(yaml, "yaml").unwrap();
        assert_eq!(recipe.dependencies.build.len(), 2);
        assert_eq!(recipe.dependencies.runtime.len(), 2);
        assert_eq!(recipe.dependencies.build[1].name, "baz");
        assert!(recipe.dependencies.build[1].constraint.is_some());
    }

    #[test]
    fn parse_split_dependency_map() {
        let yaml = r#"
name: foo
version: 1.0.0
dependencies:
  build:
    - cmake
  runtime:
    - name: libfoo
      version: "^1.0.0"
"#;
        let recipe = Recipe::parse(yaml, "yaml").unwrap();
        assert_eq!(recipe.dependencies.build.len(), 1);
        assert_eq!(recipe.dependencies.runtime.len(), 1);
        assert_eq!(recipe.dependencies.runtime[0].name, "libfoo");
    }

    #[test]
    fn parse_hooks_and_manifest() {
        let yaml = r#"
name: foo
version: 1.0.0
manifest_files:
  - Makefile
  - main.c
hooks:
  pre_build:
    - "echo hi"
"#;
        let recipe = Recipe::parse(yaml, "yaml").unwrap();
        assert_eq!(recipe.manifest_files, vec!["Makefile", "main.c"]);
        assert_eq!(recipe.hooks.get("pre_build").unwrap().len(), 1);
    }

    #[test]
    fn json_recipe() {
        let json = r#"{"name": "foo", "version": "2.0.0"}"#;
        let recipe = Recipe::parse(json, "json").unwrap();
        assert_eq!(recipe.name, "foo");
    }
}
