// MIT License
// Copyright 2023--present potserve developers

//! Where the active handler comes from, and how it is rebuilt on reload.
//!
//! A [`HandlerSource`] is resolved once at start-up and again on every
//! reload request. The usual source is a [`ModelFile`]:
//!
//! ```toml
//! kind = "lennard-jones"
//!
//! [parameters]
//! epsilon = 0.00088
//! sigma = 2.551
//! ```
//!
//! `kind` is looked up in a [`PotentialRegistry`], which maps names to
//! constructors taking the `[parameters]` table. The file is re-read on each
//! load, so editing it and sending an interrupt swaps in the new parameters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::error::ReloadError;
use crate::lennard_jones::LennardJones;
use crate::potential::SharedPotential;

/// Builds a handler from its parameter table.
pub type Constructor = fn(&toml::Table) -> Result<SharedPotential, ReloadError>;

/// Registry mapping potential kinds to constructors.
pub struct PotentialRegistry {
    constructors: HashMap<String, Constructor>,
}

impl PotentialRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with every built-in potential.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(LennardJones::KIND, |params| {
            let pot: SharedPotential = Arc::new(LennardJones::from_table(params)?);
            Ok(pot)
        });
        registry
    }

    /// Register (or replace) a constructor.
    pub fn register(&mut self, kind: impl Into<String>, constructor: Constructor) -> &mut Self {
        self.constructors.insert(kind.into(), constructor);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered kinds in sorted order.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn build(&self, kind: &str, params: &toml::Table) -> Result<SharedPotential, ReloadError> {
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| ReloadError::UnknownPotential(kind.to_string()))?;
        constructor(params)
    }
}

impl Default for PotentialRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// A re-resolvable reference to the handler implementation.
pub trait HandlerSource: Send + Sync {
    /// Human-readable location, used in logs.
    fn describe(&self) -> String;

    /// Build a fresh handler. Must not affect any previously built one.
    fn load(&self) -> Result<SharedPotential, ReloadError>;
}

/// Contents of a model file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    pub kind: String,
    #[serde(default)]
    pub parameters: toml::Table,
}

/// Model described by a TOML file on disk.
#[derive(Clone)]
pub struct ModelFile {
    path: PathBuf,
    registry: Arc<PotentialRegistry>,
}

impl ModelFile {
    /// Model file resolved against the built-in registry.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_registry(path, Arc::new(PotentialRegistry::with_builtins()))
    }

    pub fn with_registry(path: impl Into<PathBuf>, registry: Arc<PotentialRegistry>) -> Self {
        Self {
            path: path.into(),
            registry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the file without building the handler.
    pub fn read_spec(&self) -> Result<ModelSpec, ReloadError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ReloadError::Io {
            path: self.path.clone(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ReloadError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

impl HandlerSource for ModelFile {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> Result<SharedPotential, ReloadError> {
        let spec = self.read_spec()?;
        debug!(kind = %spec.kind, path = %self.path.display(), "building potential from model file");
        self.registry.build(&spec.kind, &spec.parameters)
    }
}

/// Closure-backed source.
pub struct FnSource<F> {
    description: String,
    func: F,
}

impl<F> FnSource<F>
where
    F: Fn() -> Result<SharedPotential, ReloadError> + Send + Sync,
{
    pub fn new(description: impl Into<String>, func: F) -> Self {
        Self {
            description: description.into(),
            func,
        }
    }
}

impl<F> HandlerSource for FnSource<F>
where
    F: Fn() -> Result<SharedPotential, ReloadError> + Send + Sync,
{
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn load(&self) -> Result<SharedPotential, ReloadError> {
        (self.func)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::potential::{Evaluation, FnPotential, ForceInput};
    use std::io::Write;

    fn write_model(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn builtins_include_lennard_jones() {
        let registry = PotentialRegistry::default();
        assert!(registry.contains("lennard-jones"));
        assert_eq!(registry.kinds(), vec!["lennard-jones"]);
    }

    #[test]
    fn unknown_kind_is_reported() {
        let registry = PotentialRegistry::new();
        assert!(matches!(
            registry.build("morse", &toml::Table::new()),
            Err(ReloadError::UnknownPotential(kind)) if kind == "morse"
        ));
    }

    #[test]
    fn custom_constructor_is_used() {
        let mut registry = PotentialRegistry::new();
        registry.register("zero", |_| {
            let pot: SharedPotential = Arc::new(FnPotential::new("zero", |input: &ForceInput<'_>| {
                Ok(Evaluation::zeros(input.n_atoms()))
            }));
            Ok(pot)
        });
        let pot = registry.build("zero", &toml::Table::new()).unwrap();
        assert_eq!(pot.name(), "zero");
    }

    #[test]
    fn model_file_loads_lennard_jones() {
        let file = write_model(
            r#"
kind = "lennard-jones"

[parameters]
epsilon = 0.01
sigma = 3.0
"#,
        );
        let source = ModelFile::new(file.path());
        let spec = source.read_spec().unwrap();
        assert_eq!(spec.kind, "lennard-jones");
        assert_eq!(source.load().unwrap().name(), "lennard-jones");
    }

    #[test]
    fn model_file_without_parameters_uses_defaults() {
        let file = write_model("kind = \"lennard-jones\"\n");
        assert!(ModelFile::new(file.path()).load().is_ok());
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = ModelFile::new(dir.path().join("absent.toml"));
        assert!(matches!(source.load(), Err(ReloadError::Io { .. })));
    }

    #[test]
    fn broken_file_is_parse_error() {
        let file = write_model("kind = ");
        assert!(matches!(
            ModelFile::new(file.path()).load(),
            Err(ReloadError::Parse { .. })
        ));
    }

    #[test]
    fn fn_source_describes_itself() {
        let source = FnSource::new("inline", || Err(ReloadError::NoSource));
        assert_eq!(source.describe(), "inline");
        assert!(source.load().is_err());
    }
}
