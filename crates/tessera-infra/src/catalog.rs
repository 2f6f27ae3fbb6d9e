//! YAML workflow definitions on disk.
//!
//! A workflow file holds one definition, a list of definitions, or a mapping
//! with a `workflows:` list. Every definition is validated before it is
//! registered, so the engine only ever sees executable specs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_yaml_ng::Value;
use tessera_core::workflow::catalog::{InMemoryCatalog, WorkflowCatalog};
use tessera_core::workflow::definition::{SpecError, validate_spec};
use tessera_core::workflow::expression::JexlEvaluator;
use tessera_types::spec::WorkflowSpec;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("{path}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: SpecError,
    },

    #[error("workflow '{name}' is defined more than once ({path})")]
    Duplicate { name: String, path: PathBuf },
}

/// Parse the workflow definitions in one YAML document.
pub fn parse_workflows(yaml: &str) -> Result<Vec<WorkflowSpec>, serde_yaml_ng::Error> {
    let value: Value = serde_yaml_ng::from_str(yaml)?;
    match value {
        Value::Sequence(_) => serde_yaml_ng::from_value(value),
        Value::Mapping(ref map) => match map.get("workflows") {
            Some(list) => serde_yaml_ng::from_value(list.clone()),
            None => Ok(vec![serde_yaml_ng::from_value(value)?]),
        },
        other => Ok(vec![serde_yaml_ng::from_value(other)?]),
    }
}

fn is_workflow_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}

/// Catalog populated from `*.yaml` / `*.yml` files.
#[derive(Debug, Default)]
pub struct DirectoryCatalog {
    specs: InMemoryCatalog,
    evaluator: JexlEvaluator,
}

impl DirectoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every workflow file directly under `dir`, in file name order.
    ///
    /// A missing directory yields an empty catalog.
    pub async fn load(dir: &Path) -> Result<Self, CatalogError> {
        let catalog = Self::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No workflow directory at {}", dir.display());
                return Ok(catalog);
            }
            Err(source) => {
                return Err(CatalogError::Io {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        };

        let mut files = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| CatalogError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if is_workflow_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        for path in &files {
            let loaded = catalog.load_file(path).await?;
            tracing::debug!(file = %path.display(), workflows = loaded.len(), "loaded workflow file");
        }
        Ok(catalog)
    }

    /// Parse, validate and register the definitions in one file, replacing
    /// earlier definitions of the same name.
    pub async fn load_file(&self, path: &Path) -> Result<Vec<Arc<WorkflowSpec>>, CatalogError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CatalogError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        self.load_str(&content, path)
    }

    /// Register definitions from YAML text; `origin` is only used in errors.
    pub fn load_str(&self, yaml: &str, origin: &Path) -> Result<Vec<Arc<WorkflowSpec>>, CatalogError> {
        let specs = parse_workflows(yaml).map_err(|e| CatalogError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut seen = std::collections::HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.as_str()) {
                return Err(CatalogError::Duplicate {
                    name: spec.name.clone(),
                    path: origin.to_path_buf(),
                });
            }
            validate_spec(spec, &self.evaluator).map_err(|source| CatalogError::Invalid {
                path: origin.to_path_buf(),
                source,
            })?;
        }

        Ok(specs.into_iter().map(|spec| self.specs.register(spec)).collect())
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.names()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl WorkflowCatalog for DirectoryCatalog {
    fn get(&self, name: &str) -> Option<Arc<WorkflowSpec>> {
        self.specs.get(name)
    }
}
