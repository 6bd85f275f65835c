//! Replica configuration file.

use std::path::{Path, PathBuf};

use accord_engine::{EngineConfig, PolicySpec, TranslatorDriverConfig};
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};

/// Everything a replica starts with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccordConfig {
    pub engine: EngineConfig,
    /// Directory of library policy files, loaded at startup.
    pub library_dir: Option<PathBuf>,
    /// Library policies to activate after loading.
    pub activate: Vec<String>,
    pub policies: Vec<PolicySpec>,
    pub datasources: Vec<DatasourceSpec>,
}

/// A translator-driven datasource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub driver: TranslatorDriverConfig,
}

impl AccordConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .into_diagnostic()
            .wrap_err_with(|| format!("invalid config {}", path.display()))
    }
}
