//! Env snapshot fetched from the host once per attach cycle.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::connection::{decode, HostConnection, HostResult};

/// API version this build speaks. A host reporting anything else still
/// works, but the user is told to rebuild.
pub const API_VERSION: u32 = 8;

/// Immutable description of host capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Env {
    pub api_version: u32,
    #[serde(default)]
    pub is_vim: bool,
    #[serde(default)]
    pub floating_supported: bool,
    #[serde(default)]
    pub text_prop_supported: bool,
    #[serde(default)]
    pub complete_opt: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub workspace_folders: Vec<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub extension_root: PathBuf,
}

impl Env {
    pub const METHOD: &'static str = "get_env";

    /// Fetch the snapshot with a single host call.
    pub async fn fetch(host: &dyn HostConnection) -> HostResult<Env> {
        let value = host.call(Self::METHOD, Vec::new()).await?;
        decode(Self::METHOD, value)
    }

    /// Diagnostic text when the host's API version is not ours.
    pub fn version_mismatch(&self) -> Option<String> {
        if self.api_version == API_VERSION {
            return None;
        }
        Some(format!(
            "Host API version {} does not match expected version {}; \
             rebuild the host integration after updating.",
            self.api_version, API_VERSION
        ))
    }
}
