use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::DEFAULT_PACING_MS;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderCfg {
    /// "gemini" | "mock"
    pub kind: String,
    pub text_model: String,
    pub image_model: String,
    /// Name of the environment variable holding the API credential.
    pub api_key_env: String,
}

impl Default for ProviderCfg {
    fn default() -> Self {
        Self {
            kind: "gemini".into(),
            text_model: "gemini-2.5-flash".into(),
            image_model: "gemini-2.5-flash-image-preview".into(),
            api_key_env: "GEMINI_API_KEY".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerCfg {
    pub bind: String,
    /// Optional directory of prebuilt frontend assets to serve.
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".into(),
            static_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppCfg {
    pub provider: ProviderCfg,
    pub server: ServerCfg,
    /// Inter-task pacing in milliseconds. A throttle against upstream
    /// quota, not a tunable performance knob.
    pub pacing_ms: u64,
}

impl Default for AppCfg {
    fn default() -> Self {
        Self {
            provider: ProviderCfg::default(),
            server: ServerCfg::default(),
            pacing_ms: DEFAULT_PACING_MS,
        }
    }
}

impl AppCfg {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let txt = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                serde_yaml::from_str(&txt)
                    .with_context(|| format!("failed to parse config YAML {}", p.display()))
            }
            None => Ok(Self::default()),
        }
    }

    /// The credential, if present. Absence is not fatal at startup;
    /// requests against the real provider will fail later instead.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.provider.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}
