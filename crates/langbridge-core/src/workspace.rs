//! Backend keys and workspace classification

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identity of a backend: one process per (workspace root, language)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendKey {
    pub root: PathBuf,
    pub language: String,
}

impl BackendKey {
    pub fn new(root: impl Into<PathBuf>, language: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            language: language.into(),
        }
    }

    /// Display form used as the backend id, `language@root`
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.language, self.root.display())
    }
}

/// Decides which backend serves a request
pub trait WorkspaceClassifier: Send + Sync {
    /// Classify from an optional file and the request's arguments
    fn classify(&self, file: Option<&str>, hints: &Value) -> BridgeResult<BackendKey>;
}

/// Classifier driven by the loaded configuration
///
/// Explicit `language` and `workspace` arguments win. Otherwise the file
/// extension selects the language, then the configured default language,
/// then the only configured language. The root defaults to the bridge's
/// workspace root.
pub struct ConfigClassifier {
    config: Arc<BridgeConfig>,
    default_root: PathBuf,
}

impl ConfigClassifier {
    pub fn new(config: Arc<BridgeConfig>, default_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            default_root: default_root.into(),
        }
    }

    pub fn default_root(&self) -> &Path {
        &self.default_root
    }

    fn resolve_root(&self, hints: &Value) -> BridgeResult<PathBuf> {
        match hints.get("workspace") {
            None | Some(Value::Null) => Ok(self.default_root.clone()),
            Some(Value::String(root)) => {
                let root = Path::new(root);
                if root.is_absolute() {
                    Ok(root.to_path_buf())
                } else {
                    Ok(self.default_root.join(root))
                }
            }
            Some(_) => Err(BridgeError::invalid_arguments(
                "'workspace' must be a string",
            )),
        }
    }

    fn resolve_language(&self, file: Option<&str>, hints: &Value) -> BridgeResult<String> {
        match hints.get("language") {
            None | Some(Value::Null) => {}
            Some(Value::String(language)) => {
                if self.config.languages.contains_key(language) {
                    return Ok(language.clone());
                }
                return Err(BridgeError::config(format!(
                    "no backend configured for language '{}'",
                    language
                )));
            }
            Some(_) => {
                return Err(BridgeError::invalid_arguments(
                    "'language' must be a string",
                ));
            }
        }

        if let Some(file) = file {
            let extension = Path::new(file)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default();
            return self
                .config
                .language_for_extension(extension)
                .map(str::to_string)
                .ok_or_else(|| {
                    BridgeError::config(format!("no backend configured for file '{}'", file))
                });
        }

        if let Some(language) = &self.config.default_language {
            return Ok(language.clone());
        }
        let mut names = self.config.languages.keys();
        match (names.next(), names.next()) {
            (Some(only), None) => Ok(only.clone()),
            (None, _) => Err(BridgeError::config("no languages configured")),
            _ => Err(BridgeError::invalid_arguments(
                "cannot determine language; pass 'language' or 'file'",
            )),
        }
    }
}

impl WorkspaceClassifier for ConfigClassifier {
    fn classify(&self, file: Option<&str>, hints: &Value) -> BridgeResult<BackendKey> {
        let root = self.resolve_root(hints)?;
        let language = self.resolve_language(file, hints)?;
        Ok(BackendKey::new(root, language))
    }
}
