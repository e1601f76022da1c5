//! Compiler configuration
//!
//! Every field has a default, so a JSON file only needs to name the
//! settings it changes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};
use crate::linewrap::{DEFAULT_WIDTH, MAX_WIDTH};
use crate::types::DType;

/// Backend a network compiles its equations for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Array,
    Fortran,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Array => crate::array::BACKEND,
            BackendKind::Fortran => crate::fortran::BACKEND,
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "array" => Ok(BackendKind::Array),
            "fortran" => Ok(BackendKind::Fortran),
            other => Err(CompileError::value(format!("unknown backend `{}`", other))),
        }
    }
}

/// Settings of the Fortran emitter and its native toolchain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FortranOptions {
    /// Column budget of generated lines
    pub line_width: usize,
    /// Compiler executable
    pub compiler: String,
    pub flags: Vec<String>,
    /// Where sources and libraries are written; a temporary directory if unset
    pub build_dir: Option<PathBuf>,
    /// Emit the AUTO-07p calling convention and companion routines
    pub auto_compat: bool,
    /// Exported name of the right-hand-side routine in the built library
    pub symbol: String,
}

impl Default for FortranOptions {
    fn default() -> Self {
        Self {
            line_width: DEFAULT_WIDTH,
            compiler: "gfortran".to_string(),
            flags: vec!["-shared".to_string(), "-fPIC".to_string(), "-O2".to_string()],
            build_dir: None,
            auto_compat: false,
            symbol: "func_".to_string(),
        }
    }
}

/// Configuration of a [`Network`](crate::network::Network)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub backend: BackendKind,
    /// Dtype given to untyped float literals
    pub float_dtype: DType,
    pub fold_constants: bool,
    /// Share nodes between identical operations of one equation
    pub deduplicate: bool,
    /// Evaluate the nodes of a layer on the rayon pool
    pub parallel_layers: bool,
    /// Let any two rank>1 shapes combine and check them at runtime
    pub permissive_broadcast: bool,
    pub fortran: FortranOptions,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Array,
            float_dtype: DType::Float64,
            fold_constants: true,
            deduplicate: true,
            parallel_layers: false,
            permissive_broadcast: false,
            fortran: FortranOptions::default(),
        }
    }
}

impl CompilerConfig {
    pub fn from_json(text: &str) -> CompileResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| CompileError::value(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> CompileResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CompileError::value(format!("cannot read configuration {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn validate(&self) -> CompileResult<()> {
        if !self.float_dtype.is_float() {
            return Err(CompileError::value(format!(
                "float_dtype must be a float type, got {}",
                self.float_dtype
            )));
        }
        if !(20..=MAX_WIDTH).contains(&self.fortran.line_width) {
            return Err(CompileError::value(format!(
                "fortran.line_width must be between 20 and {}, got {}",
                MAX_WIDTH, self.fortran.line_width
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::default();
        assert_eq!(config.backend, BackendKind::Array);
        assert_eq!(config.float_dtype, DType::Float64);
        assert!(config.fold_constants);
        assert!(config.deduplicate);
        assert!(!config.permissive_broadcast);
        assert_eq!(config.fortran.line_width, 60);
        assert_eq!(config.fortran.compiler, "gfortran");
    }

    #[test]
    fn test_partial_json() {
        let config = CompilerConfig::from_json(
            r#"{"backend": "fortran", "float_dtype": "float32", "fortran": {"auto_compat": true}}"#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Fortran);
        assert_eq!(config.float_dtype, DType::Float32);
        assert!(config.fortran.auto_compat);
        assert_eq!(config.fortran.symbol, "func_");
        assert!(config.fold_constants);
    }

    #[test]
    fn test_json_round_trip() {
        let config = CompilerConfig {
            parallel_layers: true,
            ..CompilerConfig::default()
        };
        let text = config.to_json().unwrap();
        assert_eq!(CompilerConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_settings() {
        assert!(CompilerConfig::from_json(r#"{"float_dtype": "int32"}"#).is_err());
        assert!(CompilerConfig::from_json(r#"{"backend": "cuda"}"#).is_err());
        assert!(CompilerConfig::from_json(r#"{"fortran": {"line_width": 5}}"#).is_err());
        assert!(CompilerConfig::from_json(r#"{"fortran": {"line_width": 100}}"#).is_err());
        assert!(CompilerConfig::from_json(r#"{"fortran": {"line_width": 72}}"#).is_ok());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("fortran".parse::<BackendKind>().unwrap(), BackendKind::Fortran);
        assert!("gpu".parse::<BackendKind>().is_err());
    }
}
