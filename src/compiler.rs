use std::path::{Path, PathBuf};

use crate::error::ProcessError;

/// Turns contract sources into a deployable `.wasm` file.
///
/// `single_file` marks a source that is one file rather than a crate directory.
pub trait ContractCompiler: Send + Sync {
    fn compile(&self, source: &Path, single_file: bool) -> Result<PathBuf, ProcessError>;
}

/// Accepts already built `.wasm` files and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct Precompiled;

impl ContractCompiler for Precompiled {
    fn compile(&self, source: &Path, _single_file: bool) -> Result<PathBuf, ProcessError> {
        let fail = |reason: &str| ProcessError::Compile {
            source_path: source.to_path_buf(),
            reason: reason.to_string(),
        };
        if source.extension().and_then(|ext| ext.to_str()) != Some("wasm") {
            return Err(fail("only prebuilt .wasm files are accepted"));
        }
        if !source.is_file() {
            return Err(fail("file does not exist"));
        }
        Ok(source.to_path_buf())
    }
}
