//! Plugin loading for the worker subprocess.
//!
//! Plugins are dynamic libraries (.so/.dylib/.dll) resolved by name
//! under the worker's private module directory. Each library exports a
//! `PLUGIN_DECLARATION` symbol describing its ABI version and entry
//! point; loaded libraries stay alive for the worker's lifetime to
//! prevent use-after-free when plugin code is invoked again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use libloading::Library;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::RuntimeError;

/// ABI version baked into plugin declarations. Bump on any change to
/// [`PluginDeclaration`] or the invocation contract.
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Exported by every plugin library under the symbol
/// `PLUGIN_DECLARATION`. Use [`export_plugin!`](crate::export_plugin)
/// rather than writing the static by hand.
#[repr(C)]
pub struct PluginDeclaration {
    pub abi_version: u32,
    /// Entry point: resolved arguments in, optional produced value out.
    /// An `Err` message becomes a `Plugin` failure on the orchestrator.
    pub invoke: fn(&[Value]) -> Result<Option<Value>, String>,
}

/// Declare a plugin's entry point.
///
/// ```ignore
/// fn run(args: &[serde_json::Value]) -> Result<Option<serde_json::Value>, String> {
///     Ok(Some(serde_json::json!({"rows": args.len()})))
/// }
/// plugin_runner::export_plugin!(run);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($invoke:path) => {
        #[no_mangle]
        pub static PLUGIN_DECLARATION: $crate::plugin::PluginDeclaration =
            $crate::plugin::PluginDeclaration {
                abi_version: $crate::plugin::PLUGIN_ABI_VERSION,
                invoke: $invoke,
            };
    };
}

/// Package descriptor passed through the protocol as the first param
/// of a plugin-start call. Opaque to the core beyond `name`; installer
/// metadata rides along in `extra` uninterpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PluginDescriptor {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Seam between the worker's dispatch loop and plugin execution.
/// Production uses [`DylibLoader`]; tests substitute mocks.
#[async_trait]
pub trait PluginLoader: Send {
    /// Load (if needed) and invoke the named plugin with already
    /// resolved arguments.
    async fn invoke(
        &mut self,
        descriptor: &PluginDescriptor,
        args: &[Value],
    ) -> Result<Option<Value>, RuntimeError>;
}

/// Loader backed by `libloading`, resolving plugin libraries under the
/// worker's module directory (`<modules>/<name>/`).
pub struct DylibLoader {
    modules_dir: PathBuf,
    /// Loaded libraries, keyed by plugin name. Must remain alive while
    /// plugin code may run.
    loaded: HashMap<String, Library>,
}

impl DylibLoader {
    pub fn new(modules_dir: PathBuf) -> Self {
        Self {
            modules_dir,
            loaded: HashMap::new(),
        }
    }

    fn ensure_loaded(&mut self, name: &str) -> Result<&Library, RuntimeError> {
        if !self.loaded.contains_key(name) {
            let path = find_plugin_library(&self.modules_dir.join(name))?;
            debug!(plugin = %name, path = %path.display(), "loading plugin library");
            let lib = unsafe {
                Library::new(&path).map_err(|e| {
                    RuntimeError::Plugin(format!(
                        "failed to load plugin library {}: {e}",
                        path.display()
                    ))
                })?
            };
            self.loaded.insert(name.to_string(), lib);
        }
        Ok(&self.loaded[name])
    }
}

#[async_trait]
impl PluginLoader for DylibLoader {
    async fn invoke(
        &mut self,
        descriptor: &PluginDescriptor,
        args: &[Value],
    ) -> Result<Option<Value>, RuntimeError> {
        let name = descriptor.name.clone();
        let lib = self.ensure_loaded(&name)?;

        let decl: &PluginDeclaration = unsafe {
            let symbol = lib
                .get::<*const PluginDeclaration>(b"PLUGIN_DECLARATION\0")
                .map_err(|_| {
                    RuntimeError::Plugin(format!(
                        "plugin '{name}' is missing the PLUGIN_DECLARATION symbol; \
                         build it with the export_plugin! macro"
                    ))
                })?;
            &**symbol
        };

        if decl.abi_version != PLUGIN_ABI_VERSION {
            return Err(RuntimeError::Plugin(format!(
                "ABI version mismatch for '{name}': plugin has v{}, worker expects v{}",
                decl.abi_version, PLUGIN_ABI_VERSION
            )));
        }

        (decl.invoke)(args).map_err(RuntimeError::Plugin)
    }
}

/// Locate the single plugin library file inside a plugin's directory.
fn find_plugin_library(dir: &Path) -> Result<PathBuf, RuntimeError> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        RuntimeError::Plugin(format!(
            "plugin directory {} is not readable: {e}",
            dir.display()
        ))
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        if is_plugin_library(&path) {
            return Ok(path);
        }
    }

    Err(RuntimeError::Plugin(format!(
        "no plugin library found under {}",
        dir.display()
    )))
}

fn is_plugin_library(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    path.is_file() && matches!(ext, "so" | "dylib" | "dll")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_passes_extras_through() {
        let json = r#"{"name": "collect", "version": "1.2.0", "target": {"PYTHONPATH": "/opt/py"}}"#;
        let desc: PluginDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(desc.name, "collect");
        assert_eq!(desc.version, "1.2.0");
        assert_eq!(desc.extra["target"], json!({"PYTHONPATH": "/opt/py"}));

        let back = serde_json::to_value(&desc).unwrap();
        assert_eq!(back["target"]["PYTHONPATH"], json!("/opt/py"));
    }

    #[test]
    fn missing_plugin_dir_is_a_plugin_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_plugin_library(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, RuntimeError::Plugin(_)));
    }

    #[test]
    fn finds_library_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "not a library").unwrap();
        std::fs::write(dir.path().join("libcollect.so"), "").unwrap();

        let found = find_plugin_library(dir.path()).unwrap();
        assert!(found.ends_with("libcollect.so"));
    }

    #[test]
    fn directory_without_library_is_a_plugin_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("metadata.json"), "{}").unwrap();
        let err = find_plugin_library(dir.path()).unwrap_err();
        assert!(matches!(err, RuntimeError::Plugin(_)));
    }
}
