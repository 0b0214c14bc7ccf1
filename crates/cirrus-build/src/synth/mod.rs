//! Entrypoint synthesis.
//!
//! Turns an extracted function crate into something the image build can run:
//!
//! 1. Find exactly one handler carrying the capability marker
//! 2. Patch `Cargo.toml` with the bootstrap's runtime dependencies and a
//!    `[[bin]]` target
//! 3. Write the generated bootstrap under `src/bin/`
//!
//! User source files are never modified.

pub mod bootstrap;
mod introspect;
pub mod manifest;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::task::spawn_blocking;
use tracing::{debug, info};

pub use introspect::{HandlerSymbol, RustIntrospector, SourceIntrospector};

use crate::error::{BuildError, BuildResult};
use manifest::PatchOptions;

/// Configuration for entrypoint synthesis.
#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisConfig {
    /// Path of the capability marker trait.
    #[serde(default = "default_marker")]
    pub marker: String,
    /// Name of the generated bootstrap binary.
    #[serde(default = "default_bootstrap_name")]
    pub bootstrap_name: String,
    /// Dependencies the bootstrap needs, added to the manifest when absent.
    #[serde(default = "default_runtime_dependencies")]
    pub runtime_dependencies: BTreeMap<String, toml::Value>,
    /// Dependencies removed from the manifest before building.
    #[serde(default)]
    pub strip_dependencies: Vec<String>,
}

fn default_marker() -> String {
    "cirrus_sdk::FunctionHandler".to_owned()
}

fn default_bootstrap_name() -> String {
    "cirrus-bootstrap".to_owned()
}

fn default_runtime_dependencies() -> BTreeMap<String, toml::Value> {
    let mut tokio = toml::Table::new();
    tokio.insert("version".to_owned(), toml::Value::String("1".to_owned()));
    tokio.insert(
        "features".to_owned(),
        toml::Value::Array(
            ["rt", "macros", "io-std", "io-util"]
                .into_iter()
                .map(|f| toml::Value::String(f.to_owned()))
                .collect(),
        ),
    );

    let mut deps = BTreeMap::new();
    deps.insert("serde_json".to_owned(), toml::Value::String("1".to_owned()));
    deps.insert("tokio".to_owned(), toml::Value::Table(tokio));
    deps
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            marker: default_marker(),
            bootstrap_name: default_bootstrap_name(),
            runtime_dependencies: default_runtime_dependencies(),
            strip_dependencies: Vec::new(),
        }
    }
}

impl SynthesisConfig {
    /// Bootstrap source path relative to the crate root.
    #[must_use]
    pub fn bootstrap_path(&self) -> String {
        format!("src/bin/{}.rs", self.bootstrap_name)
    }
}

/// Output of a successful synthesis.
#[derive(Debug, Clone)]
pub struct Synthesis {
    /// Generated bootstrap, relative to the crate root.
    pub entrypoint_path: PathBuf,
    /// The selected handler.
    pub handler: HandlerSymbol,
    /// Library crate identifier used by the bootstrap.
    pub crate_ident: String,
    /// Whether `Cargo.toml` was rewritten.
    pub manifest_changed: bool,
}

/// Entrypoint synthesizer.
#[derive(Clone)]
pub struct Synthesizer {
    config: SynthesisConfig,
    introspector: Arc<dyn SourceIntrospector>,
}

impl Synthesizer {
    /// Create a synthesizer using the `syn`-based introspector.
    #[must_use]
    pub fn new(config: SynthesisConfig) -> Self {
        Self::with_introspector(config, Arc::new(RustIntrospector))
    }

    /// Create a synthesizer with a custom introspector.
    #[must_use]
    pub fn with_introspector(
        config: SynthesisConfig,
        introspector: Arc<dyn SourceIntrospector>,
    ) -> Self {
        Self {
            config,
            introspector,
        }
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Synthesize the entrypoint for the crate at `root`.
    pub async fn synthesize(&self, root: &Path) -> BuildResult<Synthesis> {
        let this = self.clone();
        let root = root.to_owned();
        spawn_blocking(move || this.synthesize_sync(&root))
            .await
            .map_err(|e| BuildError::internal(format!("synthesis task failed: {e}")))?
    }

    fn synthesize_sync(&self, root: &Path) -> BuildResult<Synthesis> {
        let manifest_path = root.join("Cargo.toml");
        if !manifest_path.is_file() {
            return Err(BuildError::synthesis("no Cargo.toml at archive root"));
        }
        if !root.join("src").join("lib.rs").is_file() {
            return Err(BuildError::synthesis("no library target at src/lib.rs"));
        }

        let handler = self.select_handler(root)?;

        let source = std::fs::read_to_string(&manifest_path)?;
        let bootstrap_path = self.config.bootstrap_path();
        let patched = manifest::patch(
            &source,
            &PatchOptions {
                runtime_dependencies: &self.config.runtime_dependencies,
                strip_dependencies: &self.config.strip_dependencies,
                has_build_script: root.join("build.rs").is_file(),
                bin_name: &self.config.bootstrap_name,
                bin_path: &bootstrap_path,
            },
        )?;
        if patched.changed {
            std::fs::write(&manifest_path, &patched.contents)?;
        }

        let rendered = bootstrap::render(
            &self.config.marker,
            &handler.import_path(&patched.crate_ident),
        );
        let entrypoint = root.join(&bootstrap_path);
        if let Some(parent) = entrypoint.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&entrypoint, rendered)?;

        info!(
            handler = %handler.qualified_name(),
            crate_ident = %patched.crate_ident,
            manifest_changed = patched.changed,
            "entrypoint synthesized"
        );

        Ok(Synthesis {
            entrypoint_path: PathBuf::from(bootstrap_path),
            handler,
            crate_ident: patched.crate_ident,
            manifest_changed: patched.changed,
        })
    }

    fn select_handler(&self, root: &Path) -> BuildResult<HandlerSymbol> {
        let mut found = self.introspector.find_marked(root, &self.config.marker)?;
        debug!(count = found.len(), "handler candidates");

        if found.len() != 1 {
            let mut candidates: Vec<String> =
                found.iter().map(HandlerSymbol::qualified_name).collect();
            candidates.sort();
            return Err(BuildError::AmbiguousEntrypoint {
                marker: self.config.marker.clone(),
                candidates,
            });
        }

        let handler = found.remove(0);
        if !handler.reachable {
            return Err(BuildError::synthesis(format!(
                "handler {} is not public or not reachable through public modules",
                handler.qualified_name()
            )));
        }
        if handler.generic {
            return Err(BuildError::synthesis(format!(
                "handler {} is generic and cannot be constructed",
                handler.qualified_name()
            )));
        }

        Ok(handler)
    }
}

impl std::fmt::Debug for Synthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synthesizer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
