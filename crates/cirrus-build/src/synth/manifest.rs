//! Cargo manifest patching.

use std::collections::BTreeMap;

use toml::{Table, Value};

use crate::error::{BuildError, BuildResult};

/// Result of patching a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedManifest {
    /// Serialized manifest.
    pub contents: String,
    /// Library crate name as used in paths (`-` replaced by `_`).
    pub crate_ident: String,
    /// Whether `contents` differs from the input.
    pub changed: bool,
}

/// Inputs for [`patch`] other than the manifest text.
#[derive(Debug, Clone, Copy)]
pub struct PatchOptions<'a> {
    /// Dependencies the bootstrap needs. Added when absent, otherwise their
    /// `features` are merged into the existing entry.
    pub runtime_dependencies: &'a BTreeMap<String, Value>,
    /// Dependencies removed wherever they appear.
    pub strip_dependencies: &'a [String],
    /// Whether the crate has a `build.rs`.
    pub has_build_script: bool,
    /// Name of the bootstrap binary target.
    pub bin_name: &'a str,
    /// Path of the bootstrap source relative to the manifest.
    pub bin_path: &'a str,
}

/// Patch a manifest so the bootstrap binary builds in a release image.
///
/// Development-only tables are removed so the image build does not fetch
/// them; `[build-dependencies]` survive when a build script needs them.
/// Comments and formatting are not preserved. Patching a patched manifest
/// is a no-op.
pub fn patch(source: &str, options: &PatchOptions<'_>) -> BuildResult<PatchedManifest> {
    let mut manifest: Table = source
        .parse()
        .map_err(|e| BuildError::synthesis(format!("invalid Cargo.toml: {e}")))?;

    let crate_ident = crate_ident(&manifest)?;

    strip_dependency_tables(&mut manifest, options);

    if let Some(Value::Table(targets)) = manifest.get_mut("target") {
        for (_, target) in targets.iter_mut() {
            if let Value::Table(target) = target {
                strip_dependency_tables(target, options);
            }
        }
        targets.retain(|_, target| !matches!(target, Value::Table(t) if t.is_empty()));
    }
    if matches!(manifest.get("target"), Some(Value::Table(t)) if t.is_empty()) {
        manifest.remove("target");
    }

    let dependencies = table_entry(&mut manifest, "dependencies")?;
    for (name, required) in options.runtime_dependencies {
        match dependencies.get_mut(name) {
            Some(existing) => merge_features(existing, required),
            None => {
                dependencies.insert(name.clone(), required.clone());
            }
        }
    }

    register_bin(&mut manifest, options.bin_name, options.bin_path)?;

    let contents = toml::to_string(&manifest)
        .map_err(|e| BuildError::synthesis(format!("failed to serialize Cargo.toml: {e}")))?;
    let changed = contents != source;

    Ok(PatchedManifest {
        contents,
        crate_ident,
        changed,
    })
}

fn crate_ident(manifest: &Table) -> BuildResult<String> {
    let lib_name = manifest
        .get("lib")
        .and_then(|lib| lib.get("name"))
        .and_then(Value::as_str);

    let package_name = manifest
        .get("package")
        .and_then(|package| package.get("name"))
        .and_then(Value::as_str);

    lib_name
        .or(package_name)
        .map(|name| name.replace('-', "_"))
        .ok_or_else(|| BuildError::synthesis("Cargo.toml has no [package] name"))
}

fn strip_dependency_tables(table: &mut Table, options: &PatchOptions<'_>) {
    table.remove("dev-dependencies");
    if !options.has_build_script {
        table.remove("build-dependencies");
    }

    for key in ["dependencies", "build-dependencies"] {
        if let Some(Value::Table(deps)) = table.get_mut(key) {
            for name in options.strip_dependencies {
                deps.remove(name);
            }
        }
    }
}

/// Add the features `required` asks for to an existing dependency entry.
///
/// A bare version string becomes `{ version = "..", features = [..] }`.
/// The user's version and other keys are kept; features already present
/// are not repeated.
fn merge_features(existing: &mut Value, required: &Value) {
    let Some(features) = required.get("features").and_then(Value::as_array) else {
        return;
    };
    if features.is_empty() {
        return;
    }

    if let Value::String(version) = existing {
        let mut table = Table::new();
        table.insert("version".to_owned(), Value::String(version.clone()));
        *existing = Value::Table(table);
    }
    let Value::Table(entry) = existing else {
        return;
    };

    let present = entry
        .entry("features")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !present.is_array() {
        *present = Value::Array(Vec::new());
    }
    if let Value::Array(present) = present {
        for feature in features {
            if !present.contains(feature) {
                present.push(feature.clone());
            }
        }
    }
}

fn table_entry<'a>(manifest: &'a mut Table, key: &str) -> BuildResult<&'a mut Table> {
    match manifest
        .entry(key)
        .or_insert_with(|| Value::Table(Table::new()))
    {
        Value::Table(table) => Ok(table),
        _ => Err(BuildError::synthesis(format!("[{key}] is not a table"))),
    }
}

fn register_bin(manifest: &mut Table, name: &str, path: &str) -> BuildResult<()> {
    let bins = match manifest
        .entry("bin")
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(bins) => bins,
        _ => return Err(BuildError::synthesis("[[bin]] is not an array of tables")),
    };

    let registered = bins
        .iter()
        .any(|bin| bin.get("name").and_then(Value::as_str) == Some(name));
    if !registered {
        let mut bin = Table::new();
        bin.insert("name".to_owned(), Value::String(name.to_owned()));
        bin.insert("path".to_owned(), Value::String(path.to_owned()));
        bins.push(Value::Table(bin));
    }

    Ok(())
}
