//! Source introspection for handler discovery.
//!
//! A handler is a type that implements the capability marker trait. The
//! [`SourceIntrospector`] trait makes the discovery mechanism pluggable; the
//! default [`RustIntrospector`] walks the library's module tree with `syn`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use syn::{Attribute, Item, Type, Visibility};
use tracing::debug;

use crate::error::{BuildError, BuildResult};

/// A type that carries the capability marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSymbol {
    /// Type identifier.
    pub type_name: String,
    /// Module path from the crate root, excluding the type.
    pub module_path: Vec<String>,
    /// Source file containing the marker impl, relative to the source root.
    pub file: PathBuf,
    /// Whether the type and every module on its path are `pub`.
    pub reachable: bool,
    /// Whether the impl is generic over its self type.
    pub generic: bool,
}

impl HandlerSymbol {
    /// Crate-relative name such as `handlers::Greeter`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        let mut parts = self.module_path.clone();
        parts.push(self.type_name.clone());
        parts.join("::")
    }

    /// Absolute path for use from another crate, such as `::app::handlers::Greeter`.
    #[must_use]
    pub fn import_path(&self, crate_ident: &str) -> String {
        format!("::{crate_ident}::{}", self.qualified_name())
    }
}

/// Finds symbols matching a capability marker in a source tree.
pub trait SourceIntrospector: Send + Sync {
    /// Return every symbol under `root` that carries `marker`.
    ///
    /// `marker` is a path such as `cirrus_sdk::FunctionHandler`;
    /// implementations decide how strictly to match it.
    fn find_marked(&self, root: &Path, marker: &str) -> BuildResult<Vec<HandlerSymbol>>;
}

/// Introspector for Rust library crates.
///
/// Starts at `src/lib.rs` and follows `mod` declarations, so orphan files
/// and `#[cfg(test)]` modules are never reported. An impl matches when the
/// final segment of its trait path equals the final segment of the marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustIntrospector;

struct Walk<'a> {
    root: &'a Path,
    marker_ident: &'a str,
    found: Vec<HandlerSymbol>,
    /// Declared types keyed by (module path, name), mapped to whether they are `pub`.
    declared: HashMap<(Vec<String>, String), bool>,
}

struct Scope<'a> {
    file: &'a Path,
    module_dir: PathBuf,
    module_path: Vec<String>,
    reachable: bool,
}

impl SourceIntrospector for RustIntrospector {
    fn find_marked(&self, root: &Path, marker: &str) -> BuildResult<Vec<HandlerSymbol>> {
        let lib = root.join("src").join("lib.rs");
        if !lib.is_file() {
            return Err(BuildError::synthesis("no library target at src/lib.rs"));
        }

        let marker_ident = marker.rsplit("::").next().unwrap_or(marker);
        let mut walk = Walk {
            root,
            marker_ident,
            found: Vec::new(),
            declared: HashMap::new(),
        };

        let scope = Scope {
            file: &lib,
            module_dir: root.join("src"),
            module_path: Vec::new(),
            reachable: true,
        };
        walk.visit_file(&scope)?;

        // Types declared elsewhere (re-exports, macros) keep module reachability
        let Walk {
            mut found,
            declared,
            ..
        } = walk;
        for symbol in &mut found {
            let key = (symbol.module_path.clone(), symbol.type_name.clone());
            if let Some(public) = declared.get(&key) {
                symbol.reachable &= *public;
            }
        }

        debug!(marker = %marker, matches = found.len(), "introspection complete");
        Ok(found)
    }
}

impl Walk<'_> {
    fn visit_file(&mut self, scope: &Scope<'_>) -> BuildResult<()> {
        let source = std::fs::read_to_string(scope.file)?;
        let parsed = syn::parse_file(&source).map_err(|e| BuildError::SourceParse {
            path: self.relative(scope.file),
            message: e.to_string(),
        })?;
        self.visit_items(&parsed.items, scope)
    }

    fn visit_items(&mut self, items: &[Item], scope: &Scope<'_>) -> BuildResult<()> {
        for item in items {
            match item {
                Item::Impl(imp) => {
                    let Some((negated, trait_path, _)) = &imp.trait_ else {
                        continue;
                    };
                    if negated.is_some() {
                        continue;
                    }
                    let implements_marker = trait_path
                        .segments
                        .last()
                        .is_some_and(|seg| seg.ident == self.marker_ident);
                    if !implements_marker {
                        continue;
                    }
                    if let Some(symbol) = self.symbol_for(&imp.self_ty, scope, &imp.generics) {
                        self.found.push(symbol);
                    }
                }
                Item::Struct(item) => self.declare(scope, &item.ident, &item.vis),
                Item::Enum(item) => self.declare(scope, &item.ident, &item.vis),
                Item::Union(item) => self.declare(scope, &item.ident, &item.vis),
                Item::Mod(module) => {
                    if is_cfg_test(&module.attrs) {
                        continue;
                    }

                    let name = module.ident.to_string();
                    let mut module_path = scope.module_path.clone();
                    module_path.push(name.clone());
                    let reachable = scope.reachable && matches!(module.vis, Visibility::Public(_));
                    let module_dir = scope.module_dir.join(&name);

                    match &module.content {
                        Some((_, inner)) => {
                            let child = Scope {
                                file: scope.file,
                                module_dir,
                                module_path,
                                reachable,
                            };
                            self.visit_items(inner, &child)?;
                        }
                        None => {
                            let file = self.module_file(&scope.module_dir, &name)?;
                            let child = Scope {
                                file: &file,
                                module_dir,
                                module_path,
                                reachable,
                            };
                            self.visit_file(&child)?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn declare(&mut self, scope: &Scope<'_>, ident: &syn::Ident, vis: &Visibility) {
        self.declared.insert(
            (scope.module_path.clone(), ident.to_string()),
            matches!(vis, Visibility::Public(_)),
        );
    }

    fn module_file(&self, module_dir: &Path, name: &str) -> BuildResult<PathBuf> {
        let flat = module_dir.join(format!("{name}.rs"));
        if flat.is_file() {
            return Ok(flat);
        }
        let nested = module_dir.join(name).join("mod.rs");
        if nested.is_file() {
            return Ok(nested);
        }
        Err(BuildError::synthesis(format!(
            "module `{name}` declared but {} not found",
            self.relative(&flat).display()
        )))
    }

    fn symbol_for(
        &self,
        self_ty: &Type,
        scope: &Scope<'_>,
        generics: &syn::Generics,
    ) -> Option<HandlerSymbol> {
        let Type::Path(type_path) = self_ty else {
            return None;
        };
        if type_path.qself.is_some() {
            return None;
        }

        let segments: Vec<String> = type_path
            .path
            .segments
            .iter()
            .map(|s| s.ident.to_string())
            .collect();
        let has_arguments = type_path
            .path
            .segments
            .iter()
            .any(|s| !s.arguments.is_empty());

        let (module_path, type_name) = resolve_type_path(&segments, &scope.module_path)?;

        Some(HandlerSymbol {
            type_name,
            module_path,
            file: self.relative(scope.file),
            reachable: scope.reachable,
            generic: has_arguments || !generics.params.is_empty(),
        })
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(self.root).unwrap_or(path).to_owned()
    }
}

/// Resolve a type path written inside `current` into (module path, type name).
fn resolve_type_path(segments: &[String], current: &[String]) -> Option<(Vec<String>, String)> {
    let (type_name, prefix) = segments.split_last()?;

    let mut module_path: Vec<String> = Vec::new();
    let mut rest = prefix.iter().peekable();

    match rest.peek().map(|s| s.as_str()) {
        Some("crate") => {
            rest.next();
        }
        Some("self") => {
            rest.next();
            module_path.extend(current.iter().cloned());
        }
        Some("super") => {
            module_path.extend(current.iter().cloned());
            while rest.peek().is_some_and(|s| *s == "super") {
                rest.next();
                module_path.pop()?;
            }
        }
        _ => module_path.extend(current.iter().cloned()),
    }

    module_path.extend(rest.cloned());
    Some((module_path, type_name.clone()))
}

fn is_cfg_test(attrs: &[Attribute]) -> bool {
    attrs.iter().any(|attr| {
        attr.path().is_ident("cfg")
            && attr
                .meta
                .require_list()
                .is_ok_and(|list| list.tokens.to_string() == "test")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, path: &str, contents: &str) {
        let full = root.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, contents).unwrap();
    }

    const MARKER: &str = "cirrus_sdk::FunctionHandler";

    #[test]
    fn finds_handler_in_nested_module() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/lib.rs", "pub mod handlers;\nmod util;");
        write(
            dir.path(),
            "src/handlers/mod.rs",
            "pub mod greet;\n",
        );
        write(
            dir.path(),
            "src/handlers/greet.rs",
            "#[derive(Default)] pub struct Greeter;\nimpl cirrus_sdk::FunctionHandler for Greeter {}\n",
        );
        write(dir.path(), "src/util.rs", "pub fn helper() {}");

        let found = RustIntrospector.find_marked(dir.path(), MARKER).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].qualified_name(), "handlers::greet::Greeter");
        assert_eq!(found[0].import_path("app"), "::app::handlers::greet::Greeter");
        assert_eq!(found[0].file, PathBuf::from("src/handlers/greet.rs"));
        assert!(found[0].reachable);
        assert!(!found[0].generic);
    }

    #[test]
    fn private_module_is_not_reachable() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "src/lib.rs",
            "mod inner { pub struct H; impl FunctionHandler for H {} }",
        );

        let found = RustIntrospector.find_marked(dir.path(), MARKER).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].qualified_name(), "inner::H");
        assert!(!found[0].reachable);
    }

    #[test]
    fn private_type_is_not_reachable() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/lib.rs", "pub mod handlers;");
        write(
            dir.path(),
            "src/handlers.rs",
            "struct Hidden;\npub(crate) struct Scoped;\nimpl FunctionHandler for Hidden {}\nimpl FunctionHandler for Scoped {}\n",
        );

        let found = RustIntrospector.find_marked(dir.path(), MARKER).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|h| !h.reachable));
    }

    #[test]
    fn impl_in_another_module_uses_declared_visibility() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "src/lib.rs",
            "pub mod model { pub struct Job; }\nmod wiring { impl FunctionHandler for crate::model::Job {} }\n",
        );

        let found = RustIntrospector.find_marked(dir.path(), MARKER).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].qualified_name(), "model::Job");
    }

    #[test]
    fn ignores_test_modules_orphans_and_other_traits() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "src/lib.rs",
            r#"
            pub struct Real;
            impl FunctionHandler for Real {}
            impl Clone for Real { fn clone(&self) -> Self { Real } }
            #[cfg(test)]
            mod tests { struct Fake; impl FunctionHandler for Fake {} }
            "#,
        );
        write(
            dir.path(),
            "src/orphan.rs",
            "pub struct Orphan; impl FunctionHandler for Orphan {}",
        );

        let found = RustIntrospector.find_marked(dir.path(), MARKER).unwrap();
        let names: Vec<_> = found.iter().map(HandlerSymbol::qualified_name).collect();
        assert_eq!(names, vec!["Real"]);
    }

    #[test]
    fn reports_every_match() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "src/lib.rs",
            "pub struct A; pub struct B; impl FunctionHandler for A {} impl FunctionHandler for B {}",
        );

        let found = RustIntrospector.find_marked(dir.path(), MARKER).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn missing_library_is_an_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/main.rs", "fn main() {}");

        let err = RustIntrospector.find_marked(dir.path(), MARKER).unwrap_err();
        assert!(matches!(err, BuildError::Synthesis(_)));
    }

    #[test]
    fn parse_failure_names_the_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/lib.rs", "pub mod broken;");
        write(dir.path(), "src/broken.rs", "fn (");

        let err = RustIntrospector.find_marked(dir.path(), MARKER).unwrap_err();
        match err {
            BuildError::SourceParse { path, .. } => assert_eq!(path, PathBuf::from("src/broken.rs")),
            other => panic!("expected SourceParse, got {other:?}"),
        }
    }

    #[test]
    fn resolves_relative_type_paths() {
        let current = vec!["a".to_owned(), "b".to_owned()];
        let seg = |s: &[&str]| s.iter().map(|x| (*x).to_owned()).collect::<Vec<_>>();

        assert_eq!(
            resolve_type_path(&seg(&["H"]), &current),
            Some((current.clone(), "H".to_owned()))
        );
        assert_eq!(
            resolve_type_path(&seg(&["crate", "x", "H"]), &current),
            Some((vec!["x".to_owned()], "H".to_owned()))
        );
        assert_eq!(
            resolve_type_path(&seg(&["super", "H"]), &current),
            Some((vec!["a".to_owned()], "H".to_owned()))
        );
        assert_eq!(resolve_type_path(&seg(&["super", "super", "super", "H"]), &current), None);
    }
}
