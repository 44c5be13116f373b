use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use karchive_core::{Gvk, ResourceView};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::predicate::{compile, CompileError, CompiledPredicate};

/// File name reserved for cluster-wide policies.
pub const GLOBAL_SCOPE: &str = "_global";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Namespace(String),
}

impl Scope {
    pub fn from_file_name(name: &str) -> Self {
        if name == GLOBAL_SCOPE {
            Scope::Global
        } else {
            Scope::Namespace(name.to_string())
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str(GLOBAL_SCOPE),
            Scope::Namespace(ns) => f.write_str(ns),
        }
    }
}

/// `scope:GVK` key of a predicate mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterKey {
    pub scope: Scope,
    pub gvk: Gvk,
}

impl FilterKey {
    pub fn new(scope: Scope, gvk: Gvk) -> Self { Self { scope, gvk } }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.gvk)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicySelector {
    pub api_version: String,
    pub kind: String,
}

/// One entry of a namespace policy file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDefinition {
    pub selector: PolicySelector,
    /// Blank means no archive predicate.
    #[serde(default)]
    pub archive_when: String,
    /// Blank means no delete predicate.
    #[serde(default)]
    pub delete_when: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Archive,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Archive => f.write_str("archiveWhen"),
            Action::Delete => f.write_str("deleteWhen"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("policy directory is not configured")]
    NotConfigured,
    #[error("policy directory {0} is not mounted")]
    NotMounted(PathBuf),
    #[error("cannot read policy directory {path}: {source}")]
    ReadDir { path: PathBuf, source: io::Error },
    #[error("cannot read policy file {path}: {source}")]
    ReadFile { path: PathBuf, source: io::Error },
    #[error("cannot parse policy file {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("{action} for {key}: {source}")]
    Compile { key: FilterKey, action: Action, source: CompileError },
    #[error("no usable policy definitions found in {0}")]
    NoDefinitions(PathBuf),
}

/// Every error collected while building a [`FilterSet`], joined one per line.
#[derive(Debug, Default)]
pub struct LoadErrors(Vec<LoadError>);

impl LoadErrors {
    pub fn push(&mut self, e: LoadError) { self.0.push(e); }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn iter(&self) -> std::slice::Iter<'_, LoadError> { self.0.iter() }
    pub fn into_inner(self) -> Vec<LoadError> { self.0 }
}

impl fmt::Display for LoadErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for LoadErrors {}

/// Immutable archive/delete predicates keyed by scope and GVK.
#[derive(Debug, Default)]
pub struct FilterSet {
    archive: FxHashMap<FilterKey, CompiledPredicate>,
    delete: FxHashMap<FilterKey, CompiledPredicate>,
}

impl FilterSet {
    /// A set that archives and deletes nothing.
    pub fn empty() -> Self { Self::default() }

    pub fn archive_len(&self) -> usize { self.archive.len() }
    pub fn delete_len(&self) -> usize { self.delete.len() }
    pub fn is_empty(&self) -> bool { self.archive.is_empty() && self.delete.is_empty() }

    /// Build from a mounted policy directory, one file per namespace.
    ///
    /// The returned set is always usable: it holds every predicate that
    /// compiled, and the errors describe everything that did not.
    pub fn build(path: impl AsRef<Path>) -> (Self, Option<LoadErrors>) {
        let path = path.as_ref();
        let mut builder = FilterSetBuilder::new();
        if path.as_os_str().is_empty() {
            builder.errors.push(LoadError::NotConfigured);
            return builder.finish();
        }
        let files = match directory_files(path) {
            Ok(files) => files,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                builder.errors.push(LoadError::NotMounted(path.to_path_buf()));
                return builder.finish();
            }
            Err(source) => {
                builder.errors.push(LoadError::ReadDir { path: path.to_path_buf(), source });
                return builder.finish();
            }
        };
        for (name, file) in files {
            let bytes = match fs::read(&file) {
                Ok(b) => b,
                Err(source) => {
                    builder.errors.push(LoadError::ReadFile { path: file, source });
                    continue;
                }
            };
            if bytes.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_yaml::from_slice::<Vec<PolicyDefinition>>(&bytes) {
                Ok(defs) => builder.add(Scope::from_file_name(&name), &defs),
                Err(source) => builder.errors.push(LoadError::Parse { path: file, source }),
            }
        }
        if builder.set.is_empty() {
            builder.errors.push(LoadError::NoDefinitions(path.to_path_buf()));
        }
        builder.finish()
    }

    /// Delete implies archive; otherwise the global then the namespace archive
    /// predicate for the resource's GVK decide.
    pub fn must_archive(&self, resource: Option<&ResourceView>) -> bool {
        let Some(r) = resource else { return false };
        self.must_delete(Some(r)) || self.any_true(&self.archive, r)
    }

    /// Global then namespace delete predicate for the resource's GVK.
    pub fn must_delete(&self, resource: Option<&ResourceView>) -> bool {
        let Some(r) = resource else { return false };
        self.any_true(&self.delete, r)
    }

    fn any_true(&self, map: &FxHashMap<FilterKey, CompiledPredicate>, r: &ResourceView) -> bool {
        let global = FilterKey::new(Scope::Global, r.gvk().clone());
        if map.get(&global).is_some_and(|p| p.evaluate(r)) {
            return true;
        }
        let namespaced = FilterKey::new(Scope::Namespace(r.namespace().to_string()), r.gvk().clone());
        map.get(&namespaced).is_some_and(|p| p.evaluate(r))
    }
}

/// Accumulates predicates and errors. Later definitions for an existing key
/// overwrite earlier ones.
#[derive(Debug, Default)]
pub struct FilterSetBuilder {
    set: FilterSet,
    errors: LoadErrors,
}

impl FilterSetBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, scope: Scope, defs: &[PolicyDefinition]) {
        for def in defs {
            let gvk = Gvk::from_api_version_kind(&def.selector.api_version, &def.selector.kind);
            let key = FilterKey::new(scope.clone(), gvk);
            for (action, expr) in [(Action::Archive, &def.archive_when), (Action::Delete, &def.delete_when)] {
                if expr.trim().is_empty() {
                    continue;
                }
                match compile(expr) {
                    Ok(p) => {
                        let map = match action {
                            Action::Archive => &mut self.set.archive,
                            Action::Delete => &mut self.set.delete,
                        };
                        map.insert(key.clone(), p);
                    }
                    Err(source) => self.errors.push(LoadError::Compile { key: key.clone(), action, source }),
                }
            }
        }
    }

    pub fn finish(self) -> (FilterSet, Option<LoadErrors>) {
        let errors = if self.errors.is_empty() { None } else { Some(self.errors) };
        (self.set, errors)
    }
}

/// Regular files in `path` sorted by name, skipping sub-directories and the
/// `..`-prefixed entries a ConfigMap mount uses for atomic updates.
pub fn directory_files(path: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let file = entry.path();
        if name.starts_with("..") || file.is_dir() {
            continue;
        }
        out.push((name, file));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}
