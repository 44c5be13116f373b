//! karchive filters: compiles per-namespace and cluster-wide policy
//! expressions and answers "must archive?" / "must delete?" for a resource.

#![forbid(unsafe_code)]

mod filters;
pub mod handle;
pub mod predicate;

pub use filters::{
    directory_files, Action, FilterKey, FilterSet, FilterSetBuilder, LoadError, LoadErrors, PolicyDefinition,
    PolicySelector, Scope, GLOBAL_SCOPE,
};
pub use handle::{spawn_reload, FilterHandle};
pub use predicate::{compile, CompileError, CompiledPredicate};
