//! Repository access: checkout, snapshot inspection and the shared read cache.

pub mod cache;
pub mod cloner;
pub mod code;
pub mod inspector;

#[cfg(test)]
pub mod fixture;

pub use cache::ContentCache;
pub use cloner::{clone_repository, open_local_repository, CloneOptions};
pub use inspector::{GitInspector, LineRange, RepositoryInspector};
