// From experience, this lint is almost never useful. Disabling it globally.
#![allow(clippy::large_enum_variant)]

pub mod protocol;
pub mod store;

mod cluster;
mod coordinator;
mod error;
mod repository;
#[cfg(test)]
mod test_utils;
mod worker;

pub use self::{
    cluster::{Client, Cluster, ClusterBuilder, CreateOptions},
    error::{Error, Result},
    repository::{Repository, RepositoryData, SnapshotRecord},
    store::{BlobStore, FsStore, MemoryStore},
};
