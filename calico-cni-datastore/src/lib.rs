//! Datastore client for Calico CNI.
//!
//! Persists [`endpoint::WorkloadEndpoint`] and [`profile::Profile`] records in
//! either an etcdv3 cluster or the Kubernetes API (as custom resources), with
//! optimistic concurrency on every mutation. An in-process memory backend
//! backs the test suites.

pub mod backend;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod profile;

pub use backend::Datastore;
pub use config::{DatastoreConfig, DatastoreType};
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
