//! Core vocabulary for the tenancy syncer.
//!
//! This crate defines the pieces shared by every other syncer crate:
//!
//! - [`client`]: the object store client traits ([`ObjectApi`],
//!   [`ClusterClient`]) through which both the super control plane and each
//!   tenant control plane are reached, plus the [`SyncedObject`] capability
//!   trait implemented by every governed resource kind.
//! - [`error`]: the error taxonomy. [`ApiError`] classifies object store
//!   failures (not-found, conflict, ...), [`SyncError`] classifies
//!   reconcile outcomes.
//! - [`conversion`]: the ownership mapping that ties a super cluster object
//!   back to its tenant owner, namespace mapping, and the per-kind
//!   equality checks used by both the reactive and the patrol paths.
//! - [`meta`]: accessor helpers over [`ObjectMeta`] carrying types.
//!
//! The crate deliberately has no runtime dependencies: everything that
//! spawns tasks or owns queues lives in `syncer-runtime`.
//!
//! [`ObjectApi`]: client::ObjectApi
//! [`ClusterClient`]: client::ClusterClient
//! [`SyncedObject`]: client::SyncedObject
//! [`ApiError`]: error::ApiError
//! [`SyncError`]: error::SyncError
//! [`ObjectMeta`]: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta

pub mod client;
pub mod constants;
pub mod conversion;
pub mod error;
pub mod meta;

pub use client::{ClusterClient, DeleteOptions, ObjectApi, SyncedObject, WatchEvent};
pub use error::{ApiError, Result, SyncError};
pub use meta::ObjectExt;
