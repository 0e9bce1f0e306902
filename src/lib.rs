//! Syncs custom resources between a remote (cloud) Kubernetes cluster and
//! the local (robot) Kubernetes cluster. Object existence and the spec part
//! are copied from upstream to downstream, and the status part is copied
//! from downstream to upstream.
//!
//! Which kinds are synced, and how, is controlled by annotations on their
//! CRDs:
//!
//! - `cr-syncer.cloudrobotics.com/filter-by-robot-name`: if `"true"`, only
//!   sync CRs that carry a label `cloudrobotics.com/robot-name: <robot-name>`
//!   matching the `--robot-name` command line argument.
//! - `cr-syncer.cloudrobotics.com/status-subtree`: if set, only the given
//!   top-level field of `status` is synced. This is useful for resources
//!   with a status shared between controllers in several clusters.
//! - `cr-syncer.cloudrobotics.com/spec-source`: if unset or `"cloud"`, the
//!   source of truth for object existence and specs is the remote cluster
//!   and for status it is the local cluster. `"robot"` reverses the roles.

pub mod annotations;
pub mod cluster;
pub mod crd;
pub mod error;
pub mod informer;
pub mod merge;
pub mod queue;
pub mod supervisor;
pub mod syncer;
pub mod transport;

pub use error::SyncError;
