use std::time::Duration;

pub mod patch;

#[cfg(feature = "metrics")]
pub mod metrics;

pub(crate) mod colors;
pub(crate) mod events;
pub(crate) mod finalizer;
pub(crate) mod messages;

mod error;

pub use error::*;

use const_format::concatcp;

/// API group of the SupabaseInstance resource.
pub(crate) const GROUP: &str = "supacontrol.io";

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "supacontrol-operator";

/// Finalizer guarding tenant teardown. Removed only after a cleanup Job is
/// observed to have succeeded.
pub(crate) const FINALIZER_NAME: &str = concatcp!(GROUP, "/cleanup");

/// Interval between Job status polls while a Job is running or pending.
pub(crate) const JOB_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Re-probe interval for a healthy Running instance.
pub(crate) const RUNNING_PROBE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Re-probe interval for a Failed instance awaiting operator action.
pub(crate) const FAILED_PROBE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Retry interval after a cleanup Job has exhausted its backoff budget.
pub(crate) const CLEANUP_RETRY_INTERVAL: Duration = Duration::from_secs(30);
