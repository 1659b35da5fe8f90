/// Condition message while provisioning has not completed yet.
pub const RECONCILING: &str = "Provisioning has not completed yet.";

/// Condition message once the tenant namespace exists.
pub const NAMESPACE_READY: &str = "The tenant namespace exists.";

/// Condition message once the provisioning Job has succeeded.
pub const PROVISIONED: &str = "All subordinate resources are ready.";

/// `status.errorMessage` prefix when the cleanup Job has exhausted its retry
/// budget and an operator has to step in.
pub const CLEANUP_STUCK: &str = "Cleanup Job exhausted its retry budget";
