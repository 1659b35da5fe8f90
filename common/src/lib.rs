pub mod shutdown;

/// Well-known label keys stamped on every object the operator manages.
pub mod labels {
    /// Marks an object as managed by this operator.
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    /// Value written under [`MANAGED_BY`].
    pub const MANAGER: &str = "supacontrol";
    /// Binds a subordinate object to its owning SupabaseInstance.
    pub const INSTANCE: &str = "instance";
    /// Distinguishes provisioning Jobs from cleanup Jobs.
    pub const OPERATION: &str = "operation";
}

/// Writes the readiness file probed by the container's readiness check.
pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}
