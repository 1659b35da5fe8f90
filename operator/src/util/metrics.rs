use prometheus::{HistogramVec, IntCounterVec, register_histogram_vec, register_int_counter_vec};

/// Per-controller Prometheus instrumentation. Everything registers against
/// the default registry; the scrape server in `crate::metrics` gathers it.
pub struct ControllerMetrics {
    /// Total reconcile passes per resource.
    pub reconcile_counter: IntCounterVec,

    /// Reconcile actions taken, by action kind.
    pub action_counter: IntCounterVec,

    /// Duration of the read phase of reconciliation.
    pub read_histogram: HistogramVec,

    /// Duration of the write phase of reconciliation.
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    /// Registers the metric family for one controller. Must be called at
    /// most once per controller name per process.
    pub fn new(controller: &str) -> Self {
        ControllerMetrics {
            reconcile_counter: register_int_counter_vec!(
                format!("supacontrol_{controller}_reconciles_total"),
                "Total number of reconcile passes.",
                &["name"]
            )
            .expect("register reconcile counter"),
            action_counter: register_int_counter_vec!(
                format!("supacontrol_{controller}_actions_total"),
                "Number of reconcile actions taken, by action.",
                &["name", "action"]
            )
            .expect("register action counter"),
            read_histogram: register_histogram_vec!(
                format!("supacontrol_{controller}_read_seconds"),
                "Duration of the read phase of reconciliation.",
                &["name", "action"]
            )
            .expect("register read histogram"),
            write_histogram: register_histogram_vec!(
                format!("supacontrol_{controller}_write_seconds"),
                "Duration of the write phase of reconciliation.",
                &["name", "action"]
            )
            .expect("register write histogram"),
        }
    }
}
