use crate::util::MANAGER_NAME;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use owo_colors::OwoColorize;
use supacontrol_types::SupabaseInstance;

/// Builds the event recorder shared by all write-phase actions.
pub fn recorder(client: Client) -> Recorder {
    let reporter = Reporter {
        controller: MANAGER_NAME.to_string(),
        instance: std::env::var("POD_NAME").ok(),
    };
    Recorder::new(client, reporter)
}

/// Publishes a Kubernetes event for the instance so phase transitions and
/// failures show up in `kubectl describe`. Delivery is best effort; a failed
/// publish never fails the reconcile pass that produced it.
pub async fn publish(
    recorder: &Recorder,
    instance: &SupabaseInstance,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note),
        action: "Reconcile".to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(&event, &instance.object_ref(&())).await {
        eprintln!("{}", format!("failed to publish event: {e}").yellow());
    }
}
