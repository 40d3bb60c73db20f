//! Publishes the `kubectl describe`-visible events attached to a graph
//! record: a closed vocabulary of the things that actually happen to one
//! (validation, adoption, execution), rather than a free-form action/reason
//! pair a caller assembles by hand.
use k8s_openapi::{
    api::{core::v1::ObjectReference, events::v1::Event},
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
};
use kube::{api::PostParams, Api, Client};

/// Details about the component publishing events.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct EventSource {
    /// E.g. `pequod-operator`.
    pub controller_name: String,
    /// E.g. the controller's pod name.
    pub controller_pod_name: String,
}

/// Everything that gets an event recorded against a graph record.
///
/// An adopted resource's kind/name travels with the variant rather than a
/// generic `secondary_object` field, since adoption is the only case this
/// engine ever needs one for.
pub enum GraphEvent {
    PolicyViolation { violation_count: usize },
    ValidationFailed { message: String },
    ExecutionStarted,
    ResourceAdopted { kind: String, name: String },
    ResourceAdoptionFailed { kind: String, name: String, message: String },
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
}

#[derive(Clone, Copy)]
enum Severity {
    Normal,
    Warning,
}

impl GraphEvent {
    fn action(&self) -> &'static str {
        match self {
            Self::PolicyViolation { .. } | Self::ValidationFailed { .. } => "ValidateGraph",
            Self::ResourceAdopted { .. } | Self::ResourceAdoptionFailed { .. } => "AdoptResource",
            Self::ExecutionStarted | Self::ExecutionCompleted | Self::ExecutionFailed | Self::ExecutionCancelled => "ExecuteGraph",
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::PolicyViolation { .. } => "PolicyViolation",
            Self::ValidationFailed { .. } => "ValidationFailed",
            Self::ResourceAdopted { .. } => "AdoptionCompleted",
            Self::ResourceAdoptionFailed { .. } => "AdoptionFailed",
            Self::ExecutionStarted => "ExecutionStarted",
            Self::ExecutionCompleted => "ExecutionCompleted",
            Self::ExecutionFailed => "ExecutionFailed",
            Self::ExecutionCancelled => "ExecutionCancelled",
        }
    }

    fn note(&self) -> Option<String> {
        match self {
            Self::PolicyViolation { violation_count } => Some(format!("{violation_count} blocking violation(s) at render time")),
            Self::ValidationFailed { message } => Some(message.clone()),
            Self::ResourceAdopted { kind, name } => Some(format!("{kind}/{name}")),
            Self::ResourceAdoptionFailed { kind, name, message } => Some(format!("{kind}/{name}: {message}")),
            Self::ExecutionStarted => None,
            Self::ExecutionCompleted => Some("all nodes ready".into()),
            Self::ExecutionFailed => Some("one or more nodes entered Error".into()),
            Self::ExecutionCancelled => Some("execution was cancelled".into()),
        }
    }

    fn severity(&self) -> Severity {
        match self {
            Self::PolicyViolation { .. }
            | Self::ValidationFailed { .. }
            | Self::ResourceAdoptionFailed { .. }
            | Self::ExecutionFailed
            | Self::ExecutionCancelled => Severity::Warning,
            Self::ExecutionStarted | Self::ResourceAdopted { .. } | Self::ExecutionCompleted => Severity::Normal,
        }
    }
}

/// Publishes [`GraphEvent`]s attached to a fixed [`ObjectReference`].
#[derive(Clone)]
pub struct EventRecorder {
    event_client: Api<Event>,
    event_source: EventSource,
    object_reference: ObjectReference,
}

impl EventRecorder {
    pub fn new(client: Client, event_source: EventSource, object_reference: ObjectReference) -> Self {
        let event_client = match object_reference.namespace.as_ref() {
            None => Api::all(client),
            Some(namespace) => Api::namespaced(client, namespace),
        };
        Self { event_client, event_source, object_reference }
    }

    pub async fn publish(&self, event: GraphEvent) -> Result<(), kube::Error> {
        self.event_client
            .create(
                &PostParams::default(),
                &Event {
                    action: Some(event.action().to_string()),
                    reason: Some(event.reason().to_string()),
                    event_time: Some(MicroTime(chrono::Utc::now())),
                    regarding: Some(self.object_reference.clone()),
                    note: event.note(),
                    metadata: ObjectMeta {
                        namespace: self.object_reference.namespace.clone(),
                        generate_name: Some(format!("{}-", self.event_source.controller_name)),
                        ..Default::default()
                    },
                    reporting_controller: Some(self.event_source.controller_name.clone()),
                    reporting_instance: Some(self.event_source.controller_pod_name.clone()),
                    series: None,
                    type_: Some(
                        match event.severity() {
                            Severity::Normal => "Normal",
                            Severity::Warning => "Warning",
                        }
                        .to_string(),
                    ),
                    related: None,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adoption_failure_note_names_the_resource_and_the_error() {
        let event = GraphEvent::ResourceAdoptionFailed {
            kind: "ConfigMap".into(),
            name: "app-config".into(),
            message: "conflict".into(),
        };
        assert_eq!(event.note().as_deref(), Some("ConfigMap/app-config: conflict"));
        assert_eq!(event.action(), "AdoptResource");
        assert!(matches!(event.severity(), Severity::Warning));
    }

    #[test]
    fn execution_started_carries_no_note_and_is_normal_severity() {
        let event = GraphEvent::ExecutionStarted;
        assert_eq!(event.note(), None);
        assert!(matches!(event.severity(), Severity::Normal));
    }

    #[test]
    fn policy_violation_note_reports_the_count() {
        let event = GraphEvent::PolicyViolation { violation_count: 3 };
        assert_eq!(event.note().as_deref(), Some("3 blocking violation(s) at render time"));
    }
}
