//! Command dispatch onto the bus.
//!
//! A command is a "set desired configuration" request addressed to
//! `pioreactor/<unit>/<experiment>/<subsystem...>/set`. It is published at the
//! highest QoS tier and reported as done once the publish call returns: there
//! is no device acknowledgement and no command id, so a redelivered command is
//! indistinguishable from a repeated user action. That is acceptable only
//! because setting the same configuration twice is harmless.

use crate::api::AutomationDefinition;
use crate::bus::BusPublisher;
use crate::error::{PublishError, TopicError};
use crate::identity::IdentityMap;
use crate::topic::{command_topic, Topic, DOSING_SUBSYSTEM, SET_ACTION};
use rumqttc::QoS;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};

pub const COMMAND_QOS: QoS = QoS::ExactlyOnce;

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    target_unit: String,
    experiment: String,
    subsystem_path: Vec<String>,
    action: String,
    body: Map<String, Value>,
}

impl Command {
    pub fn new(
        target_unit: impl Into<String>,
        experiment: impl Into<String>,
        subsystem_path: Vec<String>,
        action: impl Into<String>,
        body: Map<String, Value>,
    ) -> Self {
        Self {
            target_unit: target_unit.into(),
            experiment: experiment.into(),
            subsystem_path,
            action: action.into(),
            body,
        }
    }

    /// `pioreactor/<unit>/<experiment>/dosing_control/dosing_automation/set`
    pub fn dosing_automation(
        target_unit: impl Into<String>,
        experiment: impl Into<String>,
        automation: DosingAutomation,
    ) -> Self {
        Self::new(
            target_unit,
            experiment,
            DOSING_SUBSYSTEM.iter().map(|s| s.to_string()).collect(),
            SET_ACTION,
            automation.into_body(),
        )
    }

    pub fn target_unit(&self) -> &str {
        &self.target_unit
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn topic(&self) -> Result<Topic, TopicError> {
        command_topic(
            &self.target_unit,
            &self.experiment,
            &self.subsystem_path,
            &self.action,
        )
    }

    pub fn payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.body)
    }
}

/// Body of a dosing automation change: `{automation_key, skip_first_run, ...fields}`.
#[derive(Debug, Clone, PartialEq)]
pub struct DosingAutomation {
    automation_key: String,
    skip_first_run: bool,
    fields: Map<String, Value>,
}

impl DosingAutomation {
    pub fn new(automation_key: impl Into<String>) -> Self {
        Self {
            automation_key: automation_key.into(),
            skip_first_run: false,
            fields: Map::new(),
        }
    }

    pub fn skip_first_run(mut self, skip: bool) -> Self {
        self.skip_first_run = skip;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Every declared field, taking the user's value where given and the
    /// catalogue default otherwise. Fields with neither are left out.
    pub fn from_definition(definition: &AutomationDefinition, values: &Map<String, Value>) -> Self {
        let mut automation = Self::new(definition.key.clone());
        for field in &definition.fields {
            let value = values
                .get(&field.key)
                .cloned()
                .or_else(|| field.default.clone())
                .filter(|v| !v.is_null());
            if let Some(value) = value {
                automation.fields.insert(field.key.clone(), value);
            }
        }
        automation
    }

    pub fn into_body(self) -> Map<String, Value> {
        let mut body = self.fields;
        body.insert("automation_key".into(), Value::String(self.automation_key));
        body.insert("skip_first_run".into(), Value::Bool(self.skip_first_run));
        body
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReceipt {
    pub topic: String,
    pub unit: String,
    pub label: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct CommandDispatcher {
    bus: Arc<dyn BusPublisher>,
}

impl CommandDispatcher {
    pub fn new(bus: Arc<dyn BusPublisher>) -> Self {
        Self { bus }
    }

    /// Publishes `command`; success means the bus accepted it, nothing more.
    pub async fn dispatch(
        &self,
        command: &Command,
        labels: &IdentityMap,
    ) -> Result<DispatchReceipt, PublishError> {
        let topic = command.topic()?.to_string();
        let payload = command.payload()?;
        let label = labels.resolve(command.target_unit()).to_string();

        if let Err(e) = self.bus.publish(&topic, payload, COMMAND_QOS).await {
            warn!(%topic, unit = %label, error = %e, "command not sent");
            return Err(e);
        }
        info!(%topic, unit = %label, "command sent");
        Ok(DispatchReceipt {
            topic,
            unit: command.target_unit().to_string(),
            label,
            sent_at: OffsetDateTime::now_utc(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AutomationField;
    use crate::bus::ConnectionState;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingBus {
        sent: Mutex<Vec<(String, Vec<u8>, QoS)>>,
        down: bool,
    }

    #[async_trait]
    impl BusPublisher for RecordingBus {
        async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
            if self.down {
                return Err(PublishError::NotConnected {
                    state: ConnectionState::Disconnected,
                });
            }
            self.sent.lock().push((topic.to_string(), payload, qos));
            Ok(())
        }

        fn state(&self) -> ConnectionState {
            if self.down {
                ConnectionState::Disconnected
            } else {
                ConnectionState::Connected
            }
        }
    }

    #[tokio::test]
    async fn publishes_dosing_command_at_highest_qos() {
        let bus = Arc::new(RecordingBus::default());
        let dispatcher = CommandDispatcher::new(bus.clone());
        let command = Command::dosing_automation(
            "u1",
            "expA",
            DosingAutomation::new("pid_morbidostat").skip_first_run(true),
        );

        let receipt = dispatcher.dispatch(&command, &IdentityMap::default()).await.unwrap();

        let sent = bus.sent.lock();
        assert_eq!(sent.len(), 1);
        let (topic, payload, qos) = &sent[0];
        assert_eq!(topic, "pioreactor/u1/expA/dosing_control/dosing_automation/set");
        assert_eq!(*qos, QoS::ExactlyOnce);
        let body: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(body, json!({"automation_key": "pid_morbidostat", "skip_first_run": true}));
        assert_eq!(receipt.topic, *topic);
        assert_eq!(receipt.label, "u1");
    }

    #[tokio::test]
    async fn transport_failure_is_returned_to_caller() {
        let bus = Arc::new(RecordingBus {
            down: true,
            ..Default::default()
        });
        let dispatcher = CommandDispatcher::new(bus);
        let command = Command::dosing_automation("u1", "expA", DosingAutomation::new("silent"));

        let err = dispatcher
            .dispatch(&command, &IdentityMap::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn invalid_address_is_rejected_before_publishing() {
        let bus = Arc::new(RecordingBus::default());
        let dispatcher = CommandDispatcher::new(bus.clone());
        let command = Command::dosing_automation("u1", "exp/A", DosingAutomation::new("silent"));

        let err = dispatcher
            .dispatch(&command, &IdentityMap::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Topic(_)));
        assert!(bus.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn receipt_carries_display_label() {
        let bus = Arc::new(RecordingBus::default());
        let dispatcher = CommandDispatcher::new(bus);
        let labels: IdentityMap = [("u1".to_string(), "Reactor A".to_string())]
            .into_iter()
            .collect();
        let command = Command::dosing_automation("u1", "expA", DosingAutomation::new("silent"));

        let receipt = dispatcher.dispatch(&command, &labels).await.unwrap();
        assert_eq!(receipt.unit, "u1");
        assert_eq!(receipt.label, "Reactor A");
    }

    #[test]
    fn definition_defaults_fill_missing_values() {
        let definition = AutomationDefinition {
            key: "chemostat".into(),
            name: "Chemostat".into(),
            description: String::new(),
            fields: vec![
                AutomationField {
                    key: "volume".into(),
                    default: Some(json!(0.5)),
                    unit: Some("mL".into()),
                    label: Some("Volume".into()),
                    disabled: false,
                    kind: "numeric".into(),
                },
                AutomationField {
                    key: "duration".into(),
                    default: Some(json!(20)),
                    unit: Some("min".into()),
                    label: Some("Period".into()),
                    disabled: true,
                    kind: "numeric".into(),
                },
                AutomationField {
                    key: "note".into(),
                    default: None,
                    unit: None,
                    label: None,
                    disabled: false,
                    kind: "string".into(),
                },
            ],
        };
        let mut values = Map::new();
        values.insert("volume".into(), json!(1.0));

        let body = DosingAutomation::from_definition(&definition, &values).into_body();
        assert_eq!(
            Value::Object(body),
            json!({"automation_key": "chemostat", "skip_first_run": false, "volume": 1.0, "duration": 20})
        );
    }
}
