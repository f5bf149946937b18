use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::{
    AgentId, AssetGroupId, AuditLogCommandAction, CommandId, ForceCompleteReasonCode,
    LifecycleEventProcessor, LifecycleResult, PrivacyCommandType,
};

/// Identity fields shared by every lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    pub command_id: CommandId,
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    #[serde(default)]
    pub asset_group_qualifier: String,
    #[serde(default)]
    pub command_type: PrivacyCommandType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_creation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub audit_log_command_action: AuditLogCommandAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStartedEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_export_destination_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_staging_destination_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_staging_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_group_stream_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_stream_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandCompletedEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(default)]
    pub affected_rows: i32,
    #[serde(default)]
    pub delinked: bool,
    #[serde(default)]
    pub claimed_variant_ids: Vec<String>,
    #[serde(default)]
    pub ignored_by_variant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_transient_exceptions: Option<String>,
    #[serde(default)]
    pub completed_by_pcf: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_complete_reason_code: Option<ForceCompleteReasonCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSoftDeletedEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_transient_exceptions: Option<String>,
}

/// Carries the raw commands received from the ingestion front door
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRawDataEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(default)]
    pub pxs_commands: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDroppedEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_applicable_reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_group_stream_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_stream_name: Option<String>,
}

/// Discriminant of a lifecycle event, mapped one to one onto its wire name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEventKind {
    Started,
    Completed,
    SoftDeleted,
    SentToAgent,
    Pending,
    Failed,
    Unexpected,
    VerificationFailed,
    UnexpectedVerificationFailure,
    RawData,
    Dropped,
}

impl LifecycleEventKind {
    pub const ALL: [LifecycleEventKind; 11] = [
        LifecycleEventKind::Started,
        LifecycleEventKind::Completed,
        LifecycleEventKind::SoftDeleted,
        LifecycleEventKind::SentToAgent,
        LifecycleEventKind::Pending,
        LifecycleEventKind::Failed,
        LifecycleEventKind::Unexpected,
        LifecycleEventKind::VerificationFailed,
        LifecycleEventKind::UnexpectedVerificationFailure,
        LifecycleEventKind::RawData,
        LifecycleEventKind::Dropped,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEventKind::Started => "CommandStarted",
            LifecycleEventKind::Completed => "CommandCompleted",
            LifecycleEventKind::SoftDeleted => "CommandSoftDeleted",
            LifecycleEventKind::SentToAgent => "CommandSentToAgent",
            LifecycleEventKind::Pending => "CommandPending",
            LifecycleEventKind::Failed => "CommandFailed",
            LifecycleEventKind::Unexpected => "CommandUnexpected",
            LifecycleEventKind::VerificationFailed => "CommandVerificationFailed",
            LifecycleEventKind::UnexpectedVerificationFailure => {
                "CommandUnexpectedVerificationFailure"
            }
            LifecycleEventKind::RawData => "CommandRawData",
            LifecycleEventKind::Dropped => "CommandDropped",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "CommandStarted" => Some(LifecycleEventKind::Started),
            "CommandCompleted" => Some(LifecycleEventKind::Completed),
            "CommandSoftDeleted" => Some(LifecycleEventKind::SoftDeleted),
            "CommandSentToAgent" => Some(LifecycleEventKind::SentToAgent),
            "CommandPending" => Some(LifecycleEventKind::Pending),
            "CommandFailed" => Some(LifecycleEventKind::Failed),
            "CommandUnexpected" => Some(LifecycleEventKind::Unexpected),
            "CommandVerificationFailed" => Some(LifecycleEventKind::VerificationFailed),
            "CommandUnexpectedVerificationFailure" => {
                Some(LifecycleEventKind::UnexpectedVerificationFailure)
            }
            "CommandRawData" => Some(LifecycleEventKind::RawData),
            "CommandDropped" => Some(LifecycleEventKind::Dropped),
            _ => None,
        }
    }
}

impl fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single lifecycle transition of a privacy command
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Started(CommandStartedEvent),
    Completed(CommandCompletedEvent),
    SoftDeleted(CommandSoftDeletedEvent),
    SentToAgent(EventHeader),
    Pending(EventHeader),
    Failed(EventHeader),
    Unexpected(EventHeader),
    VerificationFailed(EventHeader),
    UnexpectedVerificationFailure(EventHeader),
    RawData(CommandRawDataEvent),
    Dropped(CommandDroppedEvent),
}

impl LifecycleEvent {
    pub fn kind(&self) -> LifecycleEventKind {
        match self {
            LifecycleEvent::Started(_) => LifecycleEventKind::Started,
            LifecycleEvent::Completed(_) => LifecycleEventKind::Completed,
            LifecycleEvent::SoftDeleted(_) => LifecycleEventKind::SoftDeleted,
            LifecycleEvent::SentToAgent(_) => LifecycleEventKind::SentToAgent,
            LifecycleEvent::Pending(_) => LifecycleEventKind::Pending,
            LifecycleEvent::Failed(_) => LifecycleEventKind::Failed,
            LifecycleEvent::Unexpected(_) => LifecycleEventKind::Unexpected,
            LifecycleEvent::VerificationFailed(_) => LifecycleEventKind::VerificationFailed,
            LifecycleEvent::UnexpectedVerificationFailure(_) => {
                LifecycleEventKind::UnexpectedVerificationFailure
            }
            LifecycleEvent::RawData(_) => LifecycleEventKind::RawData,
            LifecycleEvent::Dropped(_) => LifecycleEventKind::Dropped,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn header(&self) -> &EventHeader {
        match self {
            LifecycleEvent::Started(e) => &e.header,
            LifecycleEvent::Completed(e) => &e.header,
            LifecycleEvent::SoftDeleted(e) => &e.header,
            LifecycleEvent::RawData(e) => &e.header,
            LifecycleEvent::Dropped(e) => &e.header,
            LifecycleEvent::SentToAgent(h)
            | LifecycleEvent::Pending(h)
            | LifecycleEvent::Failed(h)
            | LifecycleEvent::Unexpected(h)
            | LifecycleEvent::VerificationFailed(h)
            | LifecycleEvent::UnexpectedVerificationFailure(h) => h,
        }
    }

    pub fn command_id(&self) -> CommandId {
        self.header().command_id
    }

    /// JSON body of the event, without its name
    pub fn to_payload(&self) -> LifecycleResult<serde_json::Value> {
        let value = match self {
            LifecycleEvent::Started(e) => serde_json::to_value(e)?,
            LifecycleEvent::Completed(e) => serde_json::to_value(e)?,
            LifecycleEvent::SoftDeleted(e) => serde_json::to_value(e)?,
            LifecycleEvent::RawData(e) => serde_json::to_value(e)?,
            LifecycleEvent::Dropped(e) => serde_json::to_value(e)?,
            LifecycleEvent::SentToAgent(h)
            | LifecycleEvent::Pending(h)
            | LifecycleEvent::Failed(h)
            | LifecycleEvent::Unexpected(h)
            | LifecycleEvent::VerificationFailed(h)
            | LifecycleEvent::UnexpectedVerificationFailure(h) => serde_json::to_value(h)?,
        };
        Ok(value)
    }

    pub fn from_payload(kind: LifecycleEventKind, payload: serde_json::Value) -> LifecycleResult<Self> {
        let event = match kind {
            LifecycleEventKind::Started => LifecycleEvent::Started(serde_json::from_value(payload)?),
            LifecycleEventKind::Completed => {
                LifecycleEvent::Completed(serde_json::from_value(payload)?)
            }
            LifecycleEventKind::SoftDeleted => {
                LifecycleEvent::SoftDeleted(serde_json::from_value(payload)?)
            }
            LifecycleEventKind::SentToAgent => {
                LifecycleEvent::SentToAgent(serde_json::from_value(payload)?)
            }
            LifecycleEventKind::Pending => LifecycleEvent::Pending(serde_json::from_value(payload)?),
            LifecycleEventKind::Failed => LifecycleEvent::Failed(serde_json::from_value(payload)?),
            LifecycleEventKind::Unexpected => {
                LifecycleEvent::Unexpected(serde_json::from_value(payload)?)
            }
            LifecycleEventKind::VerificationFailed => {
                LifecycleEvent::VerificationFailed(serde_json::from_value(payload)?)
            }
            LifecycleEventKind::UnexpectedVerificationFailure => {
                LifecycleEvent::UnexpectedVerificationFailure(serde_json::from_value(payload)?)
            }
            LifecycleEventKind::RawData => LifecycleEvent::RawData(serde_json::from_value(payload)?),
            LifecycleEventKind::Dropped => LifecycleEvent::Dropped(serde_json::from_value(payload)?),
        };
        Ok(event)
    }

    /// Hands the event to the processor method for its variant
    pub async fn apply<P>(&self, processor: &mut P) -> anyhow::Result<()>
    where
        P: LifecycleEventProcessor + ?Sized,
    {
        match self {
            LifecycleEvent::Started(e) => processor.process_started(e).await,
            LifecycleEvent::Completed(e) => processor.process_completed(e).await,
            LifecycleEvent::SoftDeleted(e) => processor.process_soft_deleted(e).await,
            LifecycleEvent::SentToAgent(h) => processor.process_sent_to_agent(h).await,
            LifecycleEvent::Pending(h) => processor.process_pending(h).await,
            LifecycleEvent::Failed(h) => processor.process_failed(h).await,
            LifecycleEvent::Unexpected(h) => processor.process_unexpected(h).await,
            LifecycleEvent::VerificationFailed(h) => {
                processor.process_verification_failed(h).await
            }
            LifecycleEvent::UnexpectedVerificationFailure(h) => {
                processor.process_unexpected_verification_failure(h).await
            }
            LifecycleEvent::RawData(e) => processor.process_raw_data(e).await,
            LifecycleEvent::Dropped(e) => processor.process_dropped(e).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn header() -> EventHeader {
        EventHeader {
            command_id: CommandId::new(Uuid::new_v4()),
            agent_id: AgentId::new(Uuid::new_v4()),
            asset_group_id: AssetGroupId::new(Uuid::new_v4()),
            asset_group_qualifier: "AssetType=CosmosStructuredStream".to_string(),
            command_type: PrivacyCommandType::Delete,
            timestamp: Utc::now(),
            command_creation_time: None,
            audit_log_command_action: AuditLogCommandAction::DeleteCompleted,
        }
    }

    #[test]
    fn test_every_kind_round_trips_through_its_name() {
        for kind in LifecycleEventKind::ALL {
            assert_eq!(LifecycleEventKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(LifecycleEventKind::from_name("noop"), None);
    }

    #[test]
    fn test_completed_payload_uses_camel_case_fields() {
        let event = LifecycleEvent::Completed(CommandCompletedEvent {
            header: header(),
            affected_rows: 7,
            delinked: true,
            claimed_variant_ids: vec!["v1".to_string()],
            ignored_by_variant: false,
            non_transient_exceptions: None,
            completed_by_pcf: false,
            force_complete_reason_code: None,
        });

        let payload = event.to_payload().unwrap();
        assert_eq!(payload["affectedRows"], 7);
        assert_eq!(payload["auditLogCommandAction"], "DeleteCompleted");
        assert!(payload.get("forceCompleteReasonCode").is_none());

        let back = LifecycleEvent::from_payload(LifecycleEventKind::Completed, payload).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_payload_of_wrong_shape_is_rejected() {
        let result = LifecycleEvent::from_payload(
            LifecycleEventKind::Pending,
            serde_json::json!({ "commandId": "not-a-uuid" }),
        );
        assert!(result.is_err());
    }
}
