use chrono::{DateTime, Utc};

use crate::domain::{
    completed_audit_action, dropped_audit_action, soft_delete_audit_action, started_audit_action,
    AgentId, AssetGroupId, AuditLogCommandAction, CommandCompletedEvent, CommandDroppedEvent,
    CommandId, CommandRawDataEvent, CommandSoftDeletedEvent, CommandStartedEvent, EventHeader,
    ForceCompleteReasonCode, LifecycleEvent, LifecycleResult, PrivacyCommandType,
};

/// Who a command targets, shared by every event created for it
#[derive(Debug, Clone, PartialEq)]
pub struct CommandIdentity {
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    pub asset_group_qualifier: String,
    pub command_id: CommandId,
    pub command_type: PrivacyCommandType,
    pub command_creation_time: Option<DateTime<Utc>>,
}

impl CommandIdentity {
    fn header(&self, audit_log_command_action: AuditLogCommandAction) -> EventHeader {
        EventHeader {
            command_id: self.command_id,
            agent_id: self.agent_id,
            asset_group_id: self.asset_group_id,
            asset_group_qualifier: self.asset_group_qualifier.clone(),
            command_type: self.command_type,
            timestamp: Utc::now(),
            command_creation_time: self.command_creation_time,
            audit_log_command_action,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartedDetails {
    pub final_export_destination_uri: Option<String>,
    pub export_staging_destination_uri: Option<String>,
    pub export_staging_path: Option<String>,
    pub asset_group_stream_name: Option<String>,
    pub variant_stream_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletedDetails {
    pub affected_rows: i32,
    pub delinked: bool,
    pub claimed_variant_ids: Vec<String>,
    pub ignored_by_variant: bool,
    pub non_transient_exceptions: Option<String>,
    pub completed_by_pcf: bool,
    pub force_complete_reason_code: Option<ForceCompleteReasonCode>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DroppedDetails {
    pub not_applicable_reason_code: Option<String>,
    pub asset_group_stream_name: Option<String>,
    pub variant_stream_name: Option<String>,
}

pub fn command_started(identity: &CommandIdentity, details: StartedDetails) -> LifecycleEvent {
    LifecycleEvent::Started(CommandStartedEvent {
        header: identity.header(started_audit_action(identity.command_type)),
        final_export_destination_uri: details.final_export_destination_uri,
        export_staging_destination_uri: details.export_staging_destination_uri,
        export_staging_path: details.export_staging_path,
        asset_group_stream_name: details.asset_group_stream_name,
        variant_stream_name: details.variant_stream_name,
    })
}

/// Fails for a force-completed non-export outside a test environment
pub fn command_completed(
    identity: &CommandIdentity,
    details: CompletedDetails,
    test_environment: bool,
) -> LifecycleResult<LifecycleEvent> {
    let action = completed_audit_action(
        identity.command_type,
        details.force_complete_reason_code,
        test_environment,
    )?;

    Ok(LifecycleEvent::Completed(CommandCompletedEvent {
        header: identity.header(action),
        affected_rows: details.affected_rows,
        delinked: details.delinked,
        claimed_variant_ids: details.claimed_variant_ids,
        ignored_by_variant: details.ignored_by_variant,
        non_transient_exceptions: details.non_transient_exceptions,
        completed_by_pcf: details.completed_by_pcf,
        force_complete_reason_code: details.force_complete_reason_code,
    }))
}

pub fn command_soft_deleted(
    identity: &CommandIdentity,
    non_transient_exceptions: Option<String>,
) -> LifecycleEvent {
    LifecycleEvent::SoftDeleted(CommandSoftDeletedEvent {
        header: identity.header(soft_delete_audit_action(identity.command_type)),
        non_transient_exceptions,
    })
}

pub fn command_dropped(identity: &CommandIdentity, details: DroppedDetails) -> LifecycleEvent {
    LifecycleEvent::Dropped(CommandDroppedEvent {
        header: identity.header(dropped_audit_action(identity.command_type)),
        not_applicable_reason_code: details.not_applicable_reason_code,
        asset_group_stream_name: details.asset_group_stream_name,
        variant_stream_name: details.variant_stream_name,
    })
}

pub fn command_sent_to_agent(identity: &CommandIdentity) -> LifecycleEvent {
    LifecycleEvent::SentToAgent(identity.header(AuditLogCommandAction::None))
}

pub fn command_pending(identity: &CommandIdentity) -> LifecycleEvent {
    LifecycleEvent::Pending(identity.header(AuditLogCommandAction::None))
}

pub fn command_failed(identity: &CommandIdentity) -> LifecycleEvent {
    LifecycleEvent::Failed(identity.header(AuditLogCommandAction::None))
}

pub fn command_unexpected(identity: &CommandIdentity) -> LifecycleEvent {
    LifecycleEvent::Unexpected(identity.header(AuditLogCommandAction::None))
}

pub fn command_verification_failed(identity: &CommandIdentity) -> LifecycleEvent {
    LifecycleEvent::VerificationFailed(identity.header(AuditLogCommandAction::None))
}

pub fn command_unexpected_verification_failure(identity: &CommandIdentity) -> LifecycleEvent {
    LifecycleEvent::UnexpectedVerificationFailure(identity.header(AuditLogCommandAction::None))
}

/// Raw data is not bound to an agent or command. A random asset group id
/// spreads these events across partitions.
pub fn command_raw_data(pxs_commands: Vec<serde_json::Value>) -> LifecycleEvent {
    let identity = CommandIdentity {
        agent_id: AgentId::nil(),
        asset_group_id: AssetGroupId::random(),
        asset_group_qualifier: String::new(),
        command_id: CommandId::nil(),
        command_type: PrivacyCommandType::None,
        command_creation_time: None,
    };

    LifecycleEvent::RawData(CommandRawDataEvent {
        header: identity.header(AuditLogCommandAction::None),
        pxs_commands,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LifecycleError;

    fn identity(command_type: PrivacyCommandType) -> CommandIdentity {
        CommandIdentity {
            agent_id: AgentId::random(),
            asset_group_id: AssetGroupId::random(),
            asset_group_qualifier: "AssetType=AzureBlob".to_string(),
            command_id: CommandId::random(),
            command_type,
            command_creation_time: None,
        }
    }

    #[test]
    fn test_export_force_completed_by_ageout_timer() {
        let identity = identity(PrivacyCommandType::Export);
        let details = CompletedDetails {
            force_complete_reason_code: Some(ForceCompleteReasonCode::ForceCompleteFromAgeoutTimer),
            ..Default::default()
        };

        let event = command_completed(&identity, details, false).unwrap();

        assert_eq!(
            event.header().audit_log_command_action,
            AuditLogCommandAction::ExportFailedByAutoComplete
        );
        assert_eq!(event.command_id(), identity.command_id);
    }

    #[test]
    fn test_force_completed_delete_outside_test_environment_fails() {
        let identity = identity(PrivacyCommandType::Delete);
        let details = CompletedDetails {
            force_complete_reason_code: Some(
                ForceCompleteReasonCode::ForceCompleteFromManualOverride,
            ),
            ..Default::default()
        };

        let result = command_completed(&identity, details, false);

        assert!(matches!(result, Err(LifecycleError::Validation(_))));
    }

    #[test]
    fn test_started_and_dropped_carry_audit_action() {
        let identity = identity(PrivacyCommandType::AgeOut);

        let started = command_started(&identity, StartedDetails::default());
        let dropped = command_dropped(&identity, DroppedDetails::default());
        let soft_deleted = command_soft_deleted(&identity, None);

        assert_eq!(
            started.header().audit_log_command_action,
            AuditLogCommandAction::AgeOutStarted
        );
        assert_eq!(
            dropped.header().audit_log_command_action,
            AuditLogCommandAction::AgeOutDropped
        );
        assert_eq!(
            soft_deleted.header().audit_log_command_action,
            AuditLogCommandAction::SoftDelete
        );
    }

    #[test]
    fn test_raw_data_uses_random_asset_group() {
        let first = command_raw_data(vec![serde_json::json!({ "CommandId": "a" })]);
        let second = command_raw_data(vec![]);

        assert!(first.command_id().is_nil());
        assert!(first.header().agent_id.is_nil());
        assert!(!first.header().asset_group_id.is_nil());
        assert_ne!(first.header().asset_group_id, second.header().asset_group_id);
        assert_eq!(first.header().command_type, PrivacyCommandType::None);
    }
}
