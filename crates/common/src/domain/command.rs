use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::{LifecycleError, LifecycleResult};

/// The kind of privacy command a lifecycle event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PrivacyCommandType {
    #[default]
    None,
    Delete,
    Export,
    AccountClose,
    AgeOut,
}

impl fmt::Display for PrivacyCommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrivacyCommandType::None => "None",
            PrivacyCommandType::Delete => "Delete",
            PrivacyCommandType::Export => "Export",
            PrivacyCommandType::AccountClose => "AccountClose",
            PrivacyCommandType::AgeOut => "AgeOut",
        };
        f.write_str(name)
    }
}

/// Why a command was marked complete without agent confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForceCompleteReasonCode {
    ForceCompleteFromAgeoutTimer,
    ForceCompleteFromPartnerTestPage,
    ForceCompleteFromManualOverride,
}

/// Action recorded in the audit log for a lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AuditLogCommandAction {
    #[default]
    None,
    DeleteStarted,
    ExportStarted,
    AccountCloseStarted,
    AgeOutStarted,
    DeleteCompleted,
    ExportCompleted,
    AccountCloseCompleted,
    AgeOutCompleted,
    ExportFailedByAutoComplete,
    ExportFailedByManualComplete,
    SoftDelete,
    DeleteDropped,
    ExportDropped,
    AccountCloseDropped,
    AgeOutDropped,
}

pub fn started_audit_action(command_type: PrivacyCommandType) -> AuditLogCommandAction {
    match command_type {
        PrivacyCommandType::None => AuditLogCommandAction::None,
        PrivacyCommandType::Delete => AuditLogCommandAction::DeleteStarted,
        PrivacyCommandType::Export => AuditLogCommandAction::ExportStarted,
        PrivacyCommandType::AccountClose => AuditLogCommandAction::AccountCloseStarted,
        PrivacyCommandType::AgeOut => AuditLogCommandAction::AgeOutStarted,
    }
}

pub fn dropped_audit_action(command_type: PrivacyCommandType) -> AuditLogCommandAction {
    match command_type {
        PrivacyCommandType::None => AuditLogCommandAction::None,
        PrivacyCommandType::Delete => AuditLogCommandAction::DeleteDropped,
        PrivacyCommandType::Export => AuditLogCommandAction::ExportDropped,
        PrivacyCommandType::AccountClose => AuditLogCommandAction::AccountCloseDropped,
        PrivacyCommandType::AgeOut => AuditLogCommandAction::AgeOutDropped,
    }
}

pub fn soft_delete_audit_action(command_type: PrivacyCommandType) -> AuditLogCommandAction {
    match command_type {
        PrivacyCommandType::None => AuditLogCommandAction::None,
        _ => AuditLogCommandAction::SoftDelete,
    }
}

/// Maps a completion to its audit action.
///
/// Only exports may be force completed in production; a force-completed delete,
/// account close or age out outside a test environment is a caller bug.
pub fn completed_audit_action(
    command_type: PrivacyCommandType,
    force_complete_reason_code: Option<ForceCompleteReasonCode>,
    test_environment: bool,
) -> LifecycleResult<AuditLogCommandAction> {
    match (command_type, force_complete_reason_code) {
        (PrivacyCommandType::Export, Some(ForceCompleteReasonCode::ForceCompleteFromAgeoutTimer)) => {
            Ok(AuditLogCommandAction::ExportFailedByAutoComplete)
        }
        (PrivacyCommandType::Export, Some(_)) => {
            Ok(AuditLogCommandAction::ExportFailedByManualComplete)
        }
        (_, Some(_)) if test_environment => Ok(AuditLogCommandAction::None),
        (other, Some(reason)) => Err(LifecycleError::Validation(format!(
            "command of type {other} should not be force completed (reason {reason:?})"
        ))),
        (PrivacyCommandType::None, None) => Ok(AuditLogCommandAction::None),
        (PrivacyCommandType::Delete, None) => Ok(AuditLogCommandAction::DeleteCompleted),
        (PrivacyCommandType::Export, None) => Ok(AuditLogCommandAction::ExportCompleted),
        (PrivacyCommandType::AccountClose, None) => {
            Ok(AuditLogCommandAction::AccountCloseCompleted)
        }
        (PrivacyCommandType::AgeOut, None) => Ok(AuditLogCommandAction::AgeOutCompleted),
    }
}
