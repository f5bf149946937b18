use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use common::flags::FeatureFlags;

pub const EXPORT_TEST_IN_PRODUCTION_PROPERTY: &str = "IsExportTestInProduction";
pub const PARTNER_TEST_PAGE_PORTAL: &str = "PartnerTestPage";

/// The parts of a raw front-door command needed for tagging
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RawCommandView {
    command_id: Option<String>,
    request_type: Option<String>,
    subject: Option<RawSubjectView>,
    portal: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RawSubjectView {
    #[serde(rename = "Type")]
    kind: Option<String>,
    tenant_id: Option<String>,
}

impl RawCommandView {
    fn is_export(&self) -> bool {
        self.request_type.as_deref() == Some("Export")
    }

    fn aad_tenant_id(&self) -> Option<&str> {
        let subject = self.subject.as_ref()?;
        let is_aad = subject
            .kind
            .as_deref()
            .is_some_and(|kind| kind.starts_with("Aad"));
        if is_aad {
            subject.tenant_id.as_deref()
        } else {
            None
        }
    }

    fn is_test_export(&self, flags: &dyn FeatureFlags) -> bool {
        if !self.is_export() {
            return false;
        }
        match self.aad_tenant_id() {
            Some(tenant_id) => flags.is_test_in_production_tenant(tenant_id),
            None => self.portal.as_deref() == Some(PARTNER_TEST_PAGE_PORTAL),
        }
    }
}

/// Sets `IsExportTestInProduction = true` on export commands issued from a
/// flighted AAD tenant or from the partner test page. Returns how many were tagged.
pub fn mark_export_test_in_production(commands: &mut [Value], flags: &dyn FeatureFlags) -> usize {
    let mut tagged = 0;
    for command in commands.iter_mut() {
        let Ok(view) = RawCommandView::deserialize(&*command) else {
            continue;
        };
        if !view.is_test_export(flags) {
            continue;
        }
        if let Value::Object(fields) = command {
            fields.insert(EXPORT_TEST_IN_PRODUCTION_PROPERTY.to_string(), Value::Bool(true));
            tagged += 1;
            info!(
                command_id = view.command_id.as_deref().unwrap_or_default(),
                "Marked export command as test in production"
            );
        }
    }
    tagged
}
