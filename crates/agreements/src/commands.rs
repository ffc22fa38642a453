//! Command names and payload shapes accepted by the agreement handlers.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::agreement::{AgreementAttrs, AlertKind};

pub const CREATE: &str = "agreement.create";
pub const UPDATE_ATTRS: &str = "agreement.update_attrs";
pub const DELETE: &str = "agreement.delete";
pub const MARK_EXPIRATION_ALERT_SENT: &str = "agreement.mark_expiration_alert_sent";
pub const MARK_OUTCOME_NOTICE_ALERT_SENT: &str = "agreement.mark_outcome_notice_alert_sent";

/// Command that marks the `kind` alert sent.
pub fn mark_alert_sent(kind: AlertKind) -> &'static str {
    match kind {
        AlertKind::Expiration => MARK_EXPIRATION_ALERT_SENT,
        AlertKind::OutcomeNotice => MARK_OUTCOME_NOTICE_ALERT_SENT,
    }
}

/// Payload of `agreement.create`. The target id is optional on the command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAgreement {
    pub user_id: String,
    #[serde(flatten)]
    pub attrs: AgreementAttrs,
}

/// Payload of `agreement.update_attrs`: the full replacement attribute set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAgreementAttrs {
    #[serde(flatten)]
    pub attrs: AgreementAttrs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAgreement {
    pub deleted_by: String,
}

/// Payload of both `agreement.mark_*_alert_sent` commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkAlertSent {
    /// The scheduled date the sender saw, as reported by the alerts read model.
    pub alert_date: NaiveDate,
}
