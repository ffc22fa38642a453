use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use covenant_core::{
    Aggregate, AggregateRoot, DomainError, DomainEvent, DomainResult, Event, StreamId, decode_payload,
    encode_payload,
};

use crate::terms::{AgreementKind, Term};

/// `event_type` recorded on every agreement event.
pub const AGGREGATE_TYPE: &str = "Agreement";

/// The two reminders an agreement can schedule.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// The agreement's term ends.
    Expiration,
    /// Last day to notify the counterparty before the term ends.
    OutcomeNotice,
}

impl AlertKind {
    pub const ALL: [AlertKind; 2] = [AlertKind::Expiration, AlertKind::OutcomeNotice];
}

impl core::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            AlertKind::Expiration => "expiration",
            AlertKind::OutcomeNotice => "outcome notice",
        })
    }
}

/// Editable attributes of an agreement (shared by create and update).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementAttrs {
    pub name: String,
    pub counterparty: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: AgreementKind,
    pub execution_date: NaiveDate,
    pub term: Term,
    #[serde(default)]
    pub auto_renew: bool,
    #[serde(default)]
    pub outcome_notice: Option<Term>,
    #[serde(default)]
    pub expiration_alert_enabled: bool,
    #[serde(default)]
    pub outcome_notice_alert_enabled: bool,
}

impl AgreementAttrs {
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if self.counterparty.trim().is_empty() {
            return Err(DomainError::validation("counterparty cannot be empty"));
        }
        if self.term.amount == 0 {
            return Err(DomainError::validation("term must be at least one unit long"));
        }
        if self.term.after(self.execution_date).is_none() {
            return Err(DomainError::validation("term runs past the supported calendar"));
        }
        if let Some(notice) = self.outcome_notice {
            if notice.amount == 0 {
                return Err(DomainError::validation("outcome notice must be at least one unit long"));
            }
            // Compared on the calendar: 12 months and 1 year are the same length.
            match self.outcome_notice_date() {
                Some(notice_date) if notice_date > self.execution_date => {}
                _ => return Err(DomainError::validation("outcome notice must be shorter than the term")),
            }
        }
        if self.outcome_notice_alert_enabled && self.outcome_notice.is_none() {
            return Err(DomainError::validation("outcome notice alert requires an outcome notice period"));
        }
        Ok(())
    }

    /// Day the initial term ends.
    pub fn expiration_date(&self) -> Option<NaiveDate> {
        self.term.after(self.execution_date)
    }

    /// Last day to give notice before the term ends.
    pub fn outcome_notice_date(&self) -> Option<NaiveDate> {
        let notice = self.outcome_notice?;
        notice.before(self.expiration_date()?)
    }

    /// Day the `kind` alert falls on; `None` while that alert is switched off.
    pub fn alert_date(&self, kind: AlertKind) -> Option<NaiveDate> {
        match kind {
            AlertKind::Expiration => self.expiration_date().filter(|_| self.expiration_alert_enabled),
            AlertKind::OutcomeNotice => self.outcome_notice_date().filter(|_| self.outcome_notice_alert_enabled),
        }
    }
}

/// Event: agreement.created.v1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementCreated {
    pub user_id: String,
    pub system_created_date: DateTime<Utc>,
    #[serde(flatten)]
    pub attrs: AgreementAttrs,
}

/// Event: agreement.attrs_updated.v1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementAttrsUpdated {
    #[serde(flatten)]
    pub attrs: AgreementAttrs,
}

/// Event: agreement.deleted.v1 (terminal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementDeleted {
    pub deleted_by: String,
}

/// Events: agreement.expiration_alert_sent.v1, agreement.outcome_notice_alert_sent.v1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementAlertSent {
    /// The scheduled date the alert was sent for.
    pub alert_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgreementEvent {
    Created(AgreementCreated),
    AttrsUpdated(AgreementAttrsUpdated),
    Deleted(AgreementDeleted),
    ExpirationAlertSent(AgreementAlertSent),
    OutcomeNoticeAlertSent(AgreementAlertSent),
}

impl AgreementEvent {
    pub const CREATED: &'static str = "agreement.created.v1";
    pub const ATTRS_UPDATED: &'static str = "agreement.attrs_updated.v1";
    pub const DELETED: &'static str = "agreement.deleted.v1";
    pub const EXPIRATION_ALERT_SENT: &'static str = "agreement.expiration_alert_sent.v1";
    pub const OUTCOME_NOTICE_ALERT_SENT: &'static str = "agreement.outcome_notice_alert_sent.v1";

    /// The full catalog, for subscribing to every agreement event.
    pub const NAMES: [&'static str; 5] = [
        Self::CREATED,
        Self::ATTRS_UPDATED,
        Self::DELETED,
        Self::EXPIRATION_ALERT_SENT,
        Self::OUTCOME_NOTICE_ALERT_SENT,
    ];

    pub fn alert_sent(kind: AlertKind, alert_date: NaiveDate) -> Self {
        let sent = AgreementAlertSent { alert_date };
        match kind {
            AlertKind::Expiration => AgreementEvent::ExpirationAlertSent(sent),
            AlertKind::OutcomeNotice => AgreementEvent::OutcomeNoticeAlertSent(sent),
        }
    }

    /// Kind and date when this event records a sent alert.
    pub fn as_alert_sent(&self) -> Option<(AlertKind, NaiveDate)> {
        match self {
            AgreementEvent::ExpirationAlertSent(e) => Some((AlertKind::Expiration, e.alert_date)),
            AgreementEvent::OutcomeNoticeAlertSent(e) => Some((AlertKind::OutcomeNotice, e.alert_date)),
            _ => None,
        }
    }
}

impl DomainEvent for AgreementEvent {
    fn event_name(&self) -> &'static str {
        match self {
            AgreementEvent::Created(_) => Self::CREATED,
            AgreementEvent::AttrsUpdated(_) => Self::ATTRS_UPDATED,
            AgreementEvent::Deleted(_) => Self::DELETED,
            AgreementEvent::ExpirationAlertSent(_) => Self::EXPIRATION_ALERT_SENT,
            AgreementEvent::OutcomeNoticeAlertSent(_) => Self::OUTCOME_NOTICE_ALERT_SENT,
        }
    }

    fn to_payload(&self) -> Result<JsonValue, DomainError> {
        match self {
            AgreementEvent::Created(e) => encode_payload(self.event_name(), e),
            AgreementEvent::AttrsUpdated(e) => encode_payload(self.event_name(), e),
            AgreementEvent::Deleted(e) => encode_payload(self.event_name(), e),
            AgreementEvent::ExpirationAlertSent(e) | AgreementEvent::OutcomeNoticeAlertSent(e) => {
                encode_payload(self.event_name(), e)
            }
        }
    }

    fn from_event(event: &Event) -> Result<Self, DomainError> {
        match event.event_name.as_str() {
            Self::CREATED => Ok(AgreementEvent::Created(decode_payload(event)?)),
            Self::ATTRS_UPDATED => Ok(AgreementEvent::AttrsUpdated(decode_payload(event)?)),
            Self::DELETED => Ok(AgreementEvent::Deleted(decode_payload(event)?)),
            Self::EXPIRATION_ALERT_SENT => Ok(AgreementEvent::ExpirationAlertSent(decode_payload(event)?)),
            Self::OUTCOME_NOTICE_ALERT_SENT => Ok(AgreementEvent::OutcomeNoticeAlertSent(decode_payload(event)?)),
            other => Err(DomainError::unknown_event_type(AGGREGATE_TYPE, other)),
        }
    }
}

/// Aggregate root: Agreement.
#[derive(Debug, Clone, PartialEq)]
pub struct Agreement {
    root: AggregateRoot,
    owner: Option<String>,
    attrs: Option<AgreementAttrs>,
    system_created_date: Option<DateTime<Utc>>,
    /// Scheduled date of the last expiration alert sent.
    expiration_alert_sent: Option<NaiveDate>,
    outcome_notice_alert_sent: Option<NaiveDate>,
    deleted: bool,
}

impl Agreement {
    /// Factory: the only path that establishes an agreement's identity.
    pub fn create(
        id: StreamId,
        user_id: impl Into<String>,
        attrs: AgreementAttrs,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(DomainError::validation("user_id is required"));
        }
        attrs.validate()?;

        let mut agreement = Self::empty(id);
        agreement.raise(AgreementEvent::Created(AgreementCreated {
            user_id,
            system_created_date: now,
            attrs,
        }))?;
        Ok(agreement)
    }

    pub fn update_attrs(&mut self, attrs: AgreementAttrs) -> DomainResult<()> {
        self.ensure_live()?;
        attrs.validate()?;
        if self.attrs.as_ref() == Some(&attrs) {
            // Nothing changed; no event.
            return Ok(());
        }
        self.raise(AgreementEvent::AttrsUpdated(AgreementAttrsUpdated { attrs }))
    }

    pub fn delete(&mut self, deleted_by: impl Into<String>) -> DomainResult<()> {
        self.ensure_live()?;
        let deleted_by = deleted_by.into();
        if deleted_by.trim().is_empty() {
            return Err(DomainError::validation("deleted_by is required"));
        }
        self.raise(AgreementEvent::Deleted(AgreementDeleted { deleted_by }))
    }

    /// Record that the `kind` alert went out for `alert_date`.
    ///
    /// `alert_date` must match the date currently scheduled, so a sender that
    /// read a schedule before it moved is refused. Rescheduling re-arms the
    /// alert: only the date that was actually sent counts as done.
    pub fn mark_alert_sent(&mut self, kind: AlertKind, alert_date: NaiveDate) -> DomainResult<()> {
        self.ensure_live()?;
        let Some(scheduled) = self.attrs.as_ref().and_then(|a| a.alert_date(kind)) else {
            return Err(DomainError::invalid_operation(format!(
                "{kind} alert is not scheduled for agreement {}",
                self.id()
            )));
        };
        if scheduled != alert_date {
            return Err(DomainError::invalid_operation(format!(
                "{kind} alert is scheduled for {scheduled}, not {alert_date}"
            )));
        }
        if self.last_alert_sent(kind) == Some(alert_date) {
            return Err(DomainError::invalid_operation(format!(
                "{kind} alert for {alert_date} was already sent"
            )));
        }
        self.raise(AgreementEvent::alert_sent(kind, alert_date))
    }

    /// The scheduled `kind` alert exists and has been sent.
    pub fn is_alert_sent(&self, kind: AlertKind) -> bool {
        let scheduled = self.attrs.as_ref().and_then(|a| a.alert_date(kind));
        scheduled.is_some() && scheduled == self.last_alert_sent(kind)
    }

    fn last_alert_sent(&self, kind: AlertKind) -> Option<NaiveDate> {
        match kind {
            AlertKind::Expiration => self.expiration_alert_sent,
            AlertKind::OutcomeNotice => self.outcome_notice_alert_sent,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn attrs(&self) -> Option<&AgreementAttrs> {
        self.attrs.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.attrs.as_ref().map(|a| a.name.as_str())
    }

    pub fn system_created_date(&self) -> Option<DateTime<Utc>> {
        self.system_created_date
    }

    pub fn is_created(&self) -> bool {
        self.attrs.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn ensure_live(&self) -> DomainResult<()> {
        if !self.is_created() {
            return Err(DomainError::invalid_operation("agreement has not been created"));
        }
        if self.deleted {
            return Err(DomainError::invalid_operation(format!("agreement {} is deleted", self.id())));
        }
        Ok(())
    }
}

impl core::fmt::Display for Agreement {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Agreement #{}: {}", self.id(), self.name().unwrap_or("<uncreated>"))
    }
}

impl Aggregate for Agreement {
    type Event = AgreementEvent;
    const AGGREGATE_TYPE: &'static str = AGGREGATE_TYPE;

    fn empty(id: StreamId) -> Self {
        Self {
            root: AggregateRoot::new(id),
            owner: None,
            attrs: None,
            system_created_date: None,
            expiration_alert_sent: None,
            outcome_notice_alert_sent: None,
            deleted: false,
        }
    }

    fn root(&self) -> &AggregateRoot {
        &self.root
    }

    fn root_mut(&mut self) -> &mut AggregateRoot {
        &mut self.root
    }

    fn apply(&mut self, event: &AgreementEvent) {
        match event {
            AgreementEvent::Created(e) => {
                self.owner = Some(e.user_id.clone());
                self.system_created_date = Some(e.system_created_date);
                self.attrs = Some(e.attrs.clone());
                self.deleted = false;
            }
            AgreementEvent::AttrsUpdated(e) => {
                self.attrs = Some(e.attrs.clone());
            }
            AgreementEvent::Deleted(_) => {
                self.deleted = true;
            }
            AgreementEvent::ExpirationAlertSent(e) => {
                self.expiration_alert_sent = Some(e.alert_date);
            }
            AgreementEvent::OutcomeNoticeAlertSent(e) => {
                self.outcome_notice_alert_sent = Some(e.alert_date);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;
    use crate::terms::DurationUnit;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn attrs(name: &str) -> AgreementAttrs {
        AgreementAttrs {
            name: name.to_string(),
            counterparty: "Acme Corp".to_string(),
            description: None,
            kind: AgreementKind::Consulting,
            execution_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            term: Term::years(1),
            auto_renew: false,
            outcome_notice: Some(Term::months(2)),
            expiration_alert_enabled: true,
            outcome_notice_alert_enabled: true,
        }
    }

    fn a1() -> StreamId {
        StreamId::new("A1").unwrap()
    }

    #[test]
    fn create_raises_exactly_one_created_event() {
        let agreement = Agreement::create(a1(), "u1", attrs("MSA"), now()).unwrap();

        let events = agreement.uncommitted_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, AgreementEvent::CREATED);
        assert_eq!(events[0].event_type, "Agreement");
        assert_eq!(events[0].sequence, 1);
        assert_eq!(agreement.name(), Some("MSA"));
        assert_eq!(agreement.owner(), Some("u1"));
    }

    #[test]
    fn create_validates_before_raising() {
        assert!(matches!(
            Agreement::create(a1(), "u1", attrs(" "), now()),
            Err(DomainError::Validation(_))
        ));
        assert!(Agreement::create(a1(), "", attrs("MSA"), now()).is_err());

        let mut long_notice = attrs("MSA");
        long_notice.outcome_notice = Some(Term::years(1));
        assert!(Agreement::create(a1(), "u1", long_notice, now()).is_err());
    }

    #[test]
    fn notice_as_long_as_the_term_in_other_units_is_rejected() {
        let mut same_length = attrs("MSA");
        same_length.term = Term::years(1);
        same_length.outcome_notice = Some(Term::months(12));
        assert_eq!(same_length.outcome_notice_date(), Some(same_length.execution_date));
        assert!(matches!(same_length.validate(), Err(DomainError::Validation(_))));

        // 2024-01-31 + 1 month clamps to Feb 29; one month back is Jan 29.
        let mut clamped = attrs("MSA");
        clamped.execution_date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        clamped.term = Term::months(1);
        clamped.outcome_notice = Some(Term::months(1));
        assert!(clamped.validate().is_err());

        let mut one_day_short = attrs("MSA");
        one_day_short.term = Term::years(1);
        one_day_short.outcome_notice = Some(Term::days(365));
        assert_eq!(one_day_short.outcome_notice_date(), NaiveDate::from_ymd_opt(2024, 1, 16));
        assert!(one_day_short.validate().is_ok());
    }

    #[test]
    fn update_on_deleted_agreement_is_invalid() {
        let mut agreement = Agreement::create(a1(), "u1", attrs("MSA"), now()).unwrap();
        agreement.delete("u1").unwrap();
        let before = agreement.clone();

        let err = agreement.update_attrs(attrs("Renamed")).unwrap_err();
        assert!(matches!(err, DomainError::InvalidOperation(_)));
        assert_eq!(agreement, before);
        assert!(matches!(agreement.delete("u1"), Err(DomainError::InvalidOperation(_))));
    }

    #[test]
    fn unchanged_update_raises_nothing() {
        let mut agreement = Agreement::create(a1(), "u1", attrs("MSA"), now()).unwrap();
        agreement.update_attrs(attrs("MSA")).unwrap();
        assert_eq!(agreement.uncommitted_events().len(), 1);
    }

    #[test]
    fn payload_shape_is_flat() {
        let agreement = Agreement::create(a1(), "u1", attrs("MSA"), now()).unwrap();
        let payload = &agreement.uncommitted_events()[0].payload;
        assert_eq!(payload["name"], "MSA");
        assert_eq!(payload["user_id"], "u1");
        assert_eq!(payload["term"]["unit"], "year");
    }

    #[test]
    fn derived_dates() {
        let a = attrs("MSA");
        assert_eq!(a.expiration_date(), NaiveDate::from_ymd_opt(2025, 1, 15));
        assert_eq!(a.outcome_notice_date(), NaiveDate::from_ymd_opt(2024, 11, 15));
    }

    #[test]
    fn alerts_are_marked_sent_once_per_scheduled_date() {
        let mut agreement = Agreement::create(a1(), "u1", attrs("MSA"), now()).unwrap();
        let notice_date = NaiveDate::from_ymd_opt(2024, 11, 15).unwrap();
        assert!(!agreement.is_alert_sent(AlertKind::OutcomeNotice));

        let wrong_day = agreement.mark_alert_sent(AlertKind::OutcomeNotice, notice_date.succ_opt().unwrap());
        assert!(matches!(wrong_day, Err(DomainError::InvalidOperation(_))));

        agreement.mark_alert_sent(AlertKind::OutcomeNotice, notice_date).unwrap();
        assert!(agreement.is_alert_sent(AlertKind::OutcomeNotice));
        assert!(!agreement.is_alert_sent(AlertKind::Expiration));
        let events = agreement.uncommitted_events();
        assert_eq!(events[1].event_name, AgreementEvent::OUTCOME_NOTICE_ALERT_SENT);
        assert_eq!(events[1].payload["alert_date"], "2024-11-15");

        let again = agreement.mark_alert_sent(AlertKind::OutcomeNotice, notice_date);
        assert!(matches!(again, Err(DomainError::InvalidOperation(_))));
        assert_eq!(agreement.uncommitted_events().len(), 2);
    }

    #[test]
    fn moving_the_alert_date_rearms_it() {
        let mut agreement = Agreement::create(a1(), "u1", attrs("MSA"), now()).unwrap();
        let expires = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        agreement.mark_alert_sent(AlertKind::Expiration, expires).unwrap();

        let mut longer = attrs("MSA");
        longer.term = Term::years(2);
        agreement.update_attrs(longer).unwrap();
        assert!(!agreement.is_alert_sent(AlertKind::Expiration));
        let moved = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        agreement.mark_alert_sent(AlertKind::Expiration, moved).unwrap();

        let history = agreement.mark_committed(4);
        let replayed = Agreement::rehydrate(a1(), &history).unwrap();
        assert!(replayed.is_alert_sent(AlertKind::Expiration));
        assert_eq!(replayed, agreement);
    }

    #[test]
    fn disabled_or_deleted_alerts_cannot_be_marked() {
        let mut quiet = attrs("MSA");
        quiet.expiration_alert_enabled = false;
        let mut agreement = Agreement::create(a1(), "u1", quiet, now()).unwrap();
        let expires = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        assert!(matches!(
            agreement.mark_alert_sent(AlertKind::Expiration, expires),
            Err(DomainError::InvalidOperation(_))
        ));

        agreement.delete("u1").unwrap();
        let notice_date = NaiveDate::from_ymd_opt(2024, 11, 15).unwrap();
        assert!(matches!(
            agreement.mark_alert_sent(AlertKind::OutcomeNotice, notice_date),
            Err(DomainError::InvalidOperation(_))
        ));
    }

    #[test]
    fn unknown_event_names_are_fatal() {
        let event = Event {
            stream_id: a1(),
            event_type: AGGREGATE_TYPE.into(),
            event_name: "agreement.renewed.v1".into(),
            sequence: 1,
            payload: serde_json::json!({}),
        };
        assert!(matches!(
            AgreementEvent::from_event(&event),
            Err(DomainError::UnknownEventType { .. })
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Rename(String),
        Extend(u32),
        ToggleRenew,
        Delete,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            "[a-z]{1,12}".prop_map(Op::Rename),
            (1u32..48).prop_map(Op::Extend),
            Just(Op::ToggleRenew),
            Just(Op::Delete),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        #[test]
        fn replay_is_deterministic(ops in prop::collection::vec(op(), 0..24)) {
            let mut live = Agreement::create(a1(), "u1", attrs("MSA"), now()).unwrap();
            for op in ops {
                let mut next = live.attrs().cloned().unwrap();
                // Rejected operations must not leave events behind; ignore their errors.
                let _ = match op {
                    Op::Rename(name) => { next.name = name; live.update_attrs(next) }
                    Op::Extend(months) => { next.term = Term::new(months + 2, DurationUnit::Month); live.update_attrs(next) }
                    Op::ToggleRenew => { next.auto_renew = !next.auto_renew; live.update_attrs(next) }
                    Op::Delete => live.delete("u1"),
                };
            }

            let version = live.uncommitted_events().len() as u64;
            let history = live.mark_committed(version);

            let first = Agreement::rehydrate(a1(), &history).unwrap();
            let second = Agreement::rehydrate(a1(), &history).unwrap();

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(&first, &live);
            prop_assert_eq!(first.version(), history.len() as u64);
            let seqs: Vec<u64> = history.iter().map(|e| e.sequence).collect();
            let expected: Vec<u64> = (1..=history.len() as u64).collect();
            prop_assert_eq!(seqs, expected);
        }
    }
}
