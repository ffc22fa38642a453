use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::anyhow;
use chrono::NaiveDate;

use covenant_agreements::{AgreementAttrs, AgreementEvent, AlertKind};
use covenant_core::{DomainEvent, Event, StreamId};
use covenant_events::EventHandler;

use super::next_in_stream;

/// Alert dates for one agreement. A date is `None` when its alert is switched
/// off (or cannot be computed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertSchedule {
    pub agreement_id: StreamId,
    pub owner: String,
    pub name: String,
    pub expiration_alert_date: Option<NaiveDate>,
    pub outcome_notice_alert_date: Option<NaiveDate>,
    /// Scheduled date the last expiration alert was sent for.
    pub expiration_alert_sent: Option<NaiveDate>,
    pub outcome_notice_alert_sent: Option<NaiveDate>,
}

impl AlertSchedule {
    pub fn date(&self, kind: AlertKind) -> Option<NaiveDate> {
        match kind {
            AlertKind::Expiration => self.expiration_alert_date,
            AlertKind::OutcomeNotice => self.outcome_notice_alert_date,
        }
    }

    /// The scheduled date of `kind`, unless that date was already sent.
    pub fn pending(&self, kind: AlertKind) -> Option<NaiveDate> {
        let date = self.date(kind)?;
        let sent = match kind {
            AlertKind::Expiration => self.expiration_alert_sent,
            AlertKind::OutcomeNotice => self.outcome_notice_alert_sent,
        };
        (sent != Some(date)).then_some(date)
    }

    fn refresh(&mut self, attrs: &AgreementAttrs) {
        self.name = attrs.name.clone();
        self.expiration_alert_date = attrs.alert_date(AlertKind::Expiration);
        self.outcome_notice_alert_date = attrs.alert_date(AlertKind::OutcomeNotice);
    }

    fn mark_sent(&mut self, kind: AlertKind, date: NaiveDate) {
        match kind {
            AlertKind::Expiration => self.expiration_alert_sent = Some(date),
            AlertKind::OutcomeNotice => self.outcome_notice_alert_sent = Some(date),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueAlert {
    pub agreement_id: StreamId,
    pub owner: String,
    pub name: String,
    pub kind: AlertKind,
    pub date: NaiveDate,
}

#[derive(Debug, Default)]
struct AlertState {
    schedules: HashMap<StreamId, AlertSchedule>,
    cursors: HashMap<StreamId, u64>,
}

/// `alerts` read model: expiration and outcome-notice dates per agreement,
/// and which of them have been sent.
#[derive(Debug, Default)]
pub struct AgreementAlerts {
    state: RwLock<AlertState>,
}

impl AgreementAlerts {
    pub const SUBSCRIBER_ID: &'static str = "alerts";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, id: &StreamId) -> Option<AlertSchedule> {
        self.state.read().ok()?.schedules.get(id).cloned()
    }

    /// Unsent alerts dated on or before `day`, oldest first.
    ///
    /// An alert stays due until its `agreement.mark_*_alert_sent` command
    /// lands, so a day nobody asked about is picked up on the next query.
    pub fn due_by(&self, day: NaiveDate) -> Vec<DueAlert> {
        let Ok(state) = self.state.read() else {
            return vec![];
        };
        let mut due = Vec::new();
        for s in state.schedules.values() {
            for kind in AlertKind::ALL {
                match s.pending(kind) {
                    Some(date) if date <= day => due.push(DueAlert {
                        agreement_id: s.agreement_id.clone(),
                        owner: s.owner.clone(),
                        name: s.name.clone(),
                        kind,
                        date,
                    }),
                    _ => {}
                }
            }
        }
        due.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then_with(|| a.agreement_id.cmp(&b.agreement_id))
                .then(a.kind.cmp(&b.kind))
        });
        due
    }
}

impl EventHandler for AgreementAlerts {
    fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let typed = AgreementEvent::from_event(event)?;
        let mut state = self.state.write().map_err(|_| anyhow!("alerts lock poisoned"))?;
        if !next_in_stream(&state.cursors, event)? {
            return Ok(());
        }

        let id = event.stream_id.clone();
        match typed {
            AgreementEvent::Created(e) => {
                let mut schedule = AlertSchedule {
                    agreement_id: id.clone(),
                    owner: e.user_id,
                    name: String::new(),
                    expiration_alert_date: None,
                    outcome_notice_alert_date: None,
                    expiration_alert_sent: None,
                    outcome_notice_alert_sent: None,
                };
                schedule.refresh(&e.attrs);
                state.schedules.insert(id.clone(), schedule);
            }
            AgreementEvent::AttrsUpdated(e) => {
                if let Some(schedule) = state.schedules.get_mut(&id) {
                    schedule.refresh(&e.attrs);
                }
            }
            AgreementEvent::Deleted(_) => {
                state.schedules.remove(&id);
            }
            sent @ (AgreementEvent::ExpirationAlertSent(_) | AgreementEvent::OutcomeNoticeAlertSent(_)) => {
                if let (Some(schedule), Some((kind, date))) = (state.schedules.get_mut(&id), sent.as_alert_sent()) {
                    schedule.mark_sent(kind, date);
                }
            }
        }
        state.cursors.insert(id, event.sequence);
        Ok(())
    }
}
