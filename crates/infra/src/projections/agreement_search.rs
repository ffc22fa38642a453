use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::anyhow;
use chrono::NaiveDate;

use covenant_agreements::{AgreementAttrs, AgreementEvent, AgreementKind};
use covenant_core::{DomainEvent, Event, StreamId};
use covenant_events::EventHandler;

use super::next_in_stream;

/// Searchable agreement row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreementSearchEntry {
    pub agreement_id: StreamId,
    pub owner: String,
    pub name: String,
    pub counterparty: String,
    pub kind: AgreementKind,
    pub execution_date: NaiveDate,
    pub expiration_date: Option<NaiveDate>,
}

impl AgreementSearchEntry {
    fn matches(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle) || self.counterparty.to_lowercase().contains(needle)
    }

    fn refresh(&mut self, attrs: &AgreementAttrs) {
        self.name = attrs.name.clone();
        self.counterparty = attrs.counterparty.clone();
        self.kind = attrs.kind;
        self.execution_date = attrs.execution_date;
        self.expiration_date = attrs.expiration_date();
    }
}

#[derive(Debug, Default)]
struct SearchState {
    entries: HashMap<StreamId, AgreementSearchEntry>,
    /// Last applied sequence per stream.
    cursors: HashMap<StreamId, u64>,
}

/// `search-index` read model: live (non-deleted) agreements by name and
/// counterparty.
#[derive(Debug, Default)]
pub struct AgreementSearchIndex {
    state: RwLock<SearchState>,
}

impl AgreementSearchIndex {
    pub const SUBSCRIBER_ID: &'static str = "search-index";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &StreamId) -> Option<AgreementSearchEntry> {
        self.state.read().ok()?.entries.get(id).cloned()
    }

    /// Case-insensitive substring match, ordered by name.
    pub fn search(&self, query: &str) -> Vec<AgreementSearchEntry> {
        let needle = query.trim().to_lowercase();
        let Ok(state) = self.state.read() else {
            return vec![];
        };
        let mut hits: Vec<_> = state.entries.values().filter(|e| e.matches(&needle)).cloned().collect();
        hits.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.agreement_id.cmp(&b.agreement_id)));
        hits
    }

    pub fn owned_by(&self, owner: &str) -> Vec<AgreementSearchEntry> {
        let Ok(state) = self.state.read() else {
            return vec![];
        };
        state.entries.values().filter(|e| e.owner == owner).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventHandler for AgreementSearchIndex {
    fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let typed = AgreementEvent::from_event(event)?;
        let mut state = self.state.write().map_err(|_| anyhow!("search index lock poisoned"))?;
        if !next_in_stream(&state.cursors, event)? {
            return Ok(());
        }

        let id = event.stream_id.clone();
        match typed {
            AgreementEvent::Created(e) => {
                state.entries.insert(
                    id.clone(),
                    AgreementSearchEntry {
                        agreement_id: id.clone(),
                        owner: e.user_id,
                        name: e.attrs.name.clone(),
                        counterparty: e.attrs.counterparty.clone(),
                        kind: e.attrs.kind,
                        execution_date: e.attrs.execution_date,
                        expiration_date: e.attrs.expiration_date(),
                    },
                );
            }
            AgreementEvent::AttrsUpdated(e) => {
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.refresh(&e.attrs);
                }
            }
            AgreementEvent::Deleted(_) => {
                state.entries.remove(&id);
            }
            AgreementEvent::ExpirationAlertSent(_) | AgreementEvent::OutcomeNoticeAlertSent(_) => {}
        }
        state.cursors.insert(id, event.sequence);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use covenant_agreements::{Agreement, Term};
    use covenant_core::Aggregate;

    use super::*;

    fn attrs(name: &str, counterparty: &str) -> AgreementAttrs {
        AgreementAttrs {
            name: name.to_string(),
            counterparty: counterparty.to_string(),
            description: None,
            kind: AgreementKind::Sales,
            execution_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            term: Term::years(2),
            auto_renew: false,
            outcome_notice: None,
            expiration_alert_enabled: false,
            outcome_notice_alert_enabled: false,
        }
    }

    fn history(id: &str) -> Vec<Event> {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut agreement = Agreement::create(StreamId::new(id).unwrap(), "u1", attrs("Master Services", "Acme"), now).unwrap();
        agreement.update_attrs(attrs("Reseller Terms", "Globex")).unwrap();
        agreement.mark_committed(2)
    }

    #[test]
    fn indexes_created_and_updated_agreements() {
        let index = AgreementSearchIndex::new();
        for event in history("A1") {
            index.handle(&event).unwrap();
        }

        assert!(index.search("master").is_empty());
        let hits = index.search("GLOBEX");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "Reseller Terms");
        assert_eq!(hits[0].expiration_date, NaiveDate::from_ymd_opt(2026, 1, 1));
        assert_eq!(index.owned_by("u1").len(), 1);
    }

    #[test]
    fn stale_redelivery_does_not_regress() {
        let index = AgreementSearchIndex::new();
        let events = history("A1");
        index.handle(&events[0]).unwrap();
        index.handle(&events[1]).unwrap();
        index.handle(&events[0]).unwrap();

        let entry = index.get(&StreamId::new("A1").unwrap()).unwrap();
        assert_eq!(entry.name, "Reseller Terms");
    }

    #[test]
    fn skipping_ahead_is_refused_until_the_gap_fills() {
        let index = AgreementSearchIndex::new();
        let events = history("A1");
        let id = StreamId::new("A1").unwrap();

        let err = index.handle(&events[1]).unwrap_err();
        assert!(err.to_string().contains("out of order"), "{err}");
        assert!(index.get(&id).is_none());

        index.handle(&events[0]).unwrap();
        index.handle(&events[1]).unwrap();
        assert_eq!(index.get(&id).unwrap().name, "Reseller Terms");
    }

    #[test]
    fn deleted_agreements_leave_the_index() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut agreement = Agreement::create(StreamId::new("A2").unwrap(), "u1", attrs("NDA", "Initech"), now).unwrap();
        agreement.delete("u1").unwrap();

        let index = AgreementSearchIndex::new();
        for event in agreement.mark_committed(2) {
            index.handle(&event).unwrap();
        }
        assert!(index.is_empty());
    }
}
