//! Agreement command handlers.
//!
//! | command                                   | target id | cycle                                 |
//! |-------------------------------------------|-----------|---------------------------------------|
//! | `agreement.create`                        | optional  | refuse existing id, factory, save @ 0 |
//! | `agreement.update_attrs`                  | required  | load @ N, `update_attrs`, save @ N    |
//! | `agreement.delete`                        | required  | load @ N, `delete`, save @ N          |
//! | `agreement.mark_expiration_alert_sent`     | required  | load @ N, `mark_alert_sent`, save @ N |
//! | `agreement.mark_outcome_notice_alert_sent` | required  | load @ N, `mark_alert_sent`, save @ N |

use std::sync::Arc;

use chrono::Utc;

use covenant_agreements::commands::{self, CREATE, DELETE, UPDATE_ATTRS};
use covenant_agreements::{Agreement, AlertKind, CreateAgreement, DeleteAgreement, MarkAlertSent, UpdateAgreementAttrs};
use covenant_core::StreamId;
use covenant_events::Command;

use crate::command_dispatcher::{
    CommandDispatcher, CommandHandler, CommandOutcome, DispatchError, create_aggregate, update_aggregate,
};
use crate::event_store::EventStore;
use crate::repository::AggregateRepository;

/// Register every agreement command on `dispatcher`.
pub fn register_agreement_handlers<S>(
    dispatcher: &mut CommandDispatcher,
    repo: Arc<AggregateRepository<S>>,
) -> Result<(), DispatchError>
where
    S: EventStore + 'static,
{
    let create_repo = Arc::clone(&repo);
    let create: Arc<dyn CommandHandler> = Arc::new(move |command: &Command| create_agreement(&create_repo, command));
    dispatcher.register(CREATE, create)?;

    let update_repo = Arc::clone(&repo);
    let update: Arc<dyn CommandHandler> = Arc::new(move |command: &Command| update_attrs(&update_repo, command));
    dispatcher.register(UPDATE_ATTRS, update)?;

    let delete_repo = Arc::clone(&repo);
    let delete: Arc<dyn CommandHandler> = Arc::new(move |command: &Command| delete_agreement(&delete_repo, command));
    dispatcher.register(DELETE, delete)?;

    for kind in AlertKind::ALL {
        let alert_repo = Arc::clone(&repo);
        let mark: Arc<dyn CommandHandler> =
            Arc::new(move |command: &Command| mark_alert_sent(&alert_repo, kind, command));
        dispatcher.register(commands::mark_alert_sent(kind), mark)?;
    }

    Ok(())
}

fn create_agreement<S: EventStore>(
    repo: &AggregateRepository<S>,
    command: &Command,
) -> Result<CommandOutcome, DispatchError> {
    let payload: CreateAgreement = command.parse_payload()?;
    let id = command.aggregate_id().cloned().unwrap_or_else(StreamId::generate);
    create_aggregate(repo, id, |id| Agreement::create(id, payload.user_id, payload.attrs, Utc::now()))
}

fn update_attrs<S: EventStore>(
    repo: &AggregateRepository<S>,
    command: &Command,
) -> Result<CommandOutcome, DispatchError> {
    let id = command.require_aggregate_id()?;
    let payload: UpdateAgreementAttrs = command.parse_payload()?;
    update_aggregate(repo, id, |agreement: &mut Agreement| agreement.update_attrs(payload.attrs))
}

fn delete_agreement<S: EventStore>(
    repo: &AggregateRepository<S>,
    command: &Command,
) -> Result<CommandOutcome, DispatchError> {
    let id = command.require_aggregate_id()?;
    let payload: DeleteAgreement = command.parse_payload()?;
    update_aggregate(repo, id, |agreement: &mut Agreement| agreement.delete(payload.deleted_by))
}

fn mark_alert_sent<S: EventStore>(
    repo: &AggregateRepository<S>,
    kind: AlertKind,
    command: &Command,
) -> Result<CommandOutcome, DispatchError> {
    let id = command.require_aggregate_id()?;
    let payload: MarkAlertSent = command.parse_payload()?;
    update_aggregate(repo, id, |agreement: &mut Agreement| {
        agreement.mark_alert_sent(kind, payload.alert_date)
    })
}
