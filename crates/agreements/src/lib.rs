//! Agreements bounded context: the `Agreement` aggregate, its event catalog and
//! the command payloads its handlers accept.

pub mod agreement;
pub mod commands;
pub mod terms;

pub use agreement::{
    AGGREGATE_TYPE, Agreement, AgreementAlertSent, AgreementAttrs, AgreementAttrsUpdated, AgreementCreated,
    AgreementDeleted, AgreementEvent, AlertKind,
};
pub use commands::{CreateAgreement, DeleteAgreement, MarkAlertSent, UpdateAgreementAttrs};
pub use terms::{AgreementKind, DurationUnit, Term};
