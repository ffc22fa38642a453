use chrono::{Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

/// Kind of agreement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementKind {
    Consulting,
    Licensing,
    Sales,
}

impl AgreementKind {
    pub fn label(self) -> &'static str {
        match self {
            AgreementKind::Consulting => "Consulting Agreement",
            AgreementKind::Licensing => "Licensing Agreement",
            AgreementKind::Sales => "Sales Agreement",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    Day,
    Month,
    Year,
}

/// A calendar length such as "12 months" or "30 days".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    pub amount: u32,
    pub unit: DurationUnit,
}

impl Term {
    pub fn new(amount: u32, unit: DurationUnit) -> Self {
        Self { amount, unit }
    }

    pub fn days(amount: u32) -> Self {
        Self::new(amount, DurationUnit::Day)
    }

    pub fn months(amount: u32) -> Self {
        Self::new(amount, DurationUnit::Month)
    }

    pub fn years(amount: u32) -> Self {
        Self::new(amount, DurationUnit::Year)
    }

    /// `date + self`, clamping month ends (Jan 31 + 1 month = Feb 28/29).
    pub fn after(&self, date: NaiveDate) -> Option<NaiveDate> {
        match self.unit {
            DurationUnit::Day => date.checked_add_days(Days::new(u64::from(self.amount))),
            DurationUnit::Month => date.checked_add_months(Months::new(self.amount)),
            DurationUnit::Year => date.checked_add_months(Months::new(self.amount.checked_mul(12)?)),
        }
    }

    /// `date - self`.
    pub fn before(&self, date: NaiveDate) -> Option<NaiveDate> {
        match self.unit {
            DurationUnit::Day => date.checked_sub_days(Days::new(u64::from(self.amount))),
            DurationUnit::Month => date.checked_sub_months(Months::new(self.amount)),
            DurationUnit::Year => date.checked_sub_months(Months::new(self.amount.checked_mul(12)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn adds_calendar_terms() {
        assert_eq!(Term::days(30).after(date(2024, 1, 1)), Some(date(2024, 1, 31)));
        assert_eq!(Term::months(1).after(date(2024, 1, 31)), Some(date(2024, 2, 29)));
        assert_eq!(Term::years(2).after(date(2024, 2, 29)), Some(date(2026, 2, 28)));
    }

    #[test]
    fn subtracts_calendar_terms() {
        assert_eq!(Term::months(3).before(date(2025, 1, 1)), Some(date(2024, 10, 1)));
        assert_eq!(Term::days(1).before(date(2025, 1, 1)), Some(date(2024, 12, 31)));
    }

    #[test]
    fn kind_uses_snake_case_on_the_wire() {
        let json = serde_json::to_string(&AgreementKind::Licensing).unwrap();
        assert_eq!(json, "\"licensing\"");
    }
}
