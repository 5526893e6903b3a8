use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};

/// Billing happens on Thursdays.
pub const BILLING_WEEKDAY: Weekday = Weekday::Thu;

const HOURS_PER_WEEK: i64 = 24 * 7;

/// Derives billing week numbers from a fixed anchor date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingCalendar {
    anchor: NaiveDate,
}

impl BillingCalendar {
    /// Validate `anchor` against the current time. The anchor must fall on the
    /// billing weekday and must not lie in the future.
    pub fn new(anchor: NaiveDate, now: DateTime<Utc>) -> BillingResult<Self> {
        if anchor.weekday() != BILLING_WEEKDAY {
            return Err(BillingError::Configuration(format!(
                "anchor date {} is a {:?}, expected {:?}",
                anchor,
                anchor.weekday(),
                BILLING_WEEKDAY
            )));
        }

        let calendar = Self { anchor };
        if now < calendar.anchor_start() {
            return Err(BillingError::Configuration(format!(
                "anchor date {} is in the future",
                anchor
            )));
        }
        Ok(calendar)
    }

    pub fn anchor(&self) -> NaiveDate {
        self.anchor
    }

    /// Midnight UTC of the anchor date.
    pub fn anchor_start(&self) -> DateTime<Utc> {
        self.anchor.and_time(chrono::NaiveTime::MIN).and_utc()
    }

    /// `floor(hours since anchor / 24 / 7) + 1`. Times before the anchor count as week 1.
    pub fn week_number_at(&self, now: DateTime<Utc>) -> u64 {
        let hours = (now - self.anchor_start()).num_hours().max(0);
        (hours / HOURS_PER_WEEK) as u64 + 1
    }
}
