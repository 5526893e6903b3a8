//! Weekly billing: calendar math, the anchored scheduler and the charge sweep.

pub mod calendar;
pub mod scheduler;
pub mod sweep;

pub use calendar::{BillingCalendar, BILLING_WEEKDAY};
pub use scheduler::{BillingScheduler, SchedulerPhase, WeekHandle, WeekSnapshot};
pub use sweep::ChargeSweep;
