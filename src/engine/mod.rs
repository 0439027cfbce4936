//! Core engine: lane management, per-account state and status reporting.

pub mod book;
pub mod clock;
pub mod manager;
pub mod reporter;

pub use book::PendingPlacement;
pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::{LaneManager, MaintenanceReport, ManagerConfig, ResultEffect};
pub use reporter::{AccountStatus, DailyCounters, LaneSummary, StatusReporter};
