//! Monitor records, their flag word and the store that owns them.
use serde::Serialize;
use std::fmt;

pub mod flags;
pub mod record;
pub mod store;

pub use flags::{Flags, StateFlags};
pub use record::{CodeRoute, CodeState, InterventionRoute, MonitorRecord, PulseSettings};
pub use store::{MonitorStore, StoreError};

/// Index of a record in the [`MonitorStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MonitorId(pub u32);

impl MonitorId {
    pub const UNASSIGNED: MonitorId = MonitorId(u32::MAX);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
