use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::enums::Pipeline;

/// Phase bits of a monitor. Needed and Pending of one pipeline are never set together.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const DISABLED: Flags = Flags(1 << 0);
    pub const PULSE_NEEDED: Flags = Flags(1 << 1);
    pub const PULSE_PENDING: Flags = Flags(1 << 2);
    pub const PULSE_FIRST_CHECK: Flags = Flags(1 << 3);
    pub const INTERVENTION_NEEDED: Flags = Flags(1 << 4);
    pub const INTERVENTION_PENDING: Flags = Flags(1 << 5);
    pub const CODE_NEEDED: Flags = Flags(1 << 6);
    pub const CODE_PENDING: Flags = Flags(1 << 7);
    pub const INCIDENT_OPEN: Flags = Flags(1 << 8);
    pub const VERIFYING: Flags = Flags(1 << 9);

    const NAMES: [(Flags, &'static str); 10] = [
        (Flags::DISABLED, "Disabled"),
        (Flags::PULSE_NEEDED, "PulseNeeded"),
        (Flags::PULSE_PENDING, "PulsePending"),
        (Flags::PULSE_FIRST_CHECK, "PulseFirstCheck"),
        (Flags::INTERVENTION_NEEDED, "InterventionNeeded"),
        (Flags::INTERVENTION_PENDING, "InterventionPending"),
        (Flags::CODE_NEEDED, "CodeNeeded"),
        (Flags::CODE_PENDING, "CodePending"),
        (Flags::INCIDENT_OPEN, "IncidentOpen"),
        (Flags::VERIFYING, "Verifying"),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn needed(pipeline: Pipeline) -> Flags {
        match pipeline {
            Pipeline::Pulse => Flags::PULSE_NEEDED,
            Pipeline::Intervention => Flags::INTERVENTION_NEEDED,
            Pipeline::Code => Flags::CODE_NEEDED,
        }
    }

    pub const fn pending(pipeline: Pipeline) -> Flags {
        match pipeline {
            Pipeline::Pulse => Flags::PULSE_PENDING,
            Pipeline::Intervention => Flags::INTERVENTION_PENDING,
            Pipeline::Code => Flags::CODE_PENDING,
        }
    }

    /// Needed | Pending for one pipeline.
    pub const fn phase(pipeline: Pipeline) -> Flags {
        Flags(Flags::needed(pipeline).0 | Flags::pending(pipeline).0)
    }

    /// Every scheduling bit across all pipelines.
    pub const fn all_phases() -> Flags {
        Flags(
            Flags::phase(Pipeline::Pulse).0
                | Flags::phase(Pipeline::Intervention).0
                | Flags::phase(Pipeline::Code).0,
        )
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitAnd for Flags {
    type Output = Flags;

    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        for (flag, name) in Flags::NAMES {
            if self.contains(flag) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}

/// Atomic flag word stored in every monitor record.
///
/// The controller is the only writer, so plain read-modify-write through
/// `fetch_or`/`fetch_and` is enough; readers on other threads (diagnostics)
/// see a consistent word.
#[derive(Default)]
pub struct StateFlags(AtomicU32);

impl StateFlags {
    pub fn new(initial: Flags) -> Self {
        Self(AtomicU32::new(initial.0))
    }

    pub fn load(&self) -> Flags {
        Flags(self.0.load(Ordering::Acquire))
    }

    pub fn contains(&self, flags: Flags) -> bool {
        self.load().contains(flags)
    }

    pub fn intersects(&self, flags: Flags) -> bool {
        self.load().intersects(flags)
    }

    pub fn insert(&self, flags: Flags) {
        self.0.fetch_or(flags.0, Ordering::AcqRel);
    }

    pub fn remove(&self, flags: Flags) {
        self.0.fetch_and(!flags.0, Ordering::AcqRel);
    }

    /// Clears `clear` and sets `set` in one atomic step.
    pub fn transition(&self, clear: Flags, set: Flags) -> Flags {
        let prev = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((bits & !clear.0) | set.0)
            })
            .unwrap_or_else(|bits| bits);
        Flags(prev)
    }
}

impl fmt::Debug for StateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_moves_needed_to_pending() {
        let flags = StateFlags::new(Flags::PULSE_NEEDED | Flags::PULSE_FIRST_CHECK);
        flags.transition(Flags::PULSE_NEEDED, Flags::PULSE_PENDING);
        let now = flags.load();
        assert!(now.contains(Flags::PULSE_PENDING));
        assert!(!now.contains(Flags::PULSE_NEEDED));
        assert!(now.contains(Flags::PULSE_FIRST_CHECK));
    }

    #[test]
    fn phase_covers_both_bits() {
        let phase = Flags::phase(Pipeline::Code);
        assert!(phase.contains(Flags::CODE_NEEDED));
        assert!(phase.contains(Flags::CODE_PENDING));
        assert!(!phase.intersects(Flags::PULSE_PENDING));
        assert!(Flags::all_phases().contains(Flags::INTERVENTION_PENDING));
        assert!(!Flags::all_phases().intersects(Flags::INCIDENT_OPEN));
    }

    #[test]
    fn debug_lists_names() {
        let flags = Flags::DISABLED | Flags::INCIDENT_OPEN;
        assert_eq!(format!("{flags:?}"), "{Disabled, IncidentOpen}");
    }
}
