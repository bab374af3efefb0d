//! Runlevel masks and the runlevel governor state.
//!
//! Levels are small integers in [0..9]. Level 0 is halt, 6 is reboot, and `S`
//! is an alias for single-user level 1. Each service carries a 10-bit mask of
//! the levels it should be alive in.

use std::fmt;
use std::str::FromStr;

use strum_macros::Display;

/// Bootstrap level entered exactly once at boot.
pub const BOOTSTRAP: u8 = 0;

/// Default target level after bootstrap.
pub const DEFAULT_TARGET: u8 = 2;

/// Grace period a transition waits for stopping services.
pub const TRANSITION_GRACE_SECS: u64 = 10;

/// A set of runlevels encoded as a 10-bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelMask(u16);

impl LevelMask {
    /// The empty set.
    pub const EMPTY: LevelMask = LevelMask(0);

    /// Default mask for service records that omit the `[LVLS]` field.
    pub fn default_runlevels() -> Self {
        LevelMask::from_str("[2345]").unwrap_or(LevelMask::EMPTY)
    }

    /// Mask containing a single level.
    pub fn single(level: u8) -> Self {
        LevelMask(1 << (level as u16 % 10))
    }

    /// Whether `level` is a member.
    pub fn contains(&self, level: u8) -> bool {
        level < 10 && self.0 & (1 << level as u16) != 0
    }

    /// Raw bits, for byte-for-byte attribute comparison.
    pub fn bits(&self) -> u16 {
        self.0
    }
}

impl FromStr for LevelMask {
    type Err = String;

    /// Parses the bracketed runlevel field: digits `0`-`9`, `S`/`s` for 1,
    /// with a leading `!` meaning the complement against [1..9] minus {6}.
    fn from_str(field: &str) -> Result<Self, Self::Err> {
        let inner = field
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(field);

        let (negate, chars) = match inner.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, inner),
        };

        let mut bits = 0u16;
        for ch in chars.chars() {
            match ch {
                '0'..='9' => bits |= 1 << (ch as u16 - '0' as u16),
                'S' | 's' => bits |= 1 << 1,
                _ => return Err(format!("invalid runlevel character '{ch}'")),
            }
        }

        if negate {
            let universe: u16 = (0b11_1111_1110) & !(1 << 6);
            bits = universe & !bits;
        }

        Ok(LevelMask(bits))
    }
}

impl fmt::Display for LevelMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for level in 0..10u8 {
            if self.contains(level) {
                write!(f, "{level}")?;
            }
        }
        write!(f, "]")
    }
}

/// Final system state a halt/reboot transition arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Shutdown {
    /// `reboot(RB_POWER_OFF)`.
    PowerOff,
    /// `reboot(RB_AUTOBOOT)`.
    Reboot,
}

/// Phase of an in-flight runlevel transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No transition in flight.
    Idle,
    /// Waiting for ineligible services to reach HALTED (grace armed).
    Draining,
}

/// Current and previous runlevel plus transition bookkeeping.
#[derive(Debug)]
pub struct Runlevel {
    current: u8,
    previous: u8,
    target: u8,
    phase: Phase,
    shutdown: Option<Shutdown>,
}

impl Runlevel {
    /// Starts at the bootstrap level.
    pub fn new() -> Self {
        Self {
            current: BOOTSTRAP,
            previous: BOOTSTRAP,
            target: BOOTSTRAP,
            phase: Phase::Idle,
            shutdown: None,
        }
    }

    /// The level the system is currently at.
    pub fn current(&self) -> u8 {
        self.current
    }

    /// The level before the last transition.
    pub fn previous(&self) -> u8 {
        self.previous
    }

    /// The level an in-flight transition is heading to.
    pub fn target(&self) -> u8 {
        self.target
    }

    /// Transition phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Shutdown action armed by a transition to level 0 or 6.
    pub fn shutdown(&self) -> Option<Shutdown> {
        self.shutdown
    }

    /// Begins a transition. Returns `false` when `level` is already current
    /// and no transition is in flight (a no-op by contract).
    pub fn request(&mut self, level: u8) -> bool {
        let level = normalize(level);
        if level == self.current && self.phase == Phase::Idle {
            return false;
        }

        self.previous = self.current;
        self.target = level;
        self.phase = Phase::Draining;
        self.shutdown = match level {
            0 => Some(Shutdown::PowerOff),
            6 => Some(Shutdown::Reboot),
            _ => None,
        };
        true
    }

    /// Completes the draining phase: the target becomes current.
    pub fn settle(&mut self) {
        if self.phase == Phase::Draining {
            self.current = self.target;
            self.phase = Phase::Idle;
        }
    }
}

impl Default for Runlevel {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps the `S` alias onto level 1 and clamps into [0..9].
pub fn normalize(level: u8) -> u8 {
    match level {
        b'S' | b's' => 1,
        l if l >= 10 && l.is_ascii_digit() => l - b'0',
        l => l % 10,
    }
}

/// Issues the final `reboot(2)` for an armed shutdown. Only meaningful when
/// running as process 1; callers in other modes must log and exit instead.
pub fn execute_shutdown(action: Shutdown) -> Result<(), nix::errno::Errno> {
    use nix::sys::reboot::{RebootMode, reboot};

    let mode = match action {
        Shutdown::PowerOff => RebootMode::RB_POWER_OFF,
        Shutdown::Reboot => RebootMode::RB_AUTOBOOT,
    };
    reboot(mode).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_digits() {
        let mask: LevelMask = "[2345]".parse().unwrap();
        assert!(mask.contains(2) && mask.contains(5));
        assert!(!mask.contains(1) && !mask.contains(6));
    }

    #[test]
    fn s_aliases_to_one() {
        let mask: LevelMask = "[S]".parse().unwrap();
        assert!(mask.contains(1));
        assert_eq!(mask.bits(), LevelMask::single(1).bits());
    }

    #[test]
    fn negation_complements_against_normal_levels() {
        let mask: LevelMask = "[!2345]".parse().unwrap();
        for level in [1u8, 7, 8, 9] {
            assert!(mask.contains(level), "level {level} should be set");
        }
        for level in [0u8, 2, 3, 4, 5, 6] {
            assert!(!mask.contains(level), "level {level} should be clear");
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!("[2x]".parse::<LevelMask>().is_err());
    }

    #[test]
    fn same_level_request_is_noop() {
        let mut rl = Runlevel::new();
        assert!(rl.request(2));
        rl.settle();
        assert_eq!(rl.current(), 2);
        assert!(!rl.request(2));
        assert_eq!(rl.phase(), Phase::Idle);
    }

    #[test]
    fn halt_and_reboot_arm_shutdown() {
        let mut rl = Runlevel::new();
        rl.request(2);
        rl.settle();

        rl.request(6);
        assert_eq!(rl.shutdown(), Some(Shutdown::Reboot));
        assert_eq!(rl.previous(), 2);

        rl.settle();
        rl.request(0);
        assert_eq!(rl.shutdown(), Some(Shutdown::PowerOff));
    }
}
