//! The event model shared by the sequence compiler and the engine.
//!
//! `DownMatched`, the `*Async` pair and `Not` are in-band markers on the
//! event itself; both the matcher and the emitter depend on them, so they
//! are never stripped at this layer.

use crate::keys::Key;
use itertools::Itertools;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    /// Physical release, or "emit a release" in an output template.
    Up,
    /// Physical press, or "emit a press" in an output template.
    Down,
    /// Input-template marker: the key may be released in any order
    /// relative to its neighbors.
    UpAsync,
    /// Input-template marker: group member that may be pressed in any
    /// order before the group's ordered presses.
    DownAsync,
    /// The key must not be held (inputs), or is forcibly released for
    /// the duration of the emission (outputs).
    Not,
    /// A press already consumed by a completed match whose key is still
    /// physically held.
    DownMatched,
    /// Output-template split point; everything after it is withheld
    /// until the triggering input key is released.
    OutputOnRelease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyEvent {
    pub key: Key,
    pub state: KeyState,
    /// Wheel magnitude; zero for ordinary keys.
    pub value: u16,
}

impl KeyEvent {
    pub fn new(key: Key, state: KeyState) -> Self {
        Self {
            key,
            state,
            value: 0,
        }
    }

    pub fn is(&self, key: Key, state: KeyState) -> bool {
        self.key == key && self.state == state
    }
}

pub type KeySequence = Vec<KeyEvent>;

impl std::fmt::Display for KeyEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.state {
            KeyState::Up => "-",
            KeyState::Down => "+",
            KeyState::UpAsync => "~",
            KeyState::DownAsync => "*",
            KeyState::Not => "!",
            KeyState::DownMatched => "#",
            KeyState::OutputOnRelease => return f.write_str("^"),
        };
        write!(f, "{}{}", prefix, self.key)
    }
}

/// Renders a sequence in the `+A ~A -B` debug notation used throughout
/// the tests and the verbose event trace.
pub fn format_sequence(sequence: &[KeyEvent]) -> String {
    sequence.iter().map(ToString::to_string).join(" ")
}
