//! The sequence-match predicate.
//!
//! Decides whether an input buffer contradicts a rule's template
//! (`NoMatch`), satisfies it (`Match`), or is a consistent prefix that
//! more input could complete (`MightMatch`). Matching is positional from
//! the left, with three relaxations: `DownMatched` events of unrelated
//! keys are held-over presses and may be skipped, members of a pending
//! `DownAsync` group may arrive in any order, and a key whose `UpAsync`
//! has passed may release anywhere. `Not` gates check physical liveness,
//! not consumption: a key counts as held until an `Up` for it appears in
//! the buffer.

use keywarp_parser::keys::Key;
use keywarp_parser::sequence::{KeyEvent, KeyState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    NoMatch,
    MightMatch,
    Match,
}

enum Scan {
    Found(usize),
    EndOfBuffer,
    Blocked,
}

/// Stateful only to reuse its scratch allocations between calls; every
/// call is a pure function of `(template, buffer)`.
#[derive(Default)]
pub struct MatchKeySequence {
    consumed: Vec<bool>,
    async_keys: Vec<Key>,
    released: Vec<Key>,
}

impl MatchKeySequence {
    pub fn matches(&mut self, template: &[KeyEvent], buffer: &[KeyEvent]) -> MatchResult {
        self.consumed.clear();
        self.consumed.resize(buffer.len(), false);
        self.async_keys.clear();
        self.released.clear();
        let mut incomplete = false;

        for event in template {
            match event.state {
                KeyState::Not => {
                    if is_live(buffer, event.key) {
                        return MatchResult::NoMatch;
                    }
                }
                KeyState::DownAsync => {
                    if !has_unconsumed_down(buffer, &self.consumed, event.key) {
                        incomplete = true;
                    }
                    if !self.async_keys.contains(&event.key) {
                        self.async_keys.push(event.key);
                    }
                }
                KeyState::UpAsync => {
                    // permissive: consume a release if one arrived, in
                    // any order; otherwise allow one later
                    if let Some(index) = self.find_unconsumed(buffer, event.key, KeyState::Up) {
                        self.consumed[index] = true;
                    }
                    if !self.released.contains(&event.key) {
                        self.released.push(event.key);
                    }
                }
                KeyState::Down => match self.scan(buffer, event.key, true) {
                    Scan::Found(index) => {
                        self.consumed[index] = true;
                        self.async_keys.retain(|&k| k != event.key);
                    }
                    Scan::EndOfBuffer => incomplete = true,
                    Scan::Blocked => return MatchResult::NoMatch,
                },
                KeyState::Up => match self.scan(buffer, event.key, false) {
                    Scan::Found(index) => self.consumed[index] = true,
                    Scan::EndOfBuffer => incomplete = true,
                    Scan::Blocked => return MatchResult::NoMatch,
                },
                KeyState::DownMatched | KeyState::OutputOnRelease => {
                    debug_assert!(false, "not a template state");
                }
            }
        }

        // an unconsumed tail of required events contradicts the template
        for (index, event) in buffer.iter().enumerate() {
            if self.consumed[index] {
                continue;
            }
            match event.state {
                KeyState::DownMatched | KeyState::Not => {}
                KeyState::Up if self.released.contains(&event.key) => {}
                _ => return MatchResult::NoMatch,
            }
        }

        if incomplete {
            MatchResult::MightMatch
        } else {
            MatchResult::Match
        }
    }

    /// Scans forward for the next consumable `key` press (or release),
    /// skipping events the template already accounts for.
    fn scan(&self, buffer: &[KeyEvent], key: Key, want_down: bool) -> Scan {
        for (index, event) in buffer.iter().enumerate() {
            if self.consumed[index] {
                continue;
            }
            let found = event.key == key
                && if want_down {
                    matches!(event.state, KeyState::Down | KeyState::DownMatched)
                } else {
                    event.state == KeyState::Up
                };
            if found {
                return Scan::Found(index);
            }
            let skippable = match event.state {
                KeyState::DownMatched | KeyState::Not => true,
                KeyState::Up => self.released.contains(&event.key),
                KeyState::Down => self.async_keys.contains(&event.key),
                _ => false,
            };
            if !skippable {
                return Scan::Blocked;
            }
        }
        Scan::EndOfBuffer
    }

    fn find_unconsumed(&self, buffer: &[KeyEvent], key: Key, state: KeyState) -> Option<usize> {
        buffer
            .iter()
            .enumerate()
            .position(|(index, event)| !self.consumed[index] && event.is(key, state))
    }
}

fn has_unconsumed_down(buffer: &[KeyEvent], consumed: &[bool], key: Key) -> bool {
    buffer.iter().enumerate().any(|(index, event)| {
        !consumed[index]
            && event.key == key
            && matches!(event.state, KeyState::Down | KeyState::DownMatched)
    })
}

/// Whether `key` is physically held at this point of the buffer.
fn is_live(buffer: &[KeyEvent], key: Key) -> bool {
    let mut live = false;
    for event in buffer {
        if event.key == key {
            match event.state {
                KeyState::Down | KeyState::DownMatched => live = true,
                KeyState::Up => live = false,
                _ => {}
            }
        }
    }
    live
}
