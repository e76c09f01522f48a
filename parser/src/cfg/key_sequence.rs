//! Compiles the surface sequence syntax into event templates.
//!
//! The same grammar has two lowerings. Inputs become match templates:
//! a plain key adds `+K ~K`, a hold `A{…}` keeps the holder's `~A` for
//! the closing brace, a group `(A B)` adds `*A *B +A +B` so the matcher
//! accepts either press order, and `!K` adds a `Not` gate. Outputs become
//! emission templates: each sequential step releases the keys of the
//! previous step first, closing a hold releases its keys in reverse
//! press order, and keys still held at the end are released only if the
//! expression already released something (a bare `A` or `(A B)` stays
//! down for the engine to release with the trigger).

use crate::cfg::str_iter::Cursor;
use crate::keys::Key;
use crate::sequence::{KeyEvent, KeySequence, KeyState};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("unexpected character '{0}'")]
    Unexpected(char),
    #[error("unmatched '{0}'")]
    Unmatched(char),
    #[error("'!' must be followed by a single key at the top level")]
    MisplacedNot,
    #[error("'^' may appear once, outside of groups and holds")]
    MisplacedOutputOnRelease,
    #[error("'^' is only allowed in output expressions")]
    OutputOnReleaseInInput,
    #[error("'{{' must follow a key or group")]
    HoldWithoutKey,
    #[error("terminal commands are only allowed as output, outside of groups and holds")]
    MisplacedTerminalCommand,
    #[error("'Any' is only allowed in output expressions")]
    AnyInInput,
}

pub type Result<T> = std::result::Result<T, SequenceError>;

/// The sequence compiler. Key resolution and terminal-command
/// registration are supplied by the caller so the config parser can
/// thread its virtual-key aliases and action list through.
pub struct ParseKeySequence<'f> {
    pub resolve_key: &'f mut dyn FnMut(&str) -> Option<Key>,
    pub add_terminal_command: &'f mut dyn FnMut(&str) -> Key,
}

impl ParseKeySequence<'_> {
    pub fn input(&mut self, text: &str) -> Result<KeySequence> {
        self.parse(text, true)
    }

    pub fn output(&mut self, text: &str) -> Result<KeySequence> {
        self.parse(text, false)
    }

    fn parse(&mut self, text: &str, is_input: bool) -> Result<KeySequence> {
        let mut builder = Builder {
            cursor: Cursor::new(text),
            is_input,
            events: KeySequence::new(),
            scopes: vec![Scope::default()],
            up_emitted: false,
            output_on_release_seen: false,
        };
        builder.run(self)?;
        Ok(builder.events)
    }
}

/// One brace scope. `keys` are the keys this scope owes releases for at
/// its closing brace (holder keys, plus group members for inputs);
/// `step` are the keys of the current sequential step of an output.
#[derive(Default)]
struct Scope {
    keys: Vec<Key>,
    step: Vec<Key>,
}

struct Builder<'t> {
    cursor: Cursor<'t>,
    is_input: bool,
    events: KeySequence,
    scopes: Vec<Scope>,
    up_emitted: bool,
    output_on_release_seen: bool,
}

impl Builder<'_> {
    fn run(&mut self, ctx: &mut ParseKeySequence) -> Result<()> {
        loop {
            self.cursor.skip_space();
            let Some(c) = self.cursor.peek() else { break };
            match c {
                '!' => {
                    self.cursor.advance();
                    self.parse_not(ctx)?;
                }
                '^' => {
                    self.cursor.advance();
                    self.parse_output_on_release()?;
                }
                '$' => {
                    self.cursor.advance();
                    self.parse_terminal_command(ctx)?;
                }
                '(' => {
                    self.cursor.advance();
                    self.parse_group(ctx)?;
                }
                '}' => {
                    self.cursor.advance();
                    self.close_hold()?;
                }
                '{' => return Err(SequenceError::HoldWithoutKey),
                _ => self.parse_key(ctx)?,
            }
        }
        if self.scopes.len() > 1 {
            return Err(SequenceError::Unmatched('{'));
        }
        if !self.is_input && self.up_emitted {
            // release what the last step left down
            let step = std::mem::take(&mut self.scopes[0].step);
            self.release_all(&step);
        }
        Ok(())
    }

    fn in_hold(&self) -> bool {
        self.scopes.len() > 1
    }

    fn read_key(&mut self, ctx: &mut ParseKeySequence) -> Result<Key> {
        let ident = self.cursor.read_ident();
        if ident.is_empty() {
            return match self.cursor.peek() {
                Some(c) => Err(SequenceError::Unexpected(c)),
                None => Err(SequenceError::MisplacedNot),
            };
        }
        let key = (ctx.resolve_key)(ident)
            .ok_or_else(|| SequenceError::UnknownIdentifier(ident.to_string()))?;
        if key == Key::ANY && self.is_input {
            return Err(SequenceError::AnyInInput);
        }
        Ok(key)
    }

    fn parse_not(&mut self, ctx: &mut ParseKeySequence) -> Result<()> {
        if self.in_hold() {
            return Err(SequenceError::MisplacedNot);
        }
        if self.cursor.peek() == Some('(') {
            return Err(SequenceError::MisplacedNot);
        }
        let key = self.read_key(ctx)?;
        if self.cursor.peek() == Some('{') {
            return Err(SequenceError::MisplacedNot);
        }
        self.events.push(KeyEvent::new(key, KeyState::Not));
        Ok(())
    }

    fn parse_output_on_release(&mut self) -> Result<()> {
        if self.is_input {
            return Err(SequenceError::OutputOnReleaseInInput);
        }
        if self.output_on_release_seen || self.in_hold() {
            return Err(SequenceError::MisplacedOutputOnRelease);
        }
        if self.cursor.peek() == Some('{') {
            return Err(SequenceError::HoldWithoutKey);
        }
        self.output_on_release_seen = true;
        self.begin_step();
        self.events
            .push(KeyEvent::new(Key::NONE, KeyState::OutputOnRelease));
        Ok(())
    }

    fn parse_terminal_command(&mut self, ctx: &mut ParseKeySequence) -> Result<()> {
        if self.is_input || self.in_hold() || !self.cursor.skip_char('(') {
            return Err(SequenceError::MisplacedTerminalCommand);
        }
        let rest = self.cursor.rest();
        let len = rest
            .find(')')
            .ok_or(SequenceError::Unmatched('('))?;
        let body = &rest[..len];
        let command = body.trim().to_string();
        for _ in body.chars() {
            self.cursor.advance();
        }
        self.cursor.advance();
        let key = (ctx.add_terminal_command)(&command);
        self.begin_step();
        self.events.push(KeyEvent::new(key, KeyState::Down));
        self.scopes.last_mut().expect("scope").step.push(key);
        Ok(())
    }

    fn parse_group(&mut self, ctx: &mut ParseKeySequence) -> Result<()> {
        let mut members = Vec::new();
        loop {
            self.cursor.skip_space();
            match self.cursor.peek() {
                Some(')') => {
                    self.cursor.advance();
                    break;
                }
                Some('!') | Some('^') | Some('$') | Some('(') | Some('{') => {
                    return Err(match self.cursor.peek() {
                        Some('!') => SequenceError::MisplacedNot,
                        Some('^') => SequenceError::MisplacedOutputOnRelease,
                        Some('$') => SequenceError::MisplacedTerminalCommand,
                        _ => SequenceError::Unexpected(self.cursor.peek().expect("char")),
                    });
                }
                Some(_) => members.push(self.read_key(ctx)?),
                None => return Err(SequenceError::Unmatched('(')),
            }
        }
        if members.is_empty() {
            return Err(SequenceError::Unexpected(')'));
        }
        if self.is_input {
            for &key in &members {
                self.events.push(KeyEvent::new(key, KeyState::DownAsync));
            }
            for &key in &members {
                self.events.push(KeyEvent::new(key, KeyState::Down));
            }
        } else {
            self.begin_step();
            for &key in &members {
                self.events.push(KeyEvent::new(key, KeyState::Down));
            }
        }
        if self.cursor.skip_char('{') {
            self.open_hold(members);
        } else if self.is_input {
            if self.in_hold() {
                // members owe their release to the enclosing brace
                self.scopes.last_mut().expect("scope").keys.extend(members);
            }
        } else {
            self.scopes.last_mut().expect("scope").step = members;
        }
        Ok(())
    }

    fn parse_key(&mut self, ctx: &mut ParseKeySequence) -> Result<()> {
        let key = self.read_key(ctx)?;
        if !self.is_input {
            self.begin_step();
        }
        self.events.push(KeyEvent::new(key, KeyState::Down));
        if self.cursor.skip_char('{') {
            self.open_hold(vec![key]);
        } else if self.is_input {
            self.events.push(KeyEvent::new(key, KeyState::UpAsync));
        } else {
            self.scopes.last_mut().expect("scope").step.push(key);
        }
        Ok(())
    }

    /// Starts a sequential output step: the previous step's keys are
    /// released first, most recent first.
    fn begin_step(&mut self) {
        let step = std::mem::take(&mut self.scopes.last_mut().expect("scope").step);
        self.release_all(&step);
    }

    fn open_hold(&mut self, holders: Vec<Key>) {
        self.scopes.push(Scope {
            keys: holders,
            step: Vec::new(),
        });
    }

    fn close_hold(&mut self) -> Result<()> {
        if !self.in_hold() {
            return Err(SequenceError::Unmatched('}'));
        }
        let scope = self.scopes.pop().expect("scope");
        if self.is_input {
            for &key in scope.keys.iter().rev() {
                self.events.push(KeyEvent::new(key, KeyState::UpAsync));
            }
        } else {
            self.release_all(&scope.step);
            self.release_all(&scope.keys);
        }
        Ok(())
    }

    fn release_all(&mut self, keys: &[Key]) {
        for &key in keys.iter().rev() {
            self.events.push(KeyEvent::new(key, KeyState::Up));
            self.up_emitted = true;
        }
    }
}
