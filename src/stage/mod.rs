//! The mapping engine.
//!
//! One physical event goes in, the events to synthesize come out; the
//! engine is deterministic and never fails. It buffers input that is a
//! prefix of some rule, folds key repeats, forwards what nothing
//! matches, and tracks every key it pressed on the user's behalf so the
//! release can be targeted when the triggering input key goes up.
//!
//! The host owns the pacing: it multiplexes devices onto one serial
//! stream, defers [`Stage::set_active_contexts`] and reconfiguration
//! until [`Stage::is_output_down`] is false, and donates the returned
//! buffer back through [`Stage::reuse_buffer`] to keep steady-state
//! operation allocation-free.

mod matcher;
pub use matcher::{MatchKeySequence, MatchResult};

#[cfg(test)]
mod tests;

use keywarp_parser::cfg::{Context, MappingOverrideSet, OutputRef};
use keywarp_parser::keys::Key;
use keywarp_parser::sequence::{KeyEvent, KeySequence, KeyState};

/// A key currently pressed in the output, tagged with the input key
/// that triggered it.
#[derive(Debug, Clone, Copy)]
struct OutputDown {
    key: Key,
    trigger: Key,
    /// Set by a `Not` event this update; blocks reapplication.
    suppressed: bool,
    /// Released by a `Not` event; reapplied on the next press.
    temporarily_released: bool,
    /// A second press arrived while the key was still down; the next
    /// release cancels the pending press instead of going out.
    pressed_twice: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rule {
    context: usize,
    input: usize,
}

pub struct Stage {
    contexts: Vec<Context>,
    override_sets: Vec<MappingOverrideSet>,
    active_override_set: Option<usize>,
    active_contexts: Vec<usize>,
    /// Base of the context-major mapping index per context.
    mapping_index_base: Vec<usize>,
    match_seq: MatchKeySequence,
    exit_sequence: Vec<Key>,
    exit_sequence_position: usize,

    /// The input since the last match, or already matched but still held.
    sequence: KeySequence,
    sequence_might_match: bool,
    /// End of the currently matched prefix of `sequence`; virtual-key
    /// toggles may erase inside it while an output is applied.
    matched_end: usize,
    output_down: Vec<OutputDown>,
    output_buffer: KeySequence,
    expression_scratch: KeySequence,
    any_key_scratch: Vec<Key>,
}

impl Stage {
    pub fn new(contexts: Vec<Context>, mut override_sets: Vec<MappingOverrideSet>) -> Self {
        for set in &mut override_sets {
            set.sort_by_key(|o| o.mapping_index);
        }
        let mut mapping_index_base = Vec::with_capacity(contexts.len());
        let mut base = 0;
        for context in &contexts {
            mapping_index_base.push(base);
            base += context.inputs.len();
        }
        let active_contexts = (0..contexts.len()).collect();
        Self {
            contexts,
            override_sets,
            active_override_set: None,
            active_contexts,
            mapping_index_base,
            match_seq: MatchKeySequence::default(),
            exit_sequence: Vec::new(),
            exit_sequence_position: 0,
            sequence: KeySequence::new(),
            sequence_might_match: false,
            matched_end: 0,
            output_down: Vec::new(),
            output_buffer: KeySequence::new(),
            expression_scratch: KeySequence::new(),
            any_key_scratch: Vec::new(),
        }
    }

    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    pub fn sequence(&self) -> &[KeyEvent] {
        &self.sequence
    }

    pub fn is_output_down(&self) -> bool {
        !self.output_down.is_empty()
    }

    /// Replaces the active rule set. The host must not call this while
    /// `is_output_down()`; a pending release could no longer be targeted.
    pub fn set_active_contexts(&mut self, indices: &[usize]) {
        self.active_contexts.clear();
        self.active_contexts
            .extend(indices.iter().copied().filter(|&i| i < self.contexts.len()));
    }

    pub fn activate_override_set(&mut self, index: Option<usize>) {
        self.active_override_set = index.filter(|&i| i < self.override_sets.len());
    }

    pub fn set_exit_sequence(&mut self, keys: &[Key]) {
        self.exit_sequence = keys.to_vec();
        self.exit_sequence_position = 0;
    }

    pub fn should_exit(&self) -> bool {
        !self.exit_sequence.is_empty()
            && self.exit_sequence_position == self.exit_sequence.len()
    }

    pub fn update(&mut self, event: KeyEvent) -> KeySequence {
        self.apply_input(event);
        std::mem::take(&mut self.output_buffer)
    }

    /// Donates an emptied buffer back for the next `update`.
    pub fn reuse_buffer(&mut self, mut buffer: KeySequence) {
        buffer.clear();
        self.output_buffer = buffer;
    }

    /// Reconciles the engine with reality after the host lost the input
    /// stream (lock screen, session switch): buffered presses and
    /// triggers that are no longer physically down are dropped, virtual
    /// latches survive.
    pub fn validate_state(&mut self, is_down: impl Fn(Key) -> bool) {
        self.sequence_might_match = false;
        self.sequence.retain(|event| {
            event.key.is_virtual_key()
                || (matches!(event.state, KeyState::Down | KeyState::DownMatched)
                    && is_down(event.key))
        });
        self.output_down.retain(|output| is_down(output.trigger));
    }

    fn advance_exit_sequence(&mut self, event: KeyEvent) {
        if self.exit_sequence.is_empty() || self.should_exit() || event.state != KeyState::Down {
            return;
        }
        if self.exit_sequence[self.exit_sequence_position] == event.key {
            self.exit_sequence_position += 1;
        } else if self.exit_sequence[0] == event.key {
            self.exit_sequence_position = 1;
        } else {
            self.exit_sequence_position = 0;
        }
    }

    fn apply_input(&mut self, event: KeyEvent) {
        debug_assert!(matches!(event.state, KeyState::Down | KeyState::Up));
        self.advance_exit_sequence(event);

        if event.state == KeyState::Down {
            if let Some(index) = self.sequence.iter().position(|e| e.key == event.key) {
                let has_up = self
                    .sequence
                    .iter()
                    .any(|e| e.is(event.key, KeyState::Up));
                if !has_up {
                    // key repeat, keep only the most recent press
                    self.sequence.remove(index);
                }
            }
        }
        self.sequence.push(event);

        if event.state == KeyState::Up {
            // release outputs bound to this trigger
            self.release_triggered(event.key);

            // drop a consumed-and-released press, unless the buffer is
            // held for a pending might-match
            if !self.sequence_might_match {
                if let Some(index) = self.sequence.iter().position(|e| e.key == event.key) {
                    if self.sequence[index].state == KeyState::DownMatched {
                        self.sequence.remove(index);
                    }
                }
            }
        }

        for output in &mut self.output_down {
            output.suppressed = false;
        }

        let mut may_retry_prefix = self.sequence_might_match;
        self.sequence_might_match = false;
        while has_non_optional(&self.sequence) {
            let (result, rule) = self.match_input(self.sequence.len(), true);

            if result == MatchResult::MightMatch {
                self.sequence_might_match = true;
                break;
            }

            let (rule, matched_len) = if result == MatchResult::Match {
                (rule, self.sequence.len())
            } else if may_retry_prefix && self.sequence.len() > 1 {
                // the hold just failed: the prefix that was held may
                // still match on its own (once)
                may_retry_prefix = false;
                let (retry, rule) = self.match_input(self.sequence.len() - 1, false);
                if retry == MatchResult::Match {
                    (rule, self.sequence.len() - 1)
                } else {
                    (None, 0)
                }
            } else {
                (None, 0)
            };

            if let Some(rule) = rule {
                self.matched_end = matched_len;
                let trigger = self.sequence[matched_len - 1];
                self.apply_expression(rule, trigger.key);
                if trigger.state == KeyState::Up {
                    // the rule may have bound new outputs to a trigger
                    // that is already gone
                    self.release_triggered(trigger.key);
                }
                self.finish_sequence();
                continue;
            }

            self.forward_from_sequence();
        }
    }

    /// Scans the active rules. Any rule that might match holds the
    /// buffer; otherwise the first full match in declaration order wins.
    fn match_input(&mut self, len: usize, accept_might_match: bool) -> (MatchResult, Option<Rule>) {
        let buffer = &self.sequence[..len];
        let contexts = &self.contexts;
        let match_seq = &mut self.match_seq;
        let mut first_match = None;
        for &ci in &self.active_contexts {
            let Some(context) = contexts.get(ci) else {
                continue;
            };
            for (ii, input) in context.inputs.iter().enumerate() {
                match match_seq.matches(&input.template, buffer) {
                    MatchResult::Match => {
                        if first_match.is_none() {
                            first_match = Some(Rule {
                                context: ci,
                                input: ii,
                            });
                        }
                    }
                    MatchResult::MightMatch if accept_might_match => {
                        return (MatchResult::MightMatch, None);
                    }
                    _ => {}
                }
            }
        }
        match first_match {
            Some(rule) => (MatchResult::Match, Some(rule)),
            None => (MatchResult::NoMatch, None),
        }
    }

    fn get_output(&self, rule: Rule) -> Option<&KeySequence> {
        if let Some(set) = self.active_override_set {
            let set = &self.override_sets[set];
            let mapping_index = self.mapping_index_base[rule.context] + rule.input;
            if let Ok(index) = set.binary_search_by_key(&mapping_index, |o| o.mapping_index) {
                return Some(&set[index].output);
            }
        }
        match self.contexts[rule.context].inputs[rule.input].output {
            OutputRef::Sequence(index) => self.contexts[rule.context].outputs.get(index),
            OutputRef::Command(command) => self.find_command_output(command),
        }
    }

    /// Specific active contexts take the binding over the default
    /// context; an unbound command consumes its input silently.
    fn find_command_output(&self, command: usize) -> Option<&KeySequence> {
        for &ci in &self.active_contexts {
            if ci == 0 {
                continue;
            }
            if let Some(output) = self
                .contexts
                .get(ci)
                .and_then(|c| c.command_outputs.iter().find(|co| co.index == command))
            {
                return Some(&output.output);
            }
        }
        self.contexts
            .first()
            .and_then(|c| c.command_outputs.iter().find(|co| co.index == command))
            .map(|co| &co.output)
    }

    fn apply_expression(&mut self, rule: Rule, trigger: Key) {
        let mut expression = std::mem::take(&mut self.expression_scratch);
        expression.clear();
        if let Some(output) = self.get_output(rule) {
            expression.extend_from_slice(output);
        }
        self.apply_output(&expression, trigger);
        self.expression_scratch = expression;
    }

    fn apply_output(&mut self, expression: &[KeyEvent], trigger: Key) {
        for event in expression {
            if event.key.is_virtual_key() {
                if event.state == KeyState::Down {
                    self.toggle_virtual_key(event.key);
                }
            } else if event.key == Key::ANY {
                self.output_current_sequence(expression, event.state, trigger);
            } else {
                self.update_output(*event, trigger);
            }
        }
    }

    /// `Any` in an output: one event per live buffer entry, except keys
    /// the expression gates with `Not`.
    fn output_current_sequence(&mut self, expression: &[KeyEvent], state: KeyState, trigger: Key) {
        let mut keys = std::mem::take(&mut self.any_key_scratch);
        keys.clear();
        for event in &self.sequence {
            if event.state != KeyState::DownMatched
                && !expression
                    .iter()
                    .any(|e| e.key == event.key && e.state == KeyState::Not)
            {
                keys.push(event.key);
            }
        }
        for &key in &keys {
            self.update_output(KeyEvent::new(key, state), trigger);
        }
        self.any_key_scratch = keys;
    }

    /// Virtual-key latches live in the input buffer itself: present
    /// means on.
    fn toggle_virtual_key(&mut self, key: Key) {
        if let Some(index) = self.sequence.iter().position(|e| e.key == key) {
            self.sequence.remove(index);
            if index < self.matched_end {
                self.matched_end -= 1;
            }
        } else {
            self.sequence.push(KeyEvent::new(key, KeyState::Down));
        }
    }

    /// Releases all outputs bound to `key`, newest first.
    fn release_triggered(&mut self, key: Key) {
        let mut index = self.output_down.len();
        while index > 0 {
            index -= 1;
            if self.output_down[index].trigger == key {
                let entry = self.output_down.remove(index);
                if !entry.temporarily_released {
                    self.output_buffer.push(KeyEvent::new(entry.key, KeyState::Up));
                }
            }
        }
    }

    /// Forwards the first unclaimed event of the buffer verbatim.
    fn forward_from_sequence(&mut self) {
        for index in 0..self.sequence.len() {
            let event = self.sequence[index];
            match event.state {
                KeyState::Down | KeyState::DownMatched => {
                    let up = self.sequence[index..]
                        .iter()
                        .position(|e| e.is(event.key, KeyState::Up))
                        .map(|p| p + index);
                    if let Some(up) = up {
                        self.update_output(event, event.key);
                        self.release_triggered(event.key);
                        self.sequence.remove(up);
                        self.sequence.remove(index);
                        return;
                    }
                    if event.state == KeyState::Down {
                        self.update_output(event, event.key);
                        self.sequence[index].state = KeyState::DownMatched;
                        return;
                    }
                }
                KeyState::Up => {
                    self.release_triggered(event.key);
                    self.sequence.remove(index);
                    return;
                }
                _ => {}
            }
        }
    }

    fn update_output(&mut self, event: KeyEvent, trigger: Key) {
        let index = self.output_down.iter().position(|o| o.key == event.key);
        match event.state {
            KeyState::Up => {
                if let Some(index) = index {
                    if self.output_down[index].pressed_twice {
                        // cancel the pending press instead of sending a
                        // no-op press/release pair
                        if let Some(pending) = self
                            .output_buffer
                            .iter()
                            .position(|e| e.is(event.key, KeyState::Down))
                        {
                            self.output_buffer.remove(pending);
                        }
                        self.output_down[index].pressed_twice = false;
                    } else {
                        self.output_down.remove(index);
                        self.output_buffer.push(event);
                    }
                }
            }

            KeyState::Not => {
                // make sure the key is released while this output plays
                if let Some(index) = index {
                    let entry = &mut self.output_down[index];
                    if !entry.temporarily_released {
                        entry.temporarily_released = true;
                        self.output_buffer.push(KeyEvent::new(event.key, KeyState::Up));
                    }
                    self.output_down[index].suppressed = true;
                }
            }

            KeyState::Down => {
                let mut reapplied = false;
                let (output_down, output_buffer) =
                    (&mut self.output_down, &mut self.output_buffer);
                for output in output_down.iter_mut() {
                    if output.temporarily_released && !output.suppressed {
                        output.temporarily_released = false;
                        output_buffer.push(KeyEvent::new(output.key, KeyState::Down));
                        reapplied = true;
                    }
                }

                match index {
                    None => self.output_down.push(OutputDown {
                        key: event.key,
                        trigger,
                        suppressed: false,
                        temporarily_released: false,
                        pressed_twice: false,
                    }),
                    Some(index) => {
                        // already down; a reapplication in between makes
                        // this a real second press
                        if reapplied {
                            self.output_buffer
                                .push(KeyEvent::new(event.key, KeyState::Up));
                        }
                        self.output_down[index].temporarily_released = false;
                        self.output_down[index].pressed_twice = true;
                    }
                }
                self.output_buffer.push(event);
            }

            KeyState::OutputOnRelease => self.output_buffer.push(event),

            KeyState::DownMatched => {}

            KeyState::UpAsync | KeyState::DownAsync => {
                debug_assert!(false, "async states never reach the output");
            }
        }
    }

    /// Settles the matched prefix: presses still physically held become
    /// `DownMatched`, everything else is dropped.
    fn finish_sequence(&mut self) {
        let mut end = self.matched_end;
        let mut index = 0;
        while index < end {
            let event = self.sequence[index];
            if matches!(event.state, KeyState::Down | KeyState::DownMatched) {
                let up = self.sequence[index + 1..]
                    .iter()
                    .position(|e| e.is(event.key, KeyState::Up))
                    .map(|p| p + index + 1);
                if let Some(up) = up {
                    self.sequence.remove(up);
                    if up < end {
                        end -= 1;
                    }
                    self.sequence.remove(index);
                    end -= 1;
                } else {
                    self.sequence[index].state = KeyState::DownMatched;
                    index += 1;
                }
            } else {
                self.sequence.remove(index);
                end -= 1;
            }
        }
    }
}

fn has_non_optional(sequence: &[KeyEvent]) -> bool {
    sequence
        .iter()
        .any(|e| matches!(e.state, KeyState::Down | KeyState::Up))
}
