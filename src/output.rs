//! Host-side consumption of the engine's output.
//!
//! The Stage emits one flat sequence per update; this module splits it
//! at the `OutputOnRelease` marker, withholds the tail until the next
//! release arrives (swallowing all input in between), and turns
//! action-key presses into action callbacks instead of key events.

use keywarp_parser::sequence::{KeyEvent, KeySequence, KeyState};

#[derive(Default)]
pub struct OutputDispatcher {
    on_release: KeySequence,
    output_on_release: bool,
}

impl OutputDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called before an input event reaches the Stage. Returns `true`
    /// when the event must be swallowed: after an `OutputOnRelease`
    /// split, everything up to the next release is blocked; the release
    /// itself first flushes the withheld tail.
    pub fn before_input(&mut self, event: KeyEvent, send: &mut dyn FnMut(KeyEvent)) -> bool {
        if !self.output_on_release {
            return false;
        }
        if event.state != KeyState::Up {
            return true;
        }
        for event in self.on_release.drain(..) {
            send(event);
        }
        self.output_on_release = false;
        false
    }

    /// Routes one Stage output buffer: key events to `send`, action-key
    /// presses to `trigger_action`; action-key releases are dropped.
    pub fn dispatch(
        &mut self,
        output: &[KeyEvent],
        send: &mut dyn FnMut(KeyEvent),
        trigger_action: &mut dyn FnMut(usize),
    ) {
        for &event in output {
            if event.state == KeyState::OutputOnRelease {
                self.output_on_release = true;
            } else if let Some(action) = event.key.action_index() {
                if event.state == KeyState::Down {
                    trigger_action(action);
                }
            } else if self.output_on_release {
                self.on_release.push(event);
            } else {
                send(event);
            }
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.output_on_release
    }
}
