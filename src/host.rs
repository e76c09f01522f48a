//! The host: owns the engine, the focus tracker and the output
//! dispatcher, and defers every reconfiguration to a moment when no
//! synthesized key is held down.

use crate::exec::execute_terminal_command;
use crate::focus::{ContextTracker, StaticFocus};
use crate::output::OutputDispatcher;
use crate::stage::Stage;
use keywarp_parser::cfg::Config;
use keywarp_parser::keys::Key;
use keywarp_parser::sequence::{format_sequence, KeyEvent};

/// Pressing these in order shuts the host down.
pub const EXIT_SEQUENCE: [Key; 3] = [Key::CONTROL_LEFT, Key::ESCAPE, Key::K];

pub struct Host {
    config: Config,
    stage: Stage,
    focus: StaticFocus,
    tracker: ContextTracker,
    dispatcher: OutputDispatcher,
    new_stage: Option<(Config, Stage)>,
    new_active_contexts: Option<Vec<usize>>,
    run_actions: bool,
}

impl Host {
    pub fn new(config: Config, run_actions: bool) -> Self {
        let mut stage = Stage::new(config.contexts.clone(), Vec::new());
        stage.set_exit_sequence(&EXIT_SEQUENCE);
        let mut host = Self {
            config,
            stage,
            focus: StaticFocus::default(),
            tracker: ContextTracker::new(),
            dispatcher: OutputDispatcher::new(),
            new_stage: None,
            new_active_contexts: None,
            run_actions,
        };
        host.update_active_contexts();
        host.apply_updates();
        host
    }

    /// Queues a new configuration; it takes effect once no output key
    /// is held.
    pub fn reload(&mut self, config: Config) {
        let mut stage = Stage::new(config.contexts.clone(), Vec::new());
        stage.set_exit_sequence(&EXIT_SEQUENCE);
        self.new_stage = Some((config, stage));
        self.tracker.clear();
        self.apply_updates();
    }

    pub fn set_focus(&mut self, class: String, title: String, path: String) {
        self.focus.set(class, title, path);
        self.update_active_contexts();
        self.apply_updates();
    }

    pub fn validate_state(&mut self, is_down: impl Fn(Key) -> bool) {
        self.stage.validate_state(is_down);
    }

    fn update_active_contexts(&mut self) {
        if self.tracker.update(&self.config, &mut self.focus) {
            self.new_active_contexts = Some(self.tracker.active_contexts().to_vec());
        }
    }

    /// Swaps in pending configuration and context changes, but never
    /// while a synthesized key is still down.
    fn apply_updates(&mut self) {
        if self.stage.is_output_down() {
            return;
        }
        if let Some((config, stage)) = self.new_stage.take() {
            self.config = config;
            self.stage = stage;
            self.tracker.clear();
            self.update_active_contexts();
        }
        if let Some(indices) = self.new_active_contexts.take() {
            self.stage.set_active_contexts(&indices);
        }
    }

    /// Translates one physical event; synthesized events go to `emit`.
    /// Returns `false` when the exit sequence was completed.
    pub fn handle_event(&mut self, event: KeyEvent, emit: &mut dyn FnMut(KeyEvent)) -> bool {
        if self.dispatcher.before_input(event, emit) {
            return true;
        }
        self.apply_updates();

        let output = self.stage.update(event);
        if self.stage.should_exit() {
            log::info!("read exit sequence");
            return false;
        }
        log::debug!(
            "{} --> {}",
            format_sequence(&[event]),
            format_sequence(&output)
        );

        let actions = &self.config.actions;
        let run_actions = self.run_actions;
        self.dispatcher.dispatch(&output, emit, &mut |index| {
            if let Some(action) = actions.get(index) {
                log::info!("triggered action: {}", action.terminal_command);
                if run_actions {
                    execute_terminal_command(&action.terminal_command);
                }
            }
        });
        self.stage.reuse_buffer(output);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keywarp_parser::cfg::parse_config;
    use keywarp_parser::keys::str_to_key;
    use keywarp_parser::sequence::{format_sequence, KeyState};

    fn host(config: &str) -> Host {
        Host::new(parse_config(config).unwrap(), false)
    }

    fn feed(host: &mut Host, text: &str) -> String {
        let (state, name) = text.split_at(1);
        let state = match state {
            "+" => KeyState::Down,
            "-" => KeyState::Up,
            _ => panic!("bad event {text}"),
        };
        let mut emitted = Vec::new();
        assert!(host.handle_event(
            KeyEvent::new(str_to_key(name).expect(name), state),
            &mut |e| emitted.push(e)
        ));
        format_sequence(&emitted)
    }

    #[test]
    fn output_on_release_blocks_until_the_trigger_release() {
        let mut host = host("A >> X ^ Y");
        assert_eq!(feed(&mut host, "+A"), "+X -X");
        // blocked while A is held
        assert_eq!(feed(&mut host, "+B"), "");
        assert_eq!(feed(&mut host, "-A"), "+Y -Y");
    }

    #[test]
    fn focus_changes_are_deferred_while_output_is_down() {
        let config = "A >> cmd
                      cmd >> X
                      [class='term']
                      cmd >> Y";
        let mut host = host(config);
        assert_eq!(feed(&mut host, "+A"), "+X");

        // X is still down; the context switch must wait for its release
        host.set_focus("term".into(), String::new(), String::new());
        assert_eq!(feed(&mut host, "-A"), "-X");

        assert_eq!(feed(&mut host, "+A"), "+Y");
        assert_eq!(feed(&mut host, "-A"), "-Y");
    }

    #[test]
    fn reload_is_deferred_while_output_is_down() {
        let mut host = host("A >> X");
        assert_eq!(feed(&mut host, "+A"), "+X");
        host.reload(parse_config("A >> Z").unwrap());
        assert_eq!(feed(&mut host, "-A"), "-X");
        assert_eq!(feed(&mut host, "+A"), "+Z");
        assert_eq!(feed(&mut host, "-A"), "-Z");
    }

    #[test]
    fn exit_sequence_stops_the_host() {
        let mut host = host("A >> B");
        let mut sink = |_e: KeyEvent| {};
        for key in EXIT_SEQUENCE {
            let done = host.handle_event(KeyEvent::new(key, KeyState::Down), &mut sink);
            if key == *EXIT_SEQUENCE.last().unwrap() {
                assert!(!done);
            } else {
                assert!(done);
            }
        }
    }
}
