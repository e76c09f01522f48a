use super::*;
use keywarp_parser::cfg::{parse_config, MappingOverride};
use keywarp_parser::keys::str_to_key;
use keywarp_parser::sequence::format_sequence;
use rustc_hash::FxHashMap;

fn key(name: &str) -> Key {
    str_to_key(name).expect(name)
}

fn stage(config: &str) -> Stage {
    let config = parse_config(config).expect(config);
    Stage::new(config.contexts, Vec::new())
}

fn event(text: &str) -> KeyEvent {
    let (state, name) = text.split_at(1);
    let state = match state {
        "+" => KeyState::Down,
        "-" => KeyState::Up,
        _ => panic!("bad event {text}"),
    };
    KeyEvent::new(key(name), state)
}

/// Feeds one `+Key`/`-Key` event and returns the emitted sequence in
/// debug notation.
fn feed(stage: &mut Stage, text: &str) -> String {
    let output = stage.update(event(text));
    let formatted = format_sequence(&output);
    stage.reuse_buffer(output);
    formatted
}

#[test]
fn simple_remap() {
    let mut stage = stage("A >> B");
    assert_eq!(feed(&mut stage, "+A"), "+B");
    assert_eq!(feed(&mut stage, "-A"), "-B");
    assert!(!stage.is_output_down());
}

#[test]
fn modifier_hold() {
    let mut stage = stage("Shift{A} >> B");
    // neither the press nor the release of the modifier reaches output
    assert_eq!(feed(&mut stage, "+ShiftLeft"), "");
    assert_eq!(feed(&mut stage, "+A"), "+B");
    assert_eq!(feed(&mut stage, "-A"), "-B");
    assert_eq!(feed(&mut stage, "-ShiftLeft"), "");

    // tapping repeatedly while the modifier stays down
    assert_eq!(feed(&mut stage, "+ShiftLeft"), "");
    assert_eq!(feed(&mut stage, "+A"), "+B");
    assert_eq!(feed(&mut stage, "-A"), "-B");
    assert_eq!(feed(&mut stage, "+A"), "+B");
    assert_eq!(feed(&mut stage, "-A"), "-B");
    assert_eq!(feed(&mut stage, "-ShiftLeft"), "");
}

#[test]
fn ambiguity_hold() {
    let config = "A >> X
                  A B >> Y";
    let mut stage = stage(config);
    // the buffer is held while the longer rule might still match
    assert_eq!(feed(&mut stage, "+A"), "");
    assert_eq!(feed(&mut stage, "-A"), "");
    assert_eq!(feed(&mut stage, "+B"), "+Y");
    assert_eq!(feed(&mut stage, "-B"), "-Y");
}

#[test]
fn ambiguity_hold_resolves_to_the_short_rule() {
    let config = "A >> X
                  A B >> Y";
    let mut stage = stage(config);
    assert_eq!(feed(&mut stage, "+A"), "");
    assert_eq!(feed(&mut stage, "-A"), "");
    // C rules out `A B`; the held prefix matches `A` and C is forwarded
    assert_eq!(feed(&mut stage, "+C"), "+X -X +C");
    assert_eq!(feed(&mut stage, "-C"), "-C");
}

#[test]
fn ambiguity_hold_with_key_still_down() {
    let config = "A >> X
                  A B >> Y";
    let mut stage = stage(config);
    assert_eq!(feed(&mut stage, "+A"), "");
    assert_eq!(feed(&mut stage, "+C"), "+X +C");
    // X stays bound to the still-held A
    assert_eq!(feed(&mut stage, "-C"), "-C");
    assert_eq!(feed(&mut stage, "-A"), "-X");
}

#[test]
fn not_gate() {
    let mut stage = stage("!Shift A >> X");
    // with Shift held everything passes through unchanged
    assert_eq!(feed(&mut stage, "+ShiftLeft"), "+ShiftLeft");
    assert_eq!(feed(&mut stage, "+A"), "+A");
    assert_eq!(feed(&mut stage, "-A"), "-A");
    assert_eq!(feed(&mut stage, "-ShiftLeft"), "-ShiftLeft");
    // without it the rule applies
    assert_eq!(feed(&mut stage, "+A"), "+X");
    assert_eq!(feed(&mut stage, "-A"), "-X");
}

#[test]
fn output_on_release_marker_is_emitted() {
    let mut stage = stage("A >> X ^ Y");
    // the engine emits the whole template; the host splits at ^
    assert_eq!(feed(&mut stage, "+A"), "+X -X ^ +Y -Y");
    assert_eq!(feed(&mut stage, "-A"), "");
}

#[test]
fn virtual_toggle() {
    let config = "CapsLock >> VirtualNav
                  VirtualNav{H} >> Left";
    let mut stage = stage(config);
    // latch on
    assert_eq!(feed(&mut stage, "+CapsLock"), "");
    assert_eq!(feed(&mut stage, "-CapsLock"), "");
    assert_eq!(feed(&mut stage, "+H"), "+Left");
    assert_eq!(feed(&mut stage, "-H"), "-Left");
    // latch off
    assert_eq!(feed(&mut stage, "+CapsLock"), "");
    assert_eq!(feed(&mut stage, "-CapsLock"), "");
    assert_eq!(feed(&mut stage, "+H"), "+H");
    assert_eq!(feed(&mut stage, "-H"), "-H");
}

#[test]
fn key_repeat_is_folded() {
    let mut stage = stage("A >> B");
    assert_eq!(feed(&mut stage, "+A"), "+B");
    // OS key repeat: the buffer keeps a single press, the output
    // repeats the mapped key
    assert_eq!(feed(&mut stage, "+A"), "+B");
    assert_eq!(feed(&mut stage, "+A"), "+B");
    assert_eq!(
        stage
            .sequence()
            .iter()
            .filter(|e| e.key == key("A"))
            .count(),
        1
    );
    assert_eq!(feed(&mut stage, "-A"), "-B");
}

#[test]
fn unmapped_keys_pass_through() {
    let mut stage = stage("A >> B");
    assert_eq!(feed(&mut stage, "+C"), "+C");
    assert_eq!(feed(&mut stage, "+C"), "+C");
    assert_eq!(feed(&mut stage, "-C"), "-C");
}

#[test]
fn suppressed_output() {
    // mapping to nothing swallows the key
    let mut stage = stage("A >>");
    assert_eq!(feed(&mut stage, "+A"), "");
    assert_eq!(feed(&mut stage, "-A"), "");
}

#[test]
fn not_in_output_temporarily_releases() {
    let mut stage = stage("1 >> !Shift F1");
    // the forwarded Shift is lifted around the F1 press
    assert_eq!(feed(&mut stage, "+ShiftLeft"), "+ShiftLeft");
    assert_eq!(feed(&mut stage, "+1"), "-ShiftLeft +F1");
    assert_eq!(feed(&mut stage, "-1"), "-F1");
    // the next unrelated press reapplies it
    assert_eq!(feed(&mut stage, "+2"), "+ShiftLeft +2");
    assert_eq!(feed(&mut stage, "-2"), "-2");
    assert_eq!(feed(&mut stage, "-ShiftLeft"), "-ShiftLeft");
}

#[test]
fn second_press_of_held_output_is_cancelled_on_release() {
    let config = "B >> A
                  C >> A X";
    let mut stage = stage(config);
    assert_eq!(feed(&mut stage, "+B"), "+A");
    // C wants to tap A which is already down; press and release cancel
    // out and only X goes through
    assert_eq!(feed(&mut stage, "+C"), "+X -X");
    assert_eq!(feed(&mut stage, "-C"), "");
    assert_eq!(feed(&mut stage, "-B"), "-A");
}

#[test]
fn any_key_in_output() {
    let mut stage = stage("A >> Any");
    assert_eq!(feed(&mut stage, "+A"), "+A");
    assert_eq!(feed(&mut stage, "-A"), "-A");
}

#[test]
fn command_binding_resolution() {
    let config = "A >> cmd
                  cmd >> X
                  [class='one']
                  cmd >> Y
                  [class='two']
                  cmd >> Z";
    let mut stage = stage(config);

    stage.set_active_contexts(&[0]);
    assert_eq!(feed(&mut stage, "+A"), "+X");
    assert_eq!(feed(&mut stage, "-A"), "-X");

    // a specific context takes the binding over the default
    stage.set_active_contexts(&[0, 1]);
    assert_eq!(feed(&mut stage, "+A"), "+Y");
    assert_eq!(feed(&mut stage, "-A"), "-Y");

    stage.set_active_contexts(&[0, 1, 2]);
    assert_eq!(feed(&mut stage, "+A"), "+Y");
    assert_eq!(feed(&mut stage, "-A"), "-Y");

    stage.set_active_contexts(&[0, 2]);
    assert_eq!(feed(&mut stage, "+A"), "+Z");
    assert_eq!(feed(&mut stage, "-A"), "-Z");
}

#[test]
fn unbound_command_consumes_silently() {
    let config = "A >> cmd
                  [class='one']
                  cmd >> Y";
    let mut stage = stage(config);
    stage.set_active_contexts(&[0]);
    assert_eq!(feed(&mut stage, "+A"), "");
    assert_eq!(feed(&mut stage, "-A"), "");
}

#[test]
fn override_sets_substitute_outputs() {
    let config = "A >> B
                  C >> D";
    let config = parse_config(config).unwrap();
    // deliberately unsorted; Stage sorts by mapping index
    let sets = vec![vec![
        MappingOverride {
            mapping_index: 1,
            output: vec![KeyEvent::new(key("F2"), KeyState::Down)],
        },
        MappingOverride {
            mapping_index: 0,
            output: vec![KeyEvent::new(key("F1"), KeyState::Down)],
        },
    ]];
    let mut stage = Stage::new(config.contexts, sets);

    assert_eq!(feed(&mut stage, "+A"), "+B");
    assert_eq!(feed(&mut stage, "-A"), "-B");

    stage.activate_override_set(Some(0));
    assert_eq!(feed(&mut stage, "+A"), "+F1");
    assert_eq!(feed(&mut stage, "-A"), "-F1");
    assert_eq!(feed(&mut stage, "+C"), "+F2");
    assert_eq!(feed(&mut stage, "-C"), "-F2");

    // out of range deactivates
    stage.activate_override_set(Some(7));
    assert_eq!(feed(&mut stage, "+A"), "+B");
    assert_eq!(feed(&mut stage, "-A"), "-B");
}

#[test]
fn validate_state_reconciles_with_reality() {
    let mut stage = stage("Shift{A} >> B");
    assert_eq!(feed(&mut stage, "+ShiftLeft"), "");
    assert_eq!(feed(&mut stage, "+A"), "+B");
    assert!(stage.is_output_down());

    // the session was stolen; nothing is physically down anymore
    stage.validate_state(|_| false);
    assert!(!stage.is_output_down());
    assert!(stage.sequence().is_empty());

    // releases that arrive afterwards pass through as no-ops
    assert_eq!(feed(&mut stage, "-A"), "");
    assert_eq!(feed(&mut stage, "-ShiftLeft"), "");
}

#[test]
fn validate_state_keeps_virtual_latches() {
    let config = "CapsLock >> VirtualNav
                  VirtualNav{H} >> Left";
    let mut stage = stage(config);
    assert_eq!(feed(&mut stage, "+CapsLock"), "");
    assert_eq!(feed(&mut stage, "-CapsLock"), "");
    stage.validate_state(|_| false);
    assert_eq!(feed(&mut stage, "+H"), "+Left");
    assert_eq!(feed(&mut stage, "-H"), "-Left");
}

#[test]
fn exit_sequence() {
    let mut stage = stage("A >> B");
    stage.set_exit_sequence(&[key("ControlLeft"), key("Escape"), key("K")]);
    feed(&mut stage, "+ControlLeft");
    feed(&mut stage, "+Escape");
    assert!(!stage.should_exit());
    feed(&mut stage, "+K");
    assert!(stage.should_exit());
}

#[test]
fn exit_sequence_resets_on_mismatch() {
    let mut stage = stage("A >> B");
    stage.set_exit_sequence(&[key("ControlLeft"), key("Escape"), key("K")]);
    feed(&mut stage, "+ControlLeft");
    feed(&mut stage, "+C");
    feed(&mut stage, "+Escape");
    feed(&mut stage, "+K");
    assert!(!stage.should_exit());
    // restarting at the first key works at any point
    feed(&mut stage, "+ControlLeft");
    feed(&mut stage, "+Escape");
    feed(&mut stage, "+K");
    assert!(stage.should_exit());
}

#[test]
fn emitted_events_balance() {
    let config = "Shift{A} >> B
                  A B >> Y
                  A >> X
                  CapsLock >> VirtualNav
                  VirtualNav{H} >> Left
                  1 >> !Shift F1";
    let mut stage = stage(config);
    let script = [
        "+ShiftLeft", "+A", "-A", "-ShiftLeft", "+A", "+B", "-B", "-A", "+A", "-A", "+CapsLock",
        "-CapsLock", "+H", "-H", "+CapsLock", "-CapsLock", "+1", "-1", "+ShiftLeft", "+1", "-1",
        "-ShiftLeft", "+C", "-C",
    ];
    let mut balance: FxHashMap<Key, i64> = FxHashMap::default();
    for step in script {
        let output = stage.update(event(step));
        for emitted in &output {
            match emitted.state {
                KeyState::Down => *balance.entry(emitted.key).or_default() += 1,
                KeyState::Up => {
                    let count = balance.entry(emitted.key).or_default();
                    *count -= 1;
                    assert!(*count >= 0, "release of {} before press", emitted.key);
                }
                other => panic!("unexpected emitted state {other:?}"),
            }
        }
        stage.reuse_buffer(output);
    }
    assert!(!stage.is_output_down());
    for (key, count) in balance {
        assert_eq!(count, 0, "unbalanced output for {key}");
    }
}
