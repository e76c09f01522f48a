//! The simulation driver: reads a text script of key events and focus
//! changes, runs them through the host, and prints what would have been
//! synthesized.
//!
//! Script lines hold whitespace-separated `kind:value` steps:
//!
//! ```text
//! press:ShiftLeft press:A release:A release:ShiftLeft
//! tap:CapsLock tap:H
//! focus class=firefox title="Mozilla Firefox"
//! validate
//! ```
//!
//! `press`/`down`/`d`, `release`/`up`/`u` and `tap`/`t` are accepted;
//! one output line is printed per script line, in `+A -A` notation.

use crate::host::Host;
use anyhow::{anyhow, bail, Result};
use keywarp_parser::cfg::str_iter::{strip_comment, Cursor};
use keywarp_parser::cfg::Config;
use keywarp_parser::keys::{str_to_key, Key};
use keywarp_parser::sequence::{format_sequence, KeyEvent, KeyState};
use rustc_hash::FxHashSet;
use std::io::BufRead;

enum Step {
    Key(Key, KeyState),
    Tap(Key),
    Focus {
        class: String,
        title: String,
        path: String,
    },
    Validate,
}

fn parse_key(name: &str) -> Result<Key> {
    str_to_key(name).ok_or_else(|| anyhow!("unknown key: {name}"))
}

fn parse_steps(line: &str) -> Result<Vec<Step>> {
    let line = strip_comment(line).trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }

    if let Some(rest) = line.strip_prefix("focus") {
        let mut cursor = Cursor::new(rest);
        let (mut class, mut title, mut path) = (String::new(), String::new(), String::new());
        while !cursor.at_end() {
            let key = cursor.read_ident().to_string();
            if !cursor.skip_char('=') {
                bail!("expected '=' after '{key}' in focus line");
            }
            let value = cursor
                .read_filter_value()
                .ok_or_else(|| anyhow!("missing value for '{key}' in focus line"))?
                .to_string();
            match key.as_str() {
                "class" => class = value,
                "title" => title = value,
                "path" => path = value,
                _ => bail!("unknown focus attribute '{key}'"),
            }
        }
        return Ok(vec![Step::Focus { class, title, path }]);
    }

    if line == "validate" {
        return Ok(vec![Step::Validate]);
    }

    let mut steps = Vec::new();
    for pair in line.split_whitespace() {
        let Some((kind, value)) = pair.split_once(':') else {
            bail!("invalid step '{pair}', expected kind:value");
        };
        steps.push(match kind {
            "press" | "down" | "d" => Step::Key(parse_key(value)?, KeyState::Down),
            "release" | "up" | "u" => Step::Key(parse_key(value)?, KeyState::Up),
            "tap" | "t" => Step::Tap(parse_key(value)?),
            _ => bail!("invalid step prefix '{kind}'"),
        });
    }
    Ok(steps)
}

/// Drives the host from a script. `reload` is polled between lines and
/// may hand over a freshly parsed configuration. Returns early when the
/// exit sequence was read.
pub fn run(
    host: &mut Host,
    reader: impl BufRead,
    mut reload: impl FnMut() -> Option<Config>,
) -> Result<()> {
    let mut pressed: FxHashSet<Key> = FxHashSet::default();
    let mut emitted = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if let Some(config) = reload() {
            log::info!("configuration updated");
            host.reload(config);
        }

        let steps = parse_steps(&line)?;
        if steps.is_empty() {
            continue;
        }

        emitted.clear();
        let mut running = true;
        for step in steps {
            match step {
                Step::Key(key, state) => {
                    match state {
                        KeyState::Down => pressed.insert(key),
                        _ => pressed.remove(&key),
                    };
                    running = host
                        .handle_event(KeyEvent::new(key, state), &mut |e| emitted.push(e));
                }
                Step::Tap(key) => {
                    running = host
                        .handle_event(KeyEvent::new(key, KeyState::Down), &mut |e| {
                            emitted.push(e)
                        })
                        && host.handle_event(KeyEvent::new(key, KeyState::Up), &mut |e| {
                            emitted.push(e)
                        });
                }
                Step::Focus { class, title, path } => host.set_focus(class, title, path),
                Step::Validate => host.validate_state(|key| pressed.contains(&key)),
            }
            if !running {
                break;
            }
        }
        println!("{}", format_sequence(&emitted));
        if !running {
            break;
        }
    }
    Ok(())
}
