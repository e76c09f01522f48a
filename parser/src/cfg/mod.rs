//! The line-oriented configuration parser.
//!
//! A configuration is a list of macro definitions, mappings and context
//! blocks:
//!
//! ```text
//! Boss = VirtualBoss               # macro
//! Shift{A} >> B                    # mapping
//! C >> EditCut                     # command declaration
//!
//! [system="Linux" class="terminal"]
//! EditCut >> Control{ShiftLeft{X}} # command binding for this context
//! ```
//!
//! Parsing produces a [`Config`]: the compiled contexts (index 0 is the
//! default context, which also receives the contents of system-only
//! blocks that match the running OS), the terminal-command actions and
//! the virtual-key aliases. `system` filters are evaluated here and
//! never reach the engine; contexts for other systems are dropped
//! entirely.

mod error;
pub use error::{error_with_source, ParseError, Result};

mod filter;
pub use filter::Filter;

mod key_sequence;
pub use key_sequence::{ParseKeySequence, SequenceError};

pub mod str_iter;
use str_iter::{find_mapping_operator, strip_comment, Cursor};


use crate::keys::{str_to_key, Key};
use crate::sequence::{KeyEvent, KeySequence, KeyState};
use rustc_hash::FxHashMap as HashMap;

/// Reference from a matched input to the output it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRef {
    /// Index into the owning context's `outputs`.
    Sequence(usize),
    /// Index of a command whose binding is resolved against the active
    /// contexts at match time.
    Command(usize),
}

#[derive(Debug, Clone)]
pub struct Input {
    pub template: KeySequence,
    pub output: OutputRef,
}

/// Binds a command's output within one context.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub index: usize,
    pub output: KeySequence,
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    pub inputs: Vec<Input>,
    pub outputs: Vec<KeySequence>,
    pub command_outputs: Vec<CommandOutput>,
    pub window_class_filter: Option<Filter>,
    pub window_title_filter: Option<Filter>,
    pub window_path_filter: Option<Filter>,
    pub device_filter: Option<Filter>,
}

impl Context {
    pub fn matches(&self, class: &str, title: &str, path: &str) -> bool {
        self.window_class_filter
            .as_ref()
            .is_none_or(|f| f.matches_exact(class))
            && self
                .window_title_filter
                .as_ref()
                .is_none_or(|f| f.matches_substring(title))
            && self
                .window_path_filter
                .as_ref()
                .is_none_or(|f| f.matches_exact(path))
    }

    pub fn matches_device(&self, device: &str) -> bool {
        self.device_filter
            .as_ref()
            .is_none_or(|f| f.matches_exact(device))
    }
}

#[derive(Debug, Clone)]
pub struct Action {
    pub terminal_command: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Compiled contexts; index 0 is the default context.
    pub contexts: Vec<Context>,
    pub actions: Vec<Action>,
    pub virtual_key_aliases: Vec<(String, Key)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            contexts: vec![Context::default()],
            actions: Vec::new(),
            virtual_key_aliases: Vec::new(),
        }
    }
}

/// An alternate output for the mapping at `mapping_index` (the position
/// of its input in context-major enumeration order). Sets are sorted by
/// index at Stage construction and probed by binary search.
#[derive(Debug, Clone)]
pub struct MappingOverride {
    pub mapping_index: usize,
    pub output: KeySequence,
}

pub type MappingOverrideSet = Vec<MappingOverride>;

pub fn parse_config(text: &str) -> Result<Config> {
    parse_config_named(text, "")
}

pub fn parse_config_named(text: &str, file_name: &str) -> Result<Config> {
    let mut parser = ParseConfig::new(text, file_name);
    let mut offset = 0;
    for (index, line) in text.split('\n').enumerate() {
        parser.line_no = index + 1;
        parser.line_span = (offset, line.len());
        parser.parse_line(line)?;
        offset += line.len() + 1;
    }
    parser.finish()
}

pub fn parse_config_file(path: &std::path::Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ParseError::new(0, format!("cannot read '{}': {e}", path.display())))?;
    parse_config_named(&text, &path.display().to_string())
}

const MAX_MACRO_DEPTH: usize = 16;

const LOGICAL_KEYS: [Key; 4] = [Key::SHIFT, Key::CONTROL, Key::ALT, Key::META];

struct Command {
    name: String,
    line: usize,
    mapped: bool,
}

/// What to do with the context under construction when it completes.
enum SystemState {
    /// `system` filter for another OS; parsed for validation, then dropped.
    Mismatched,
    /// Only a matching `system` filter; folded into the default context.
    SystemOnly,
    /// Carries window/device filters; becomes a context of its own.
    Filtered,
}

struct ParseConfig<'t> {
    text: &'t str,
    file_name: &'t str,
    line_no: usize,
    line_span: (usize, usize),
    config: Config,
    commands: Vec<Command>,
    macros: HashMap<String, String>,
    virtual_keys: HashMap<String, Key>,
    scratch: Option<(Context, SystemState)>,
}

impl<'t> ParseConfig<'t> {
    fn new(text: &'t str, file_name: &'t str) -> Self {
        Self {
            text,
            file_name,
            line_no: 0,
            line_span: (0, 0),
            config: Config::default(),
            commands: Vec::new(),
            macros: HashMap::default(),
            virtual_keys: HashMap::default(),
            scratch: None,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line_no, message)
            .with_span(self.line_span.0, self.line_span.1)
            .with_source(self.file_name, self.text)
    }

    fn parse_line(&mut self, line: &str) -> Result<()> {
        let mut cursor = Cursor::new(line);
        if cursor.at_end() {
            return Ok(());
        }
        if cursor.skip_char('[') {
            // the context cursor skips comments itself; a '#' may occur
            // inside a regex value
            return self.parse_context(cursor);
        }
        let line = strip_comment(line);
        let mut cursor = Cursor::new(line);
        cursor.skip_space();
        let name = cursor.read_ident().to_string();
        cursor.skip_space();
        let is_macro = !name.is_empty() && cursor.peek() == Some('=');
        if let Some(op) = find_mapping_operator(line) {
            // a macro definition may carry '>>' in its value
            if !is_macro || cursor.pos() > op {
                let left = line[..op].trim().to_string();
                let right = line[op + 2..].trim().to_string();
                return self.parse_mapping(&left, &right);
            }
        }
        if is_macro {
            cursor.advance();
            return self.parse_macro(name, cursor.rest());
        }
        Err(self.error("expected a macro definition, a mapping or a context"))
    }

    fn parse_macro(&mut self, name: String, value: &str) -> Result<()> {
        if str_to_key(&name).is_some() {
            return Err(self.error(format!("macro name '{name}' collides with a key name")));
        }
        self.macros.insert(name, value.trim().to_string());
        Ok(())
    }

    fn parse_context(&mut self, mut cursor: Cursor) -> Result<()> {
        let mut context = Context::default();
        let mut system: Option<bool> = None;
        let mut any_filter = false;
        loop {
            cursor.skip_space_and_comment();
            match cursor.peek() {
                None => return Err(self.error("missing ']' at end of context")),
                Some(']') => {
                    cursor.advance();
                    break;
                }
                Some(_) => {}
            }
            let key = cursor.read_ident().to_string();
            if key.is_empty() {
                return Err(self.error("expected a context filter name"));
            }
            cursor.skip_space();
            if (key == "window" || key == "Window") && cursor.peek() != Some('=') {
                continue;
            }
            if !cursor.skip_char('=') {
                return Err(self.error(format!("expected '=' after '{key}'")));
            }
            cursor.skip_space();
            let value = cursor
                .read_filter_value()
                .ok_or_else(|| self.error(format!("expected a value for '{key}'")))?
                .to_string();
            any_filter = true;
            match key.as_str() {
                "system" => {
                    if value.starts_with('/') {
                        return Err(self.error("the system filter does not accept a regex"));
                    }
                    system = Some(value.eq_ignore_ascii_case(current_system()));
                }
                "class" => context.window_class_filter = Some(self.parse_filter(&value)?),
                "title" => context.window_title_filter = Some(self.parse_filter(&value)?),
                "path" => context.window_path_filter = Some(self.parse_filter(&value)?),
                "device" => context.device_filter = Some(self.parse_filter(&value)?),
                _ => return Err(self.error(format!("unknown context filter '{key}'"))),
            }
        }
        if !cursor.at_end() {
            return Err(self.error("unexpected text after context"));
        }
        if !any_filter {
            return Err(self.error("a context needs at least one filter"));
        }

        self.commit_scratch()?;
        let has_other_filters = context.window_class_filter.is_some()
            || context.window_title_filter.is_some()
            || context.window_path_filter.is_some()
            || context.device_filter.is_some();
        let state = match system {
            Some(false) => SystemState::Mismatched,
            Some(true) if !has_other_filters => SystemState::SystemOnly,
            _ => SystemState::Filtered,
        };
        self.scratch = Some((context, state));
        Ok(())
    }

    fn parse_filter(&self, value: &str) -> Result<Filter> {
        Filter::parse(value).map_err(|message| self.error(message))
    }

    fn parse_mapping(&mut self, left: &str, right: &str) -> Result<()> {
        let left = self.preprocess(left)?;
        let right = self.preprocess(right)?;
        let left = left.trim();
        let right = right.trim();
        if left.is_empty() {
            return Err(self.error("missing input before '>>'"));
        }

        // left side naming a declared command binds its output here
        if let Some(command) = single_ident(left).and_then(|name| self.find_command(name)) {
            if single_ident(right).is_some_and(|name| self.find_command(name).is_some()) {
                return Err(self.error("cannot map a command to a command"));
            }
            let output = self.parse_seq(right, false)?;
            return self.add_command_binding(command, replace_logical_output(output));
        }

        let input = self.parse_seq(left, true)?;
        if input.is_empty() {
            return Err(self.error("the input expression is empty"));
        }

        // a single identifier that is no key declares a command
        if let Some(name) = single_ident(right) {
            if str_to_key(name).is_none() && !name.starts_with("Virtual") {
                if self.find_command(name).is_some() {
                    return Err(self.error(format!("command '{name}' is already defined")));
                }
                if self.scratch.is_some() {
                    return Err(self.error("commands can only be defined before the first context"));
                }
                let index = self.commands.len();
                self.commands.push(Command {
                    name: name.to_string(),
                    line: self.line_no,
                    mapped: false,
                });
                for template in expand_logical_input(input) {
                    self.config.contexts[0].inputs.push(Input {
                        template,
                        output: OutputRef::Command(index),
                    });
                }
                return Ok(());
            }
        }

        let output = self.parse_seq(right, false)?;
        self.add_mapping(input, replace_logical_output(output))
    }

    fn parse_seq(&mut self, text: &str, is_input: bool) -> Result<KeySequence> {
        let result = {
            let virtual_keys = &mut self.virtual_keys;
            let aliases = &mut self.config.virtual_key_aliases;
            let actions = &mut self.config.actions;
            let mut resolve = |name: &str| {
                str_to_key(name).or_else(|| {
                    if !name.starts_with("Virtual") {
                        return None;
                    }
                    Some(*virtual_keys.entry(name.to_string()).or_insert_with(|| {
                        let key = Key::virtual_key(aliases.len());
                        aliases.push((name.to_string(), key));
                        key
                    }))
                })
            };
            let mut add_command = |command: &str| {
                actions.push(Action {
                    terminal_command: command.to_string(),
                });
                Key::action(actions.len() - 1)
            };
            let mut parser = ParseKeySequence {
                resolve_key: &mut resolve,
                add_terminal_command: &mut add_command,
            };
            if is_input {
                parser.input(text)
            } else {
                parser.output(text)
            }
        };
        result.map_err(|e| self.error(e.to_string()))
    }

    fn find_command(&self, name: &str) -> Option<usize> {
        self.commands.iter().position(|c| c.name == name)
    }

    fn current_context(&self) -> &Context {
        match &self.scratch {
            Some((context, _)) => context,
            None => &self.config.contexts[0],
        }
    }

    fn current_context_mut(&mut self) -> &mut Context {
        match &mut self.scratch {
            Some((context, _)) => context,
            None => &mut self.config.contexts[0],
        }
    }

    fn add_command_binding(&mut self, command: usize, output: KeySequence) -> Result<()> {
        self.commands[command].mapped = true;
        if self
            .current_context()
            .command_outputs
            .iter()
            .any(|co| co.index == command)
        {
            return Err(self.error(format!(
                "command '{}' is already mapped in this context",
                self.commands[command].name
            )));
        }
        self.current_context_mut().command_outputs.push(CommandOutput {
            index: command,
            output,
        });
        Ok(())
    }

    fn add_mapping(&mut self, input: KeySequence, output: KeySequence) -> Result<()> {
        let context = self.current_context_mut();
        let output_index = context.outputs.len();
        context.outputs.push(output);
        for template in expand_logical_input(input) {
            context.inputs.push(Input {
                template,
                output: OutputRef::Sequence(output_index),
            });
        }
        Ok(())
    }

    /// Expands macro occurrences textually; `$(…)` bodies are kept
    /// verbatim.
    fn preprocess(&self, text: &str) -> Result<String> {
        self.preprocess_depth(text, 0)
    }

    fn preprocess_depth(&self, text: &str, depth: usize) -> Result<String> {
        if depth > MAX_MACRO_DEPTH {
            return Err(self.error("recursive macro expansion"));
        }
        let mut out = String::new();
        let mut chars = text.char_indices().peekable();
        while let Some(&(start, c)) = chars.peek() {
            if c == '$' {
                out.push(c);
                chars.next();
                if matches!(chars.peek(), Some(&(_, '('))) {
                    for (_, c) in chars.by_ref() {
                        out.push(c);
                        if c == ')' {
                            break;
                        }
                    }
                }
            } else if c.is_alphanumeric() || c == '_' {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        end = i + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let ident = &text[start..end];
                match self.macros.get(ident) {
                    Some(value) => out.push_str(&self.preprocess_depth(value, depth + 1)?),
                    None => out.push_str(ident),
                }
            } else {
                out.push(c);
                chars.next();
            }
        }
        Ok(out)
    }

    fn commit_scratch(&mut self) -> Result<()> {
        let Some((context, state)) = self.scratch.take() else {
            return Ok(());
        };
        match state {
            SystemState::Mismatched => {
                log::debug!("dropping context for another system (line {})", self.line_no);
            }
            SystemState::Filtered => self.config.contexts.push(context),
            SystemState::SystemOnly => {
                for co in &context.command_outputs {
                    if self.config.contexts[0]
                        .command_outputs
                        .iter()
                        .any(|c| c.index == co.index)
                    {
                        return Err(self.error(format!(
                            "command '{}' is already mapped in the default context",
                            self.commands[co.index].name
                        )));
                    }
                }
                let Context {
                    inputs,
                    outputs,
                    command_outputs,
                    ..
                } = context;
                let default = &mut self.config.contexts[0];
                let base = default.outputs.len();
                default.outputs.extend(outputs);
                for mut input in inputs {
                    if let OutputRef::Sequence(index) = input.output {
                        input.output = OutputRef::Sequence(index + base);
                    }
                    default.inputs.push(input);
                }
                default.command_outputs.extend(command_outputs);
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Config> {
        self.commit_scratch()?;
        if let Some(command) = self.commands.iter().find(|c| !c.mapped) {
            return Err(ParseError::new(
                command.line,
                format!("command '{}' is not mapped", command.name),
            )
            .with_source(self.file_name, self.text));
        }
        Ok(self.config)
    }
}

fn current_system() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else {
        "linux"
    }
}

fn single_ident(text: &str) -> Option<&str> {
    (!text.is_empty() && text.chars().all(|c| c.is_alphanumeric() || c == '_')).then_some(text)
}

/// Expands parse-time logical modifiers in an input template: `!Shift`
/// becomes `!ShiftLeft !ShiftRight` within the template, every other use
/// splits the mapping into one variant per physical key, left first.
fn expand_logical_input(template: KeySequence) -> Vec<KeySequence> {
    let mut base = KeySequence::with_capacity(template.len());
    for event in template {
        match event.key.physical_variants() {
            Some((left, right)) if event.state == KeyState::Not => {
                base.push(KeyEvent::new(left, KeyState::Not));
                base.push(KeyEvent::new(right, KeyState::Not));
            }
            _ => base.push(event),
        }
    }

    let mut variants = vec![base];
    for logical in LOGICAL_KEYS {
        let Some((left, right)) = logical.physical_variants() else {
            continue;
        };
        if !variants[0].iter().any(|e| e.key == logical) {
            continue;
        }
        variants = variants
            .into_iter()
            .flat_map(|template| {
                let substitute = |variant: Key| {
                    let mut t = template.clone();
                    for event in &mut t {
                        if event.key == logical {
                            event.key = variant;
                        }
                    }
                    t
                };
                [substitute(left), substitute(right)]
            })
            .collect();
    }
    variants
}

/// Output templates always use the left-hand variant, except `Not`
/// gates which must release either side.
fn replace_logical_output(template: KeySequence) -> KeySequence {
    let mut out = KeySequence::with_capacity(template.len());
    for event in template {
        match event.key.physical_variants() {
            Some((left, right)) if event.state == KeyState::Not => {
                out.push(KeyEvent::new(left, KeyState::Not));
                out.push(KeyEvent::new(right, KeyState::Not));
            }
            Some((left, _)) => out.push(KeyEvent {
                key: left,
                ..event
            }),
            None => out.push(event),
        }
    }
    out
}
