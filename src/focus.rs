//! Focused-window tracking and active-context selection.
//!
//! Window detection itself is a capability the embedder provides; the
//! tracker only turns the focused window into the vector of context
//! indices the engine should consider, and reports when that vector
//! changed so the host can push it to the Stage at a safe moment.

use keywarp_parser::cfg::Config;

/// A source of focused-window information. Implementations are probed
/// in registration order; `update` returns `true` when it detected a
/// focus change.
pub trait FocusedWindowProbe {
    fn update(&mut self) -> bool;
    fn class(&self) -> &str;
    fn title(&self) -> &str;
    fn path(&self) -> &str;
}

/// A probe fed by the embedder (the simulation driver's `focus` lines).
#[derive(Default)]
pub struct StaticFocus {
    class: String,
    title: String,
    path: String,
    changed: bool,
}

impl StaticFocus {
    pub fn set(&mut self, class: String, title: String, path: String) {
        self.changed = class != self.class || title != self.title || path != self.path;
        self.class = class;
        self.title = title;
        self.path = path;
    }
}

impl FocusedWindowProbe for StaticFocus {
    fn update(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    fn class(&self) -> &str {
        &self.class
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn path(&self) -> &str {
        &self.path
    }
}

#[derive(Default)]
pub struct ContextTracker {
    active: Vec<usize>,
    scratch: Vec<usize>,
}

impl ContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_contexts(&self) -> &[usize] {
        &self.active
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }

    /// Recomputes the active contexts from the probe. Returns `true`
    /// when the set changed and should be pushed to the engine.
    pub fn update(&mut self, config: &Config, probe: &mut dyn FocusedWindowProbe) -> bool {
        if probe.update() {
            log::debug!(
                "focused window changed: class='{}' title='{}' path='{}'",
                probe.class(),
                probe.title(),
                probe.path()
            );
        } else if !self.active.is_empty() {
            return false;
        }

        self.scratch.clear();
        for (index, context) in config.contexts.iter().enumerate() {
            if context.matches(probe.class(), probe.title(), probe.path()) {
                self.scratch.push(index);
            }
        }

        if self.scratch != self.active {
            log::debug!("active contexts updated: {:?}", self.scratch);
            std::mem::swap(&mut self.active, &mut self.scratch);
            return true;
        }
        false
    }
}
