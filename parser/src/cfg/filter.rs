//! Context filters: literal strings or `/…/` regexes with an optional
//! `i` flag. Class, path and device filters compare literally against
//! the whole string; title filters match substrings. Regexes use
//! unanchored search, so a filter only anchors where the pattern itself
//! uses `^`/`$`.

use regex::{Regex, RegexBuilder};

#[derive(Debug, Clone)]
pub struct Filter {
    /// The value as written in the configuration; regexes keep their
    /// delimiters and flags.
    pub text: String,
    regex: Option<Regex>,
}

impl Filter {
    pub fn parse(text: &str) -> Result<Self, String> {
        if let Some(rest) = text.strip_prefix('/') {
            let close = rest
                .rfind('/')
                .ok_or_else(|| format!("unterminated regex '{text}'"))?;
            let (pattern, flags) = rest.split_at(close);
            let mut builder = RegexBuilder::new(pattern);
            for flag in flags[1..].chars() {
                match flag {
                    'i' => {
                        builder.case_insensitive(true);
                    }
                    _ => return Err(format!("unsupported regex flag '{flag}'")),
                }
            }
            let regex = builder
                .build()
                .map_err(|e| format!("invalid regex '{text}': {e}"))?;
            return Ok(Self {
                text: text.to_string(),
                regex: Some(regex),
            });
        }
        Ok(Self {
            text: text.to_string(),
            regex: None,
        })
    }

    pub fn is_regex(&self) -> bool {
        self.regex.is_some()
    }

    /// Whole-string comparison for literals; an empty literal matches
    /// anything.
    pub fn matches_exact(&self, value: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(value),
            None => self.text.is_empty() || self.text == value,
        }
    }

    /// Substring comparison for literals.
    pub fn matches_substring(&self, value: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(value),
            None => value.contains(&self.text),
        }
    }
}
