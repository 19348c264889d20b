//! Regex alterations applied while canonicalising payload text.
//!
//! Plain rules are straight find/replace. Rules whose replacement begins
//! with `$` introduce *alteration variables*: the first text a rule matches
//! is remembered under the variable name, and every later occurrence of the
//! same text is rewritten to that name, for the lifetime of the server.

use regex::Regex;

use crate::config::{RcConfig, GENERAL_SECTION};

#[derive(Debug)]
struct AlterationRule {
    pattern: Regex,
    replacement: String,
}

/// The configured alteration rules plus accumulated variable state.
#[derive(Debug, Default)]
pub struct Alterations {
    rules: Vec<AlterationRule>,
    /// matched text -> assigned variable name, in assignment order.
    variables: Vec<(String, String)>,
}

impl Alterations {
    /// Build from the `[general] alterations` list: each name denotes a
    /// section carrying `match_pattern` and `replacement`.
    pub fn from_config(config: &RcConfig) -> Self {
        let mut rules = Vec::new();
        for name in config.get_list(GENERAL_SECTION, "alterations") {
            let Some(pattern) = config.get(&name, "match_pattern") else {
                log::warn!("Alteration [{name}] has no match_pattern, ignoring");
                continue;
            };
            match Regex::new(pattern) {
                Ok(pattern) => rules.push(AlterationRule {
                    pattern,
                    replacement: config.get_or(&name, "replacement", "").to_string(),
                }),
                Err(e) => log::warn!("Alteration [{name}] has an invalid match_pattern: {e}"),
            }
        }
        Self {
            rules,
            variables: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.variables.is_empty()
    }

    /// Forget accumulated variables; rules stay. Called on server reset.
    pub fn reset(&mut self) {
        self.variables.clear();
    }

    /// Canonicalise `text`. Idempotent: variable names assigned by earlier
    /// passes are recognised and left alone.
    pub fn apply(&mut self, text: &str) -> String {
        // Known variables first, so the same input always canonicalises the
        // same way no matter when it was first seen.
        let mut result = text.to_string();
        for (matched, name) in &self.variables {
            result = result.replace(matched, name);
        }
        for index in 0..self.rules.len() {
            result = self.apply_rule(index, &result);
        }
        result
    }

    fn apply_rule(&mut self, index: usize, text: &str) -> String {
        let replacement = self.rules[index].replacement.clone();
        match replacement.strip_prefix('$') {
            Some(base_name) => {
                let base_name = base_name.to_string();
                let mut result = String::new();
                let mut last_end = 0;
                let ranges: Vec<(usize, usize)> = self.rules[index]
                    .pattern
                    .find_iter(text)
                    .map(|m| (m.start(), m.end()))
                    .collect();
                for (start, end) in ranges {
                    let matched = &text[start..end];
                    result.push_str(&text[last_end..start]);
                    result.push_str(&self.variable_for(matched, &base_name));
                    last_end = end;
                }
                result.push_str(&text[last_end..]);
                result
            }
            None => self.rules[index].pattern.replace_all(text, replacement.as_str()).into_owned(),
        }
    }

    fn variable_for(&mut self, matched: &str, base_name: &str) -> String {
        // An already-assigned name must stay stable under a second pass.
        if self.variables.iter().any(|(_, name)| name.as_str() == matched) {
            return matched.to_string();
        }
        if let Some((_, name)) = self.variables.iter().find(|(text, _)| text.as_str() == matched) {
            return name.clone();
        }
        let taken = |candidate: &str| {
            self.variables.iter().any(|(_, name)| name.as_str() == candidate)
        };
        let mut name = base_name.to_string();
        let mut suffix = 2;
        while taken(&name) {
            name = format!("{base_name}_{suffix}");
            suffix += 1;
        }
        self.variables.push((matched.to_string(), name.clone()));
        name
    }
}
