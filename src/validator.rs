// src/validator.rs

use crate::types::PLATE_SYLLABLES;
use anyhow::{Context, Result};
use regex::Regex;

/// Structural plate grammar: a 2-or-3-digit run, exactly one whitelisted
/// Hangul syllable, then exactly a 4-digit run. The digit runs may not be
/// flanked by further digits, so over-long runs never yield a partial match.
#[derive(Debug, Clone)]
pub struct PlateValidator {
    pattern: Regex,
}

impl PlateValidator {
    pub fn new() -> Result<Self> {
        // The regex crate has no lookaround; non-digit boundary groups keep
        // the digit runs exact.
        let pattern = format!(
            "(?:^|[^0-9])([0-9]{{2,3}})([{syllables}])([0-9]{{4}})(?:[^0-9]|$)",
            syllables = PLATE_SYLLABLES
        );
        let pattern = Regex::new(&pattern).context("Failed to compile plate grammar")?;
        Ok(Self { pattern })
    }

    /// Extract the first embedded substring matching the grammar. Surrounding
    /// noise is discarded; no match is an outcome, not an error.
    pub fn extract(&self, text: &str) -> Option<String> {
        let caps = self.pattern.captures(text)?;
        Some(format!("{}{}{}", &caps[1], &caps[2], &caps[3]))
    }
}
