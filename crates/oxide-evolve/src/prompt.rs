//! Confirmation prompts for interactive workflows.

use crate::error::Result;

/// Asks the user yes/no questions.
pub trait Prompter {
    /// Asks `prompt`; returns true for yes.
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// Prompter that gives the same answer to everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Answer(pub bool);

impl Prompter for Answer {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(self.0)
    }
}

/// Asks through `prompter`; no prompter means no.
pub fn confirm(prompter: Option<&mut dyn Prompter>, prompt: &str) -> Result<bool> {
    match prompter {
        Some(prompter) => prompter.confirm(prompt),
        None => Ok(false),
    }
}
