//! Interactive user prompts
//!
//! Front-ends that want to put a human in the loop supply this capability.
//! The default answers the way an unattended run should: never approve an
//! action, never veto one, never produce input.

use kextmgr_core::Result;

/// User interaction capability for interactive loads
pub trait UserPrompt {
    /// Ask the user to approve an action; `default_answer` is what a bare
    /// return should mean
    fn approve(&self, default_answer: bool, message: &str) -> Result<bool>;

    /// Give the user a chance to veto an action; returns whether to proceed
    fn veto(&self, default_answer: bool, message: &str) -> Result<bool>;

    /// Request a line of input from the user
    fn input(&self, message: &str) -> Result<Option<String>>;
}

/// Non-interactive defaults: deny approval, allow everything vetoable,
/// return no input
#[derive(Debug, Default)]
pub struct NullPrompt;

impl UserPrompt for NullPrompt {
    fn approve(&self, _default_answer: bool, _message: &str) -> Result<bool> {
        Ok(false)
    }

    fn veto(&self, _default_answer: bool, _message: &str) -> Result<bool> {
        Ok(true)
    }

    fn input(&self, _message: &str) -> Result<Option<String>> {
        Ok(None)
    }
}
