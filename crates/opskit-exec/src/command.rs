//! Argv-style command specification

use std::fmt;

use crate::error::ExecError;

/// An immutable, non-empty argument vector
///
/// The first element is the program to run. Local executors spawn the
/// argv directly; SSH executors send [`CommandSpec::to_shell_line`] so the
/// remote shell applies its own quoting and globbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    argv: Vec<String>,
}

impl CommandSpec {
    /// Build a command from an argument sequence
    ///
    /// # Errors
    /// Returns `ExecError::InvalidCommand` if `argv` is empty or the program
    /// name is blank.
    pub fn new<I, S>(argv: I) -> Result<Self, ExecError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();

        match argv.first() {
            None => Err(ExecError::InvalidCommand("empty command".to_string())),
            Some(program) if program.trim().is_empty() => Err(ExecError::InvalidCommand(
                "program name is blank".to_string(),
            )),
            Some(_) => Ok(Self { argv }),
        }
    }

    /// Program name (first argument)
    #[must_use]
    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    /// Arguments after the program name
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    /// Full argument vector
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Join the arguments into a single line for a remote shell
    ///
    /// Arguments are joined with single spaces and are not quoted.
    #[must_use]
    pub fn to_shell_line(&self) -> String {
        self.argv.join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell_line())
    }
}

impl TryFrom<&str> for CommandSpec {
    type Error = ExecError;

    /// Split on whitespace; no quoting rules are applied
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.split_whitespace())
    }
}
