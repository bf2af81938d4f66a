//! Structured shell commands.
//!
//! A [`Command`] is an argument list in which every element is either a
//! literal (quoted when rendered) or a raw shell token such as `|`, `;` or
//! `&&` that is emitted verbatim. Remote session backends render it into a
//! single POSIX shell line.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One element of a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Arg {
    /// Passed to the shell as a single word.
    Literal(String),
    /// Shell syntax, emitted unquoted.
    Raw(String),
}

/// An argument list with shell-metacharacter markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    args: Vec<Arg>,
}

impl Command {
    /// Starts a command with its program name.
    pub fn new(program: impl Into<String>) -> Self {
        Command {
            args: vec![Arg::Literal(program.into())],
        }
    }

    /// Appends a literal argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Literal(arg.into()));
        self
    }

    /// Appends several literal arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .extend(args.into_iter().map(|a| Arg::Literal(a.into())));
        self
    }

    /// Appends a raw shell token.
    pub fn raw(mut self, token: impl Into<String>) -> Self {
        self.args.push(Arg::Raw(token.into()));
        self
    }

    pub fn pipe(self) -> Self {
        self.raw("|")
    }

    /// `;`, sequencing regardless of status.
    pub fn then(self) -> Self {
        self.raw(";")
    }

    /// `&&`
    pub fn and(self) -> Self {
        self.raw("&&")
    }

    /// `||`
    pub fn or(self) -> Self {
        self.raw("||")
    }

    /// Appends `> path`.
    pub fn redirect_to(self, path: impl Into<String>) -> Self {
        self.raw(">").arg(path)
    }

    pub fn parts(&self) -> &[Arg] {
        &self.args
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Renders the command as one POSIX shell line.
    pub fn render(&self) -> String {
        self.args
            .iter()
            .map(|arg| match arg {
                Arg::Literal(s) => shell_words::quote(s).into_owned(),
                Arg::Raw(s) => s.clone(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
