//! Structured shell commands for remote execution.
//!
//! Remote commands are never assembled with `format!`. A [`Cmd`] keeps
//! the program and every argument as separate data, and [`Script`]
//! joins commands with typed connectors. Only [`Script::render`] turns
//! them into shell text, quoting each value on the way out, so an app
//! name or path can never change the meaning of the command.

use std::fmt;

/// Quote a value for a POSIX shell.
///
/// Values made only of characters that are inert in `sh` are returned
/// as-is so rendered commands stay readable.
#[must_use]
pub fn quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(is_inert) {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\"'\"'");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

const fn is_inert(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/' | ':' | '@' | '%' | '+' | ',')
}

/// A single program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    env: Vec<(String, String)>,
    program: String,
    args: Vec<String>,
    output: Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Keep,
    DropStdout,
    DropAll,
}

impl Cmd {
    #[must_use]
    pub fn new(program: &str) -> Self {
        Self {
            env: Vec::new(),
            program: program.to_string(),
            args: Vec::new(),
            output: Output::Keep,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for this command only.
    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Discard stdout and stderr.
    #[must_use]
    pub const fn quiet(mut self) -> Self {
        self.output = Output::DropAll;
        self
    }

    /// Discard stdout only; errors still reach the caller.
    #[must_use]
    pub const fn discard_stdout(mut self) -> Self {
        self.output = Output::DropStdout;
        self
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub const fn is_quiet(&self) -> bool {
        matches!(self.output, Output::DropAll)
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut parts = Vec::with_capacity(self.env.len() + self.args.len() + 2);
        for (key, value) in &self.env {
            parts.push(format!("{key}={}", quote(value)));
        }
        parts.push(quote(&self.program));
        parts.extend(self.args.iter().map(|a| quote(a)));
        match self.output {
            Output::Keep => {}
            Output::DropStdout => parts.push(">/dev/null".to_string()),
            Output::DropAll => parts.push(">/dev/null 2>&1".to_string()),
        }
        parts.join(" ")
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// How a command is joined to the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    /// `&&`: run only if the previous pipeline succeeded.
    And,
    /// `||`: run only if the previous pipeline failed.
    Or,
    /// `;`: run unconditionally.
    Then,
    /// `|`: feed stdout of the previous command.
    Pipe,
}

impl Connector {
    const fn token(self) -> &'static str {
        match self {
            Self::And => " && ",
            Self::Or => " || ",
            Self::Then => "; ",
            Self::Pipe => " | ",
        }
    }
}

/// A sequence of commands joined by connectors, optionally run as
/// root through `sudo -n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    first: Cmd,
    rest: Vec<(Connector, Cmd)>,
    sudo: bool,
}

impl Script {
    #[must_use]
    pub const fn new(cmd: Cmd) -> Self {
        Self {
            first: cmd,
            rest: Vec::new(),
            sudo: false,
        }
    }

    #[must_use]
    pub fn and(self, cmd: Cmd) -> Self {
        self.join(Connector::And, cmd)
    }

    #[must_use]
    pub fn or(self, cmd: Cmd) -> Self {
        self.join(Connector::Or, cmd)
    }

    #[must_use]
    pub fn then(self, cmd: Cmd) -> Self {
        self.join(Connector::Then, cmd)
    }

    #[must_use]
    pub fn pipe(self, cmd: Cmd) -> Self {
        self.join(Connector::Pipe, cmd)
    }

    /// Never fail: `|| true`.
    #[must_use]
    pub fn or_true(self) -> Self {
        self.or(Cmd::new("true"))
    }

    /// Run the whole script as root with non-interactive sudo.
    #[must_use]
    pub const fn sudo(mut self, enabled: bool) -> Self {
        self.sudo = enabled;
        self
    }

    #[must_use]
    pub const fn is_sudo(&self) -> bool {
        self.sudo
    }

    fn join(mut self, connector: Connector, cmd: Cmd) -> Self {
        self.rest.push((connector, cmd));
        self
    }

    /// Commands in order, each with the connector that precedes it.
    pub fn commands(&self) -> impl Iterator<Item = (Option<Connector>, &Cmd)> {
        std::iter::once((None, &self.first)).chain(self.rest.iter().map(|(c, cmd)| (Some(*c), cmd)))
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut body = self.first.render();
        for (connector, cmd) in &self.rest {
            body.push_str(connector.token());
            body.push_str(&cmd.render());
        }
        if self.sudo {
            format!("sudo -n sh -c {}", quote(&body))
        } else {
            body
        }
    }
}

impl From<Cmd> for Script {
    fn from(cmd: Cmd) -> Self {
        Self::new(cmd)
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
