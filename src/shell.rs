//! Interactive line shell.
//!
//! ```text
//! (liath) login alice secret
//! (liath) use tenant_a
//! (liath) query return kv.list_column_families()
//! ```
//!
//! `query` and `install_package` require a prior `login`. On a terminal the
//! shell reads through a line editor with history; Ctrl-C clears the line
//! and Ctrl-D leaves.

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{BufRead, Write};

use crate::engine::OutputFormat;
use crate::error::Error;
use crate::namespace::DEFAULT_NAMESPACE;
use crate::Liath;

const PROMPT: &str = "(liath) ";
const BANNER: &str = "liath shell, type `help` for commands";

const HELP: &str = "\
commands:
  login <user> <password>        authenticate
  create_user <user> <password>  add a user
  use <namespace>                switch namespace
  create_namespace <namespace>   create a namespace
  list_namespaces                list namespaces
  format <dict|json|yaml|markdown>
  query <lua>                    run a script in the current namespace
  install_package <package>      record a package for the current namespace
  exit";

/// Line editor seam, so the interactive loop runs without a terminal.
pub trait LineEditor {
    fn read_line(&mut self, prompt: &str) -> rustyline::Result<String>;
    fn add_history(&mut self, line: &str);
}

impl LineEditor for DefaultEditor {
    fn read_line(&mut self, prompt: &str) -> rustyline::Result<String> {
        self.readline(prompt)
    }

    fn add_history(&mut self, line: &str) {
        if let Err(e) = self.add_history_entry(line) {
            tracing::debug!(error = %e, "Failed to record shell history");
        }
    }
}

pub struct Shell<'a> {
    liath: &'a Liath,
    namespace: String,
    format: OutputFormat,
    user: Option<String>,
}

impl<'a> Shell<'a> {
    pub fn new(liath: &'a Liath) -> Self {
        Self {
            liath,
            namespace: DEFAULT_NAMESPACE.to_string(),
            format: OutputFormat::Json,
            user: None,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Drive the shell from a line editor until `exit` or Ctrl-D.
    pub fn interactive<E: LineEditor, W: Write>(
        &mut self,
        editor: &mut E,
        mut output: W,
    ) -> rustyline::Result<()> {
        writeln!(output, "{BANNER}")?;
        loop {
            let line = match editor.read_line(PROMPT) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(e) => return Err(e),
            };
            let line = line.trim();
            if !line.is_empty() {
                editor.add_history(line);
            }
            if !self.handle(line, &mut output)? {
                break;
            }
        }
        Ok(())
    }

    /// Read commands from piped input until `exit` or end of input.
    pub fn run<R: BufRead, W: Write>(&mut self, input: R, mut output: W) -> std::io::Result<()> {
        writeln!(output, "{BANNER}")?;
        write!(output, "{PROMPT}")?;
        output.flush()?;

        for line in input.lines() {
            let line = line?;
            if !self.handle(line.trim(), &mut output)? {
                break;
            }
            write!(output, "{PROMPT}")?;
            output.flush()?;
        }
        Ok(())
    }

    /// Handle one command. Returns `false` on `exit`.
    pub fn handle<W: Write>(&mut self, line: &str, out: &mut W) -> std::io::Result<bool> {
        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let args: Vec<&str> = rest.split_whitespace().collect();

        match (command, args.as_slice()) {
            ("", _) => {}
            ("exit" | "quit", _) => {
                writeln!(out, "bye")?;
                return Ok(false);
            }
            ("help", _) => writeln!(out, "{HELP}")?,
            ("login", [user, password]) => match self.liath.authenticate(user, password) {
                Ok(true) => {
                    self.user = Some((*user).to_string());
                    writeln!(out, "logged in as {user}")?;
                }
                Ok(false) => writeln!(out, "error: {}", Error::InvalidCredentials)?,
                Err(e) => writeln!(out, "error: {e}")?,
            },
            ("create_user", [user, password]) => match self.liath.create_user(user, password) {
                Ok(()) => writeln!(out, "created user {user}")?,
                Err(e) => writeln!(out, "error: {e}")?,
            },
            ("use", [namespace]) => {
                if self.liath.namespaces().contains(namespace) {
                    self.namespace = (*namespace).to_string();
                    writeln!(out, "using namespace {namespace}")?;
                } else {
                    writeln!(out, "error: {}", Error::NamespaceNotFound((*namespace).to_string()))?;
                }
            }
            ("create_namespace", [namespace]) => match self.liath.create_namespace(namespace, &[]) {
                Ok(_) => writeln!(out, "created namespace {namespace}")?,
                Err(e) => writeln!(out, "error: {e}")?,
            },
            ("list_namespaces", []) => {
                writeln!(out, "{}", self.liath.list_namespaces().join(", "))?;
            }
            ("format", [format]) => match format.parse::<OutputFormat>() {
                Ok(format) => {
                    self.format = format;
                    writeln!(out, "format {format}")?;
                }
                Err(e) => writeln!(out, "error: {e}")?,
            },
            ("query", _) if !rest.is_empty() => {
                if self.user.is_none() {
                    writeln!(out, "error: login first")?;
                } else {
                    match self.liath.execute_with(&self.namespace, rest, self.format) {
                        Ok(output) => match output.to_text() {
                            Ok(text) => writeln!(out, "{}", text.trim_end())?,
                            Err(e) => writeln!(out, "error: {e}")?,
                        },
                        Err(e) => writeln!(out, "error: {e}")?,
                    }
                }
            }
            ("install_package", [package]) => {
                if self.user.is_none() {
                    writeln!(out, "error: login first")?;
                } else {
                    match self.liath.install_package(&self.namespace, package) {
                        Ok(true) => writeln!(out, "installed {package} in {}", self.namespace)?,
                        Ok(false) => writeln!(out, "{package} already installed in {}", self.namespace)?,
                        Err(e) => writeln!(out, "error: {e}")?,
                    }
                }
            }
            _ => writeln!(out, "unknown or malformed command, type `help`")?,
        }
        Ok(true)
    }
}
