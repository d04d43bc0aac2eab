//! Command model shared by the dispatcher, the handlers and the protocol layer.
//!
//! - `Command`: an already-tokenized request, `args[0]` being the command name
//! - `Reply`: the typed reply primitives written back to the client
//! - `Response`: a reply, or the request to terminate the hosting process
//! - `CommandError`: everything a command can fail with

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::store::StoreError;

pub mod glob;
mod handlers;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(args: Vec<Bytes>) -> Self {
        Command { args }
    }

    /// Lowercased command name, used for table lookup.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|name| String::from_utf8_lossy(name).to_lowercase())
            .unwrap_or_default()
    }

    pub fn arg(&self, index: usize) -> &[u8] {
        &self.args[index]
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Number of arguments, the command name included.
    pub fn len(&self) -> usize {
        self.args.len()
    }

}

impl<T: AsRef<[u8]>> From<&[T]> for Command {
    fn from(args: &[T]) -> Self {
        Command::new(
            args.iter()
                .map(|arg| Bytes::copy_from_slice(arg.as_ref()))
                .collect(),
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Simple string `OK`.
    Ok,
    Bulk(Vec<u8>),
    Integer(i64),
    Array(Vec<Vec<u8>>),
    Null,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Reply(Reply),
    /// The client asked the node to stop. The host acknowledges, closes the
    /// connection and terminates.
    Shutdown,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("wrong number of arguments for '{0}' command")]
    WrongNumberOfArguments(String),
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The node can no longer vouch for its state and must stop.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CommandError {
    pub fn wrong_args(cmd: &Command) -> Self {
        CommandError::WrongNumberOfArguments(cmd.name())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CommandError::Fatal(_))
    }
}
