//! SET, GET, DEL, KEYS, FLUSHDB and ECHO.
//!
//! Every handler checks its argument count before anything else, so malformed
//! commands never take a lock and never reach the log.

use super::glob::Glob;
use super::{Command, CommandError, Reply};
use crate::applier::{Applied, Applier};
use crate::state_machine::StateMachine;
use crate::store::{LocalStore, StoreError};

impl<S: LocalStore> StateMachine<S> {
    pub(crate) fn cmd_set(&self, applier: &dyn Applier, cmd: &Command) -> Result<Reply, CommandError> {
        if cmd.len() != 3 {
            return Err(CommandError::wrong_args(cmd));
        }
        let (key, value) = (cmd.arg(1), cmd.arg(2));
        applier.apply(
            cmd,
            Some(Box::new(move || {
                self.write(|store| store.put(key, value))?;
                Ok(Applied::Unit)
            })),
            Box::new(|_: Applied| Ok(Reply::Ok)),
        )
    }

    pub(crate) fn cmd_echo(&self, _applier: &dyn Applier, cmd: &Command) -> Result<Reply, CommandError> {
        if cmd.len() != 2 {
            return Err(CommandError::wrong_args(cmd));
        }
        Ok(Reply::Bulk(cmd.arg(1).to_vec()))
    }

    pub(crate) fn cmd_get(&self, applier: &dyn Applier, cmd: &Command) -> Result<Reply, CommandError> {
        if cmd.len() != 2 {
            return Err(CommandError::wrong_args(cmd));
        }
        let key = cmd.arg(1);
        applier.apply(
            cmd,
            None,
            Box::new(move |_: Applied| match self.read(|store| store.get(key)) {
                Ok(value) => Ok(Reply::Bulk(value)),
                Err(StoreError::KeyNotFound) => Ok(Reply::Null),
                Err(e) => Err(e.into()),
            }),
        )
    }

    pub(crate) fn cmd_del(&self, applier: &dyn Applier, cmd: &Command) -> Result<Reply, CommandError> {
        if cmd.len() < 2 {
            return Err(CommandError::wrong_args(cmd));
        }
        let keys = &cmd.args()[1..];
        applier.apply(
            cmd,
            Some(Box::new(move || {
                let deleted = self.write(|store| {
                    let mut n = 0;
                    for key in keys {
                        store.delete(key)?;
                        n += 1;
                    }
                    Ok(n)
                })?;
                Ok(Applied::Count(deleted))
            })),
            Box::new(|applied: Applied| match applied {
                Applied::Count(n) => Ok(Reply::Integer(n)),
                Applied::Unit => Ok(Reply::Integer(0)),
            }),
        )
    }

    pub(crate) fn cmd_keys(&self, applier: &dyn Applier, cmd: &Command) -> Result<Reply, CommandError> {
        if cmd.len() != 2 {
            return Err(CommandError::wrong_args(cmd));
        }
        let pattern = cmd.arg(1);
        let glob = match pattern {
            b"*" => None,
            _ => Some(
                Glob::compile(pattern).map_err(|e| CommandError::InvalidPattern(e.to_string()))?,
            ),
        };

        applier.apply(
            cmd,
            None,
            Box::new(move |_: Applied| {
                let keys = self.read(|store| {
                    let mut keys = Vec::new();
                    for item in store.items() {
                        let (key, _) = item?;
                        match &glob {
                            None => keys.push(key),
                            Some(glob) => {
                                let matched = glob.is_match(&key);
                                log::trace!(
                                    "keys: pattern {:?} key {:?} matched {}",
                                    String::from_utf8_lossy(pattern),
                                    String::from_utf8_lossy(&key),
                                    matched
                                );
                                if matched {
                                    keys.push(key);
                                }
                            }
                        }
                    }
                    Ok(keys)
                })?;
                Ok(Reply::Array(keys))
            }),
        )
    }

    pub(crate) fn cmd_flushdb(&self, applier: &dyn Applier, cmd: &Command) -> Result<Reply, CommandError> {
        if cmd.len() != 1 {
            return Err(CommandError::wrong_args(cmd));
        }
        applier.apply(
            cmd,
            Some(Box::new(move || {
                self.write(|store| store.sync()).map_err(|e| match e {
                    StoreError::Closed | StoreError::Poisoned => CommandError::Store(e),
                    e => CommandError::Fatal(format!("durability flush failed: {}", e)),
                })?;
                Ok(Applied::Unit)
            })),
            Box::new(|_: Applied| Ok(Reply::Ok)),
        )
    }
}
