//! Consensus-apply contract
//!
//! A handler never touches the log itself. It hands the applier an optional
//! mutate step and a respond step: the mutate step runs once the command is
//! committed, in log order, and its result feeds the respond step that builds
//! the client reply. Pure reads pass no mutate step.

use std::sync::Mutex;

use crate::command::{Command, CommandError, Reply};

/// Value a mutate step hands to its respond step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Unit,
    Count(i64),
}

pub type Mutate<'a> = Box<dyn FnOnce() -> Result<Applied, CommandError> + 'a>;
pub type Respond<'a> = Box<dyn FnOnce(Applied) -> Result<Reply, CommandError> + 'a>;

pub trait Applier: Send + Sync {
    fn apply(
        &self,
        cmd: &Command,
        mutate: Option<Mutate<'_>>,
        respond: Respond<'_>,
    ) -> Result<Reply, CommandError>;
}

/// Single-node applier: every mutate step is sequenced through one mutex and
/// gets the next log index, so committed commands apply strictly one at a time.
#[derive(Debug, Default)]
pub struct LocalApplier {
    sequencer: Mutex<u64>,
}

impl LocalApplier {
    pub fn new() -> Self {
        LocalApplier {
            sequencer: Mutex::new(0),
        }
    }

    /// Index of the last applied entry, 0 when nothing has been applied.
    pub fn applied_index(&self) -> u64 {
        match self.sequencer.lock() {
            Ok(index) => *index,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Applier for LocalApplier {
    fn apply(
        &self,
        cmd: &Command,
        mutate: Option<Mutate<'_>>,
        respond: Respond<'_>,
    ) -> Result<Reply, CommandError> {
        let applied = match mutate {
            Some(mutate) => {
                let mut index = self
                    .sequencer
                    .lock()
                    .map_err(|_| CommandError::Fatal("apply sequencer poisoned".to_string()))?;
                *index += 1;
                log::trace!("apply #{}: {}", *index, cmd);
                mutate()?
            }
            None => Applied::Unit,
        };
        respond(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_do_not_advance_index() {
        let applier = LocalApplier::new();
        let cmd = Command::from(&["GET", "k"][..]);

        let reply = applier
            .apply(&cmd, None, Box::new(|applied: Applied| {
                assert_eq!(applied, Applied::Unit);
                Ok(Reply::Null)
            }))
            .unwrap();

        assert_eq!(reply, Reply::Null);
        assert_eq!(applier.applied_index(), 0);
    }

    #[test]
    fn test_mutate_result_feeds_respond() {
        let applier = LocalApplier::new();
        let cmd = Command::from(&["DEL", "a", "b"][..]);

        let reply = applier
            .apply(
                &cmd,
                Some(Box::new(|| Ok(Applied::Count(2)))),
                Box::new(|applied: Applied| match applied {
                    Applied::Count(n) => Ok(Reply::Integer(n)),
                    Applied::Unit => Ok(Reply::Integer(0)),
                }),
            )
            .unwrap();

        assert_eq!(reply, Reply::Integer(2));
        assert_eq!(applier.applied_index(), 1);
    }

    #[test]
    fn test_failed_mutate_skips_respond() {
        let applier = LocalApplier::new();
        let cmd = Command::from(&["SET", "k", "v"][..]);

        let result = applier.apply(
            &cmd,
            Some(Box::new(|| Err(CommandError::Fatal("boom".to_string())))),
            Box::new(|_: Applied| panic!("respond must not run")),
        );

        assert!(matches!(result, Err(CommandError::Fatal(_))));
        assert_eq!(applier.applied_index(), 1);
    }
}
