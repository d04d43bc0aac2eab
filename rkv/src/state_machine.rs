//! Replicated state machine
//!
//! Owns the local store and the reader-writer lock guarding it, and dispatches
//! commands delivered by the consensus layer to their handlers. Every node that
//! applies the same log through a `StateMachine` ends up with the same key space.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::applier::Applier;
use crate::command::{Command, CommandError, Reply, Response};
use crate::store::{FileStore, LocalStore, StoreError};

pub(crate) type Handler<S> =
    fn(&StateMachine<S>, &dyn Applier, &Command) -> Result<Reply, CommandError>;

/// State machine over a local store.
///
/// The store slot is `None` once the machine has been closed; every later
/// operation fails with `StoreError::Closed`.
pub struct StateMachine<S: LocalStore = FileStore> {
    pub(crate) dir: PathBuf,
    pub(crate) store: RwLock<Option<S>>,
    handlers: HashMap<&'static str, Handler<S>>,
}

impl<S: LocalStore> StateMachine<S> {
    /// Opens (creating if needed) the store at `dir`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let store = S::open(dir.as_ref())?;
        let dir = dir.as_ref().canonicalize()?;

        let mut handlers: HashMap<&'static str, Handler<S>> = HashMap::new();
        handlers.insert("echo", Self::cmd_echo);
        handlers.insert("set", Self::cmd_set);
        handlers.insert("get", Self::cmd_get);
        handlers.insert("del", Self::cmd_del);
        handlers.insert("keys", Self::cmd_keys);
        handlers.insert("flushdb", Self::cmd_flushdb);

        log::info!("state machine opened at {}", dir.display());
        Ok(StateMachine {
            dir,
            store: RwLock::new(Some(store)),
            handlers,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Entry point for every command, whether it comes from the committed log or
    /// from a local read. `peer` is the client that sent it, when there is one.
    pub fn command(
        &self,
        peer: Option<SocketAddr>,
        applier: &dyn Applier,
        cmd: &Command,
    ) -> Result<Response, CommandError> {
        match peer {
            Some(peer) => log::trace!("[{}] command: {}", peer, cmd),
            None => log::trace!("command: {}", cmd),
        }

        let name = cmd.name();
        if let Some(handler) = self.handlers.get(name.as_str()) {
            return handler(self, applier, cmd).map(Response::Reply);
        }
        if name == "shutdown" {
            log::warn!("shutting down on client request");
            return Ok(Response::Shutdown);
        }
        Err(CommandError::UnknownCommand(name))
    }

    /// Closes the underlying store. A second call fails with `StoreError::Closed`.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut slot = self.store.write().map_err(|_| StoreError::Poisoned)?;
        let store = slot.take().ok_or(StoreError::Closed)?;
        store.close()?;
        log::info!("state machine at {} closed", self.dir.display());
        Ok(())
    }

    /// Runs `f` under the shared lock.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&S) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let slot = self.store.read().map_err(|_| StoreError::Poisoned)?;
        let store = slot.as_ref().ok_or(StoreError::Closed)?;
        f(store)
    }

    /// Runs `f` under the exclusive lock.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&mut S) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut slot = self.store.write().map_err(|_| StoreError::Poisoned)?;
        let store = slot.as_mut().ok_or(StoreError::Closed)?;
        f(store)
    }
}
