//! Pending-request table: correlates outbound request ids with the callers
//! waiting on them.
//!
//! Every entry is resolved exactly once: by a matching response, by
//! [`PendingRequests::remove`] (timeout or send failure), or by
//! [`PendingRequests::reject_all`] (shutdown, closed stream). Removal happens
//! under one mutex, so two resolution paths can never both fire.

use crate::protocol::JsonRpcResponse;
use parking_lot::Mutex;
use std::collections::HashMap;
use toolgate_core::{ToolgateError, ToolgateResult};
use tokio::sync::oneshot;
use tracing::debug;

/// What a waiting caller eventually receives.
pub type Completion = ToolgateResult<JsonRpcResponse>;

struct Table {
    waiters: HashMap<u64, oneshot::Sender<Completion>>,
    open: bool,
}

/// Shared between a connection and its transport.
pub struct PendingRequests {
    server: String,
    table: Mutex<Table>,
}

impl PendingRequests {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            table: Mutex::new(Table {
                waiters: HashMap::new(),
                open: true,
            }),
        }
    }

    /// Register `id` and return the receiving half. Fails once the table has
    /// been closed by [`reject_all`](Self::reject_all).
    pub fn register(&self, id: u64) -> ToolgateResult<oneshot::Receiver<Completion>> {
        let mut table = self.table.lock();
        if !table.open {
            return Err(ToolgateError::ShuttingDown {
                server: self.server.clone(),
            });
        }
        let (tx, rx) = oneshot::channel();
        table.waiters.insert(id, tx);
        Ok(rx)
    }

    /// Hand a response to whoever is waiting on its id.
    ///
    /// Returns `false` when nobody is: the request already timed out or was
    /// never sent. Such data is dropped.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id else {
            return false;
        };
        let waiter = self.table.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                // The caller may have given up between removal and send.
                let _ = tx.send(Ok(response));
                true
            }
            None => {
                debug!(server = %self.server, id, "Dropping response for unknown or expired request");
                false
            }
        }
    }

    /// Forget `id` without resolving it.
    pub fn remove(&self, id: u64) -> bool {
        self.table.lock().waiters.remove(&id).is_some()
    }

    /// Fail every waiter with an error built by `make_err` and refuse new
    /// registrations. Returns the number of rejected requests.
    pub fn reject_all(&self, make_err: impl Fn() -> ToolgateError) -> usize {
        let drained: Vec<_> = {
            let mut table = self.table.lock();
            table.open = false;
            table.waiters.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_err()));
        }
        count
    }

    /// Fail every current waiter but keep accepting new registrations.
    pub fn fail_all(&self, make_err: impl Fn() -> ToolgateError) -> usize {
        let drained: Vec<_> = self.table.lock().waiters.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_err()));
        }
        count
    }

    /// Accept registrations again after a [`reject_all`](Self::reject_all).
    pub fn reopen(&self) {
        self.table.lock().open = true;
    }

    pub fn len(&self) -> usize {
        self.table.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
