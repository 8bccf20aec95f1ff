use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::CacheError;

/// Fixed set of connection slots. A slot holds `None` until its first use
/// and again after its connection was discarded, so a broken connection is
/// replaced lazily by the next caller.
pub struct ConnectionPool {
    config: ClientConfig,
    sender: Sender<Option<Connection>>,
    receiver: Receiver<Option<Connection>>,
}

impl ConnectionPool {
    pub fn new(config: ClientConfig) -> Self {
        let size = config.pool_size.max(1);
        let (sender, receiver) = crossbeam::channel::bounded(size);
        for _ in 0..size {
            let _ = sender.try_send(None);
        }
        Self {
            config,
            sender,
            receiver,
        }
    }

    /// Take a slot, waiting at most the operation timeout for one to free up.
    pub fn get(&self) -> Result<PooledConnection<'_>, CacheError> {
        let conn = self
            .receiver
            .recv_timeout(self.config.op_timeout())
            .map_err(|e| match e {
                RecvTimeoutError::Timeout => CacheError::Timeout,
                RecvTimeoutError::Disconnected => CacheError::Protocol("pool closed".to_string()),
            })?;
        Ok(PooledConnection { conn, pool: self })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Slots not currently checked out.
    pub fn idle(&self) -> usize {
        self.receiver.len()
    }
}

/// A checked-out slot. Returned to the pool on drop, minus any connection
/// an operation left in an unknown state.
pub struct PooledConnection<'a> {
    conn: Option<Connection>,
    pool: &'a ConnectionPool,
}

impl PooledConnection<'_> {
    /// Run one command, connecting first if the slot is empty.
    pub fn run<T>(
        &mut self,
        op: impl FnOnce(&mut Connection) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                tracing::debug!(addr = %self.pool.config.addr, "opening cache connection");
                Connection::connect(&self.pool.config)?
            }
        };
        let result = op(self.conn.insert(conn));
        if let Err(e) = &result {
            if e.poisons_connection() {
                tracing::warn!(error = %e, "discarding cache connection");
                self.conn = None;
            }
        }
        result
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        let _ = self.pool.sender.try_send(self.conn.take());
    }
}
