//! Live connections ordered by token, doubling as the idle-timeout set.

use super::connection::Connection;
use crate::index::{IndexPolicy, OrderedIndex};
use crate::util::{lock, now_millis};
use mio::Token;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Orders connections by token; removal closes the connection.
pub struct ByToken;

impl IndexPolicy<Arc<Connection>> for ByToken {
    type Key = Token;

    fn key<'a>(&self, item: &'a Arc<Connection>) -> &'a Token {
        item.token_ref()
    }

    fn compare(&self, a: &Token, b: &Token) -> Ordering {
        a.cmp(b)
    }

    fn destroy(&self, item: Arc<Connection>) {
        item.close();
    }

    fn describe(&self, item: &Arc<Connection>) -> String {
        format!("token {} peer {}", item.token().0, item.peer())
    }
}

pub struct Timers {
    index: Mutex<OrderedIndex<Arc<Connection>, ByToken>>,
    keepalive_ms: u64,
}

impl Timers {
    pub fn new(max_connections: usize, keepalive_ms: u64) -> Self {
        Self {
            index: Mutex::new(OrderedIndex::with_limit(ByToken, max_connections)),
            keepalive_ms,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.index).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Track a new connection. Hands it back when the limit is reached.
    pub fn insert(&self, conn: Arc<Connection>) -> Result<(), Arc<Connection>> {
        lock(&self.index).try_insert(conn)
    }

    pub fn get(&self, token: Token) -> Option<Arc<Connection>> {
        lock(&self.index).search(&token).cloned()
    }

    /// Stop tracking and close the connection.
    pub fn close(&self, token: Token) -> bool {
        lock(&self.index).remove(&token)
    }

    /// Close connections idle for at least the keep-alive period. Connections
    /// currently being served are skipped.
    pub fn sweep(&self) -> usize {
        self.sweep_at(now_millis())
    }

    pub fn sweep_at(&self, now: u64) -> usize {
        let keepalive = self.keepalive_ms;
        let expired = |conn: &Connection| !conn.is_in_flight() && conn.idle_for(now) >= keepalive;

        let candidates: Vec<Token> = lock(&self.index)
            .iter()
            .filter(|conn| expired(conn))
            .map(|conn| conn.token())
            .collect();

        let mut closed = 0;
        for token in candidates {
            let mut index = lock(&self.index);
            if index.search(&token).is_some_and(|conn| expired(conn)) && index.remove(&token) {
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(closed, remaining = self.len(), "Idle connections swept");
        }
        closed
    }

    /// Close every tracked connection.
    pub fn clear(&self) {
        lock(&self.index).clear();
    }
}
