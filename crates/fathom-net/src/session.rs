//! RPC session bookkeeping at the server.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::Instant;

/// One connected client.
#[derive(Debug)]
pub struct SessionInfo {
    pub addr: SocketAddr,
    /// Refreshed by every procedure call; the reaper drops sessions that
    /// stay quiet past the idle timeout.
    pub last_seen: Instant,
}

/// Session token → session. Shared by the dispatch and reaper tasks.
pub type SessionTable = Arc<DashMap<u32, SessionInfo>>;

pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}

/// Allocate an unused, nonzero session token.
pub fn allocate_token(sessions: &SessionTable) -> u32 {
    loop {
        let token: u32 = rand::random();
        if token != 0 && !sessions.contains_key(&token) {
            return token;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_nonzero_and_unique() {
        let table = new_session_table();
        for _ in 0..64 {
            let token = allocate_token(&table);
            assert_ne!(token, 0);
            assert!(!table.contains_key(&token));
            table.insert(
                token,
                SessionInfo { addr: "127.0.0.1:1".parse().unwrap(), last_seen: Instant::now() },
            );
        }
        assert_eq!(table.len(), 64);
    }
}
