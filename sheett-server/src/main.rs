//! Sheett sync server.
//!
//! Hosts one room per spreadsheet and persists canonical state to RocksDB.
//!
//! Environment:
//! - `SHEETT_BIND_ADDR` — listen address (default `127.0.0.1:9090`)
//! - `SHEETT_DATA_DIR` — RocksDB directory; in-memory only when unset
//! - `SHEETT_LOCK_TIMEOUT_SECS` — advisory lock inactivity timeout
//! - `SHEETT_MAX_PEERS_PER_ROOM` — connection limit per spreadsheet
//! - `SHEETT_ROOM_IDLE_SECS` — how long a room without peers stays loaded
//! - `RUST_LOG` — log filter (default `info`)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use sheett_collab::server::{ServerConfig, SyncServer};

/// Build the server configuration from `lookup`, falling back to defaults.
fn config_from(lookup: impl Fn(&str) -> Option<String>) -> ServerConfig {
    let defaults = ServerConfig::default();

    let bind_addr = lookup("SHEETT_BIND_ADDR").unwrap_or(defaults.bind_addr);
    let storage_path = lookup("SHEETT_DATA_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from);
    let lock_timeout = lookup("SHEETT_LOCK_TIMEOUT_SECS")
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(defaults.lock_timeout);
    let max_peers_per_room = lookup("SHEETT_MAX_PEERS_PER_ROOM")
        .and_then(|s| s.parse().ok())
        .unwrap_or(defaults.max_peers_per_room);
    let room_idle_timeout = lookup("SHEETT_ROOM_IDLE_SECS")
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(defaults.room_idle_timeout);

    ServerConfig {
        bind_addr,
        storage_path,
        lock_timeout,
        max_peers_per_room,
        room_idle_timeout,
        ..defaults
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from(|key| std::env::var(key).ok());
    match &config.storage_path {
        Some(path) => info!("Persisting rooms to {}", path.display()),
        None => info!("No SHEETT_DATA_DIR set, rooms are kept in memory only"),
    }

    let server = match SyncServer::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to open storage: {e}");
            std::process::exit(1);
        }
    };

    let running = tokio::spawn({
        let server = server.clone();
        async move { server.run().await.map_err(|e| e.to_string()) }
    });

    tokio::select! {
        result = running => match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Server failed: {e}");
                std::process::exit(1);
            }
            Err(e) => {
                error!("Server task panicked: {e}");
                std::process::exit(1);
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            server.shutdown();
            // Rooms checkpoint before the accept loop returns.
            server.rooms().shutdown().await;
        }
    }

    let stats = server.stats().await;
    info!(
        "Served {} connections, {} messages, {} snapshots written",
        stats.total_connections, stats.total_messages, stats.persisted_snapshots
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = config_from(lookup(&[]));
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert!(config.storage_path.is_none());
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.room_idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides() {
        let config = config_from(lookup(&[
            ("SHEETT_BIND_ADDR", "0.0.0.0:7000"),
            ("SHEETT_DATA_DIR", "/var/lib/sheett"),
            ("SHEETT_LOCK_TIMEOUT_SECS", "5"),
            ("SHEETT_MAX_PEERS_PER_ROOM", "12"),
            ("SHEETT_ROOM_IDLE_SECS", "120"),
        ]));
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/sheett")));
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.max_peers_per_room, 12);
        assert_eq!(config.room_idle_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = config_from(lookup(&[
            ("SHEETT_LOCK_TIMEOUT_SECS", "soon"),
            ("SHEETT_MAX_PEERS_PER_ROOM", "-3"),
            ("SHEETT_DATA_DIR", ""),
        ]));
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.max_peers_per_room, 100);
        assert!(config.storage_path.is_none());
    }
}
