use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::auth::AuthConfig;
use crate::config::ServerConfig;
use crate::hub::{Hub, HubSettings};
use crate::records::PartyRecords;

pub type IpConnectionMap = Arc<Mutex<HashMap<IpAddr, usize>>>;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub auth: AuthConfig,
    pub config: Arc<ServerConfig>,
    pub ws_connection_count: Arc<AtomicUsize>,
    pub ws_per_ip: IpConnectionMap,
}

impl AppState {
    pub fn new(config: ServerConfig, records: Arc<dyn PartyRecords>) -> Self {
        let auth = AuthConfig {
            bearer_token: config.auth.bearer_token.clone(),
        };
        let hub = Hub::new(records, HubSettings::from_config(&config));
        Self {
            hub,
            auth,
            config: Arc::new(config),
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
            ws_per_ip: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Counts one open WebSocket for as long as it lives.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Holds one slot of the per-IP connection allowance.
pub struct IpConnectionGuard {
    ip: IpAddr,
    map: IpConnectionMap,
}

impl IpConnectionGuard {
    /// Take a slot for `ip`, or `None` if it already has `max` connections.
    pub fn try_acquire(ip: IpAddr, map: IpConnectionMap, max: usize) -> Option<Self> {
        {
            let mut counts = map.lock().ok()?;
            let count = counts.entry(ip).or_insert(0);
            if *count >= max {
                return None;
            }
            *count += 1;
        }
        Some(Self { ip, map })
    }
}

impl Drop for IpConnectionGuard {
    fn drop(&mut self) {
        let Ok(mut counts) = self.map.lock() else {
            return;
        };
        if let Some(count) = counts.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.ip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_guard_counts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = ConnectionGuard::new(Arc::clone(&counter));
        let b = ConnectionGuard::new(Arc::clone(&counter));
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        drop(a);
        drop(b);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn ip_guard_enforces_limit_and_releases() {
        let map: IpConnectionMap = Arc::new(Mutex::new(HashMap::new()));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();

        let first = IpConnectionGuard::try_acquire(ip, Arc::clone(&map), 2).unwrap();
        let _second = IpConnectionGuard::try_acquire(ip, Arc::clone(&map), 2).unwrap();
        assert!(IpConnectionGuard::try_acquire(ip, Arc::clone(&map), 2).is_none());
        assert!(IpConnectionGuard::try_acquire(other, Arc::clone(&map), 2).is_some());

        drop(first);
        assert!(IpConnectionGuard::try_acquire(ip, Arc::clone(&map), 2).is_some());
    }

    #[test]
    fn ip_map_entry_removed_when_last_guard_drops() {
        let map: IpConnectionMap = Arc::new(Mutex::new(HashMap::new()));
        let ip: IpAddr = "10.0.0.3".parse().unwrap();
        let guard = IpConnectionGuard::try_acquire(ip, Arc::clone(&map), 1).unwrap();
        drop(guard);
        assert!(map.lock().unwrap().is_empty());
    }
}
