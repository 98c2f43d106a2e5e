use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::{Duration, Instant};

struct Record {
    endpoint: SocketAddrV4,
    is_connector: bool,
    is_listener: bool,
    // millis since Registry::epoch, bumped under the read lock on keep-alive
    last_register: AtomicU64,
}

/// Snapshot of a registered peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Registration {
    /// public endpoint as observed by the server
    pub endpoint: SocketAddrV4,
    pub is_connector: bool,
    pub is_listener: bool,
    pub last_register: Instant,
}

/// Listener registrations keyed by public address.
///
/// One record per address: a second peer behind the same public IP replaces
/// the first. Records older than `expiry` are removed by [`Registry::sweep_expired`],
/// until then lookups still see them.
pub struct Registry {
    records: RwLock<HashMap<Ipv4Addr, Record>>,
    epoch: Instant,
    expiry: Duration,
}

impl Registry {
    pub fn new(expiry: Duration) -> Self {
        Self {
            records: Default::default(),
            epoch: Instant::now(),
            expiry,
        }
    }

    fn millis(&self, t: Instant) -> u64 {
        t.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Create or refresh the record for `endpoint.ip()`.
    ///
    /// A keep-alive from an unchanged endpoint only takes the shared lock.
    pub fn upsert_listener(
        &self,
        endpoint: SocketAddrV4,
        is_connector: bool,
        is_listener: bool,
        now: Instant,
    ) {
        let at = self.millis(now);
        let records = self.records.upgradable_read();

        if let Some(r) = records.get(endpoint.ip()) {
            if r.endpoint == endpoint && r.is_connector == is_connector && r.is_listener == is_listener
            {
                r.last_register.fetch_max(at, Relaxed);
                log::trace!("refresh {}", endpoint);
                return;
            }
        }

        let mut records = RwLockUpgradableReadGuard::upgrade(records);
        let old = records.insert(
            *endpoint.ip(),
            Record {
                endpoint,
                is_connector,
                is_listener,
                last_register: AtomicU64::new(at),
            },
        );

        match old {
            Some(old) if old.endpoint != endpoint => {
                log::debug!("listener {} replaced by {}", old.endpoint, endpoint)
            }
            Some(_) => log::debug!("listener {} flags changed", endpoint),
            None => log::info!("new listener {}", endpoint),
        }
    }

    pub fn lookup_listener(&self, addr: Ipv4Addr) -> Option<Registration> {
        self.records.read().get(&addr).map(|r| Registration {
            endpoint: r.endpoint,
            is_connector: r.is_connector,
            is_listener: r.is_listener,
            last_register: self.epoch + Duration::from_millis(r.last_register.load(Relaxed)),
        })
    }

    /// Remove records not refreshed within the expiry window, returning how many.
    ///
    /// Scans under the upgradable lock so lookups continue, the exclusive lock
    /// is only held for the removal.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let now = self.millis(now);
        let expiry = self.expiry.as_millis() as u64;
        let expired = |r: &Record| now.saturating_sub(r.last_register.load(Relaxed)) > expiry;

        let records = self.records.upgradable_read();
        let stale: Vec<Ipv4Addr> = records
            .iter()
            .filter(|&(_, r)| expired(r))
            .map(|(addr, _)| *addr)
            .collect();

        if stale.is_empty() {
            return 0;
        }

        let mut records = RwLockUpgradableReadGuard::upgrade(records);
        let mut removed = 0;
        for addr in stale {
            // a keep-alive may have landed between scan and upgrade
            if records.get(&addr).map_or(false, |r| expired(r)) {
                if let Some(r) = records.remove(&addr) {
                    log::debug!("expired {}", r.endpoint);
                    removed += 1;
                }
            }
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
