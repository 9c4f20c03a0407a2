//! In-memory account registry for sensor endpoints.

use std::collections::HashMap;
use std::net::IpAddr;

use arbor_core::EndpointId;
use arbor_net::{Account, AccountError, AccountResolver};
use parking_lot::Mutex;
use tracing::info;

/// Hands out one account per address. A reconnecting endpoint gets its old account back.
pub struct AccountRegistry {
    inner: Mutex<Registry>,
}

struct Registry {
    by_address: HashMap<IpAddr, Account>,
    next_id: EndpointId,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry {
                by_address: HashMap::new(),
                // 0 is reserved on the wire.
                next_id: 1,
            }),
        }
    }
}

impl Default for AccountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountResolver for AccountRegistry {
    fn on_peer_connection(&self, address: IpAddr) -> Result<Account, AccountError> {
        let mut registry = self.inner.lock();
        if let Some(account) = registry.by_address.get(&address) {
            return Ok(account.clone());
        }
        let id = registry.next_id;
        registry.next_id = id
            .checked_add(1)
            .ok_or_else(|| AccountError::new("endpoint ids exhausted"))?;
        let account = Account::new(id, format!("endpoint-{}", id));
        info!("new account {} for {}", account.name, address);
        registry.by_address.insert(address, account.clone());
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_are_stable_per_address() {
        let registry = AccountRegistry::new();
        let a: IpAddr = "10.0.0.5".parse().unwrap();
        let b: IpAddr = "10.0.0.6".parse().unwrap();

        let first = registry.on_peer_connection(a).unwrap();
        let second = registry.on_peer_connection(b).unwrap();
        assert_eq!(first, Account::new(1, "endpoint-1"));
        assert_eq!(second.id, 2);
        assert_eq!(registry.on_peer_connection(a).unwrap(), first);
        assert_eq!(registry.on_peer_connection(b).unwrap(), second);
    }
}
