use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};
use crate::lease::{LEASE_SLOTS, MAX_LEASE_MILLIS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub dns_server: Ipv4Addr,
    pub lease_duration_seconds: u32,
    /// Host number handed to lease slot 0; slot `n` gets `lease_base + n`.
    pub lease_base: u8,
    pub dhcp_server_port: u16,
    pub dhcp_client_port: u16,
    pub session_port: u16,
    /// Address the joining device connects to.
    pub peer_address: Ipv4Addr,
    pub tick_millis: u64,
    pub poll_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 4, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            dns_server: Ipv4Addr::new(8, 8, 8, 8),
            lease_duration_seconds: 24 * 60 * 60,
            lease_base: 16,
            dhcp_server_port: 67,
            dhcp_client_port: 68,
            session_port: 80,
            peer_address: Ipv4Addr::new(192, 168, 4, 1),
            tick_millis: 150,
            poll_millis: 100,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if u64::from(self.lease_duration_seconds) * 1000 > u64::from(MAX_LEASE_MILLIS) {
            return Err(Error::InvalidConfig(format!(
                "lease_duration_seconds must be at most {}",
                MAX_LEASE_MILLIS / 1000
            )));
        }

        if self.lease_base == 0 {
            return Err(Error::InvalidConfig(
                "lease_base must not be the network address".to_string(),
            ));
        }

        let mask = u32::from(self.subnet_mask);
        let host_mask = !mask;
        let last_host = u32::from(self.lease_base) + LEASE_SLOTS as u32 - 1;
        if last_host >= host_mask {
            return Err(Error::InvalidConfig(format!(
                "lease pool {}..={} does not fit in subnet {}",
                self.lease_base, last_host, self.subnet_mask
            )));
        }

        let server_host = u32::from(self.server_ip) & host_mask;
        if server_host >= u32::from(self.lease_base) && server_host <= last_host {
            return Err(Error::InvalidConfig(
                "server_ip must not be within the lease pool".to_string(),
            ));
        }

        if self.tick_millis == 0 || self.poll_millis == 0 {
            return Err(Error::InvalidConfig(
                "tick_millis and poll_millis must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Address handed out for lease slot `index`.
    pub fn lease_address(&self, index: usize) -> Ipv4Addr {
        let network = u32::from(self.server_ip) & u32::from(self.subnet_mask);
        Ipv4Addr::from(network | (u32::from(self.lease_base) + index as u32))
    }

    pub fn on_subnet(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.subnet_mask);
        u32::from(ip) & mask == u32::from(self.server_ip) & mask
    }

    /// Lease slot for an on-subnet address, if it falls inside the pool.
    pub fn lease_index(&self, ip: Ipv4Addr) -> Option<usize> {
        let host = u32::from(ip) & !u32::from(self.subnet_mask);
        let index = host.checked_sub(u32::from(self.lease_base))? as usize;
        (index < LEASE_SLOTS).then_some(index)
    }

    pub fn lease_duration_millis(&self) -> u32 {
        self.lease_duration_seconds.saturating_mul(1000)
    }
}
