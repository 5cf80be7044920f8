//! Concrete workloads driven by the coordinator
//!
//! - `change_stream_state`: per-tenant enable/disable of change streams
//! - `migration`: recipient side of a shard merge or tenant migration

pub mod change_stream_state;
pub mod migration;

pub use change_stream_state::{
    ChangeCollections, ChangeStreamPhase, ChangeStreamStateRequest, ChangeStreamStateWorkload,
    InMemoryChangeCollections,
};
pub use migration::{
    InMemoryDonor, MigrationDonor, MigrationPhase, MigrationProtocol,
    MigrationRecipientWorkload, RecipientSyncRequest,
};

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Logical cluster time `(seconds, increment)`; zero seconds is the null value
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub secs: u32,
    pub inc: u32,
}

impl Timestamp {
    pub fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    pub fn is_null(&self) -> bool {
        self.secs == 0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// Position in a replica set's oplog
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpTime {
    pub ts: Timestamp,
    pub t: i64,
}

impl OpTime {
    pub fn new(ts: Timestamp, t: i64) -> Self {
        Self { ts, t }
    }
}

/// `setName/host1,host2,...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub set_name: String,
    pub hosts: Vec<String>,
}

impl ConnectionString {
    /// Parse a replica set connection string; a bare host list is a
    /// standalone and is rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let Some((set_name, hosts)) = s.split_once('/') else {
            return Err(Error::BadValue(format!(
                "'{}' does not name a replica set",
                s
            )));
        };
        let set_name = set_name.trim();
        if set_name.is_empty() {
            return Err(Error::BadValue(format!("'{}' has an empty set name", s)));
        }
        let hosts: Vec<String> = hosts
            .split(',')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if hosts.is_empty() {
            return Err(Error::BadValue(format!("'{}' lists no hosts", s)));
        }
        Ok(Self {
            set_name: set_name.to_string(),
            hosts,
        })
    }

    /// Whether both strings point at the same set or share any member.
    pub fn overlaps(&self, other: &ConnectionString) -> bool {
        self.set_name == other.set_name || self.hosts.iter().any(|h| other.hosts.contains(h))
    }
}

impl std::fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.set_name, self.hosts.join(","))
    }
}

/// Tenant ids are object ids: 24 hex characters.
pub fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    if tenant_id.len() != 24 || !tenant_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::BadValue(format!(
            "tenant id '{}' is not a valid object id",
            tenant_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_parsing() {
        let cs = ConnectionString::parse("donor/Host1:27017, host2:27017").unwrap();
        assert_eq!(cs.set_name, "donor");
        assert_eq!(cs.hosts, vec!["host1:27017", "host2:27017"]);
        assert_eq!(cs.to_string(), "donor/host1:27017,host2:27017");

        assert!(ConnectionString::parse("localhost:27017").is_err());
        assert!(ConnectionString::parse("/host1:27017").is_err());
        assert!(ConnectionString::parse("donor/").is_err());
    }

    #[test]
    fn test_connection_string_overlap() {
        let recipient = ConnectionString::parse("recipient/r1:1,r2:2").unwrap();
        let donor = ConnectionString::parse("donor/d1:1").unwrap();
        let sneaky = ConnectionString::parse("donor/d1:1,r2:2").unwrap();
        assert!(!recipient.overlaps(&donor));
        assert!(recipient.overlaps(&sneaky));
        assert!(recipient.overlaps(&recipient));
    }

    #[test]
    fn test_tenant_id_validation() {
        assert!(validate_tenant_id("636d957b2646ddfaf9b5e13f").is_ok());
        assert!(validate_tenant_id("").is_err());
        assert!(validate_tenant_id("not-an-object-id").is_err());
        assert!(validate_tenant_id("636d957b2646ddfaf9b5e13g").is_err());
    }
}
