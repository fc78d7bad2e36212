//! Server capability detection.
//!
//! Transactions need a multi-member deployment running a recent enough
//! server. The decision is made once, when the client connects, from the
//! version and topology the store reports.

use std::cmp::Ordering;

use crate::store::{ServerStatus, TopologyKind};

/// Lowest server version that supports multi-document transactions.
///
/// The check is inclusive: a server reporting exactly `"4.0"` or `"4.0.0"`
/// qualifies. Pass a higher version through
/// [`ConnectOptions::min_transaction_version`](crate::client::ConnectOptions::min_transaction_version)
/// to demand a later release.
pub const MIN_TRANSACTION_VERSION: &str = "4.0";

/// Compare two dotted version strings component by component.
///
/// Only the components both strings have are compared, so `"4.0"` and
/// `"4.0.3"` are equal. A component that is not a number makes its side
/// compare greater; the left side is checked first.
///
/// ```rust
/// use std::cmp::Ordering;
/// use docket_query::compare_server_versions;
///
/// assert_eq!(compare_server_versions("4.2.1", "4.0"), Ordering::Greater);
/// assert_eq!(compare_server_versions("3.6", "4.0.0"), Ordering::Less);
/// assert_eq!(compare_server_versions("4.0", "4.0.3"), Ordering::Equal);
/// ```
pub fn compare_server_versions(v1: &str, v2: &str) -> Ordering {
    for (a, b) in v1.split('.').zip(v2.split('.')) {
        let Ok(a) = a.parse::<i64>() else {
            return Ordering::Greater;
        };
        let Ok(b) = b.parse::<i64>() else {
            return Ordering::Less;
        };
        match a.cmp(&b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// What the client learned about the deployment when it connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Server version string.
    pub version: String,
    /// Deployment kind.
    pub topology: TopologyKind,
    /// Whether sessions and transactions may be used.
    pub transactions_allowed: bool,
}

impl ServerInfo {
    /// Decide transaction support from a status report: the deployment
    /// must not be a single server and its version must be at least
    /// `min_version` (equal versions qualify).
    pub fn detect(status: &ServerStatus, min_version: &str) -> Self {
        let transactions_allowed = status.topology != TopologyKind::Single
            && compare_server_versions(&status.version, min_version) != Ordering::Less;
        Self {
            version: status.version.clone(),
            topology: status.topology,
            transactions_allowed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(version: &str, topology: TopologyKind) -> ServerStatus {
        ServerStatus {
            version: version.to_string(),
            topology,
        }
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_server_versions("4.0.0", "4.0.0"), Ordering::Equal);
        assert_eq!(compare_server_versions("4.10", "4.9"), Ordering::Greater);
        assert_eq!(compare_server_versions("3.6.8", "4.0"), Ordering::Less);
        assert_eq!(compare_server_versions("7.0.2", "4.0"), Ordering::Greater);
    }

    #[test]
    fn test_non_numeric_components() {
        assert_eq!(compare_server_versions("x.0", "4.0"), Ordering::Greater);
        assert_eq!(compare_server_versions("4.0", "x.0"), Ordering::Less);
        assert_eq!(compare_server_versions("x", "y"), Ordering::Greater);
        assert_eq!(compare_server_versions("4.0.0-rc1", "4.0.0"), Ordering::Greater);
    }

    #[test]
    fn test_compare_is_reflexive() {
        for v in ["4.0", "4.2.1", "7.0.12", "3.6.23"] {
            assert_eq!(compare_server_versions(v, v), Ordering::Equal);
        }
    }

    #[test]
    fn test_detect() {
        let info = ServerInfo::detect(&status("4.0.0", TopologyKind::ReplicaSet), MIN_TRANSACTION_VERSION);
        assert!(info.transactions_allowed);

        let info = ServerInfo::detect(&status("4.0", TopologyKind::Sharded), MIN_TRANSACTION_VERSION);
        assert!(info.transactions_allowed);

        let info = ServerInfo::detect(&status("7.0.2", TopologyKind::Single), MIN_TRANSACTION_VERSION);
        assert!(!info.transactions_allowed);

        let info = ServerInfo::detect(&status("3.6.8", TopologyKind::Sharded), MIN_TRANSACTION_VERSION);
        assert!(!info.transactions_allowed);
    }
}
