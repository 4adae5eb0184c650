use std::collections::HashSet;
use std::net::SocketAddr;

/// Source-address allow-list. Matching is exact on the textual form of the
/// peer address; there are no networks or wildcards.
#[derive(Debug, Clone, Default)]
pub struct AccessFilter {
    allowed: HashSet<String>,
}

impl AccessFilter {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_allowed(&self, remote_ip: &str) -> bool {
        self.allowed.contains(remote_ip)
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

/// Textual form of a peer or local address. IPv4 clients of a dual-stack
/// listener show up as `::ffff:a.b.c.d` and are reported as plain IPv4.
pub fn canonical_ip(addr: &SocketAddr) -> String {
    addr.ip().to_canonical().to_string()
}
