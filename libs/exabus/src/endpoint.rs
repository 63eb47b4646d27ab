//! EndPoint Addressing
//!
//! An [`EndPoint`] is the immutable, cheaply clonable address of a bus
//! participant. It is produced by a driver during resolution and compared by
//! protocol plus address; the optional query string carries transport hints
//! (for example a memory region capacity) and never affects identity.

use crate::error::{BusError, Result};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use url::Url;

/// Resolved bus address: `protocol://address[?query]`
#[derive(Clone)]
pub struct EndPoint {
    inner: Arc<EndPointInner>,
}

struct EndPointInner {
    protocol: String,
    address: String,
    query: Option<String>,
    shard_hash: u32,
}

impl EndPoint {
    /// Create an endpoint from already-validated parts
    pub fn new(protocol: impl Into<String>, address: impl Into<String>, query: Option<String>) -> Self {
        let protocol = protocol.into();
        let address = address.into();
        let shard_hash = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(protocol.as_bytes());
            hasher.update(b"://");
            hasher.update(address.as_bytes());
            hasher.finalize()
        };

        Self {
            inner: Arc::new(EndPointInner {
                protocol,
                address,
                query: query.filter(|q| !q.is_empty()),
                shard_hash,
            }),
        }
    }

    /// Parse a `protocol://address[?query]` name.
    ///
    /// Paths, fragments and credentials are rejected; the address is the
    /// authority (host and optional port) as written.
    pub fn parse(name: &str) -> Result<Self> {
        let url = Url::parse(name).map_err(|e| BusError::invalid_endpoint(name, e.to_string()))?;

        if !matches!(url.path(), "" | "/") {
            return Err(BusError::invalid_endpoint(name, "path components are not permitted"));
        }
        if url.fragment().is_some() {
            return Err(BusError::invalid_endpoint(name, "fragments are not permitted"));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(BusError::invalid_endpoint(name, "credentials are not permitted"));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| BusError::invalid_endpoint(name, "missing address"))?;
        let address = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self::new(url.scheme(), address, url.query().map(str::to_string)))
    }

    /// Transport protocol (URL scheme)
    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    /// Provider-resolved address
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Raw query string, if any
    pub fn query(&self) -> Option<&str> {
        self.inner.query.as_deref()
    }

    /// Look up a single `key=value` pair in the query string
    pub fn query_param(&self, key: &str) -> Option<String> {
        let query = self.inner.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Stable hash of protocol and address, identical across processes.
    #[inline]
    pub fn shard_hash(&self) -> u32 {
        self.inner.shard_hash
    }

    /// Shard index for `shards` workers; the global scope maps to zero.
    #[inline]
    pub fn shard_of(endpoint: Option<&EndPoint>, shards: usize) -> usize {
        match endpoint {
            Some(ep) if shards > 0 => ep.shard_hash() as usize % shards,
            _ => 0,
        }
    }
}

impl PartialEq for EndPoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.protocol == other.inner.protocol && self.inner.address == other.inner.address)
    }
}

impl Eq for EndPoint {}

impl Hash for EndPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.protocol.hash(state);
        self.inner.address.hash(state);
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.inner.protocol, self.inner.address)?;
        if let Some(query) = &self.inner.query {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

impl fmt::Debug for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndPoint({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_with_port_and_query() {
        let ep = EndPoint::parse("lbm://region:7000?capacity=64").unwrap();
        assert_eq!(ep.protocol(), "lbm");
        assert_eq!(ep.address(), "region:7000");
        assert_eq!(ep.query_param("capacity").as_deref(), Some("64"));
        assert_eq!(ep.to_string(), "lbm://region:7000?capacity=64");
    }

    #[test]
    fn test_query_excluded_from_identity() {
        let a = EndPoint::parse("lbm://region?capacity=64").unwrap();
        let b = EndPoint::parse("lbm://region?capacity=8").unwrap();
        let c = EndPoint::parse("lb://region").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.shard_hash(), b.shard_hash());
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_rejects_path_and_fragment() {
        assert!(matches!(
            EndPoint::parse("lb://host/inbox"),
            Err(BusError::InvalidEndPoint { .. })
        ));
        assert!(EndPoint::parse("lb://host#frag").is_err());
        assert!(EndPoint::parse("not a url").is_err());
    }

    #[test]
    fn test_shard_of_global_scope() {
        let ep = EndPoint::parse("lb://alpha").unwrap();
        assert_eq!(EndPoint::shard_of(None, 8), 0);
        assert_eq!(EndPoint::shard_of(Some(&ep), 8), ep.shard_hash() as usize % 8);
    }
}
