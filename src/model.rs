//! Entity model: proxies, rotation queues and the per-(proxy, queue)
//! standing records that join them.
//!
//! Cache key scheme: durable-keyed records use `q_{id}` / `p_{id}`, records
//! not yet persisted use `qt_{n}` / `pt_{n}` with a cache-minted temporary
//! id. A detail is keyed by the pair of keys it joins:
//! `d_{queue_key}_{proxy_key}`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::PoolError;

/// Wire protocol spoken by a proxy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl Protocol {
    /// The rotation layer does not dispatch through socks proxies.
    pub fn is_socks(&self) -> bool {
        matches!(self, Protocol::Socks4 | Protocol::Socks5)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        };
        f.write_str(s)
    }
}

impl FromStr for Protocol {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "socks4" => Ok(Protocol::Socks4),
            "socks5" => Ok(Protocol::Socks5),
            other => Err(PoolError::Malformed(format!("invalid protocol '{other}'"))),
        }
    }
}

/// A network relay endpoint. Identity is `(address, port)`; the durable
/// store enforces uniqueness. Immutable after creation except for id
/// assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Proxy {
    /// Durable id, `None` until persisted.
    pub proxy_id: Option<i64>,
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Cache key this record is stored under, set on registration.
    pub proxy_key: Option<String>,
}

impl Proxy {
    pub fn new(address: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            proxy_id: None,
            address: address.into(),
            port,
            protocol,
            proxy_key: None,
        }
    }

    /// `protocol://address:port` form used in log lines.
    pub fn urlify(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.address, self.port)
    }

    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("address".into(), self.address.clone());
        fields.insert("port".into(), self.port.to_string());
        fields.insert("protocol".into(), self.protocol.to_string());
        if let Some(id) = self.proxy_id {
            fields.insert("proxy_id".into(), id.to_string());
        }
        if let Some(ref key) = self.proxy_key {
            fields.insert("proxy_key".into(), key.clone());
        }
        fields
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, PoolError> {
        Ok(Self {
            proxy_id: parse_opt_i64(fields, "proxy_id")?,
            address: require(fields, "address")?.to_string(),
            port: require(fields, "port")?
                .parse()
                .map_err(|_| PoolError::Malformed("proxy port".into()))?,
            protocol: require(fields, "protocol")?.parse()?,
            proxy_key: fields.get("proxy_key").cloned(),
        })
    }
}

/// A rotation pool for one destination domain. Identity is `domain`. Two
/// rows are reserved: the seed queue (global discovery pool) and the
/// aggregate queue, each pinned to a configured id and sentinel domain.
#[derive(Debug, Clone, PartialEq)]
pub struct Queue {
    /// Durable id, `None` until persisted.
    pub queue_id: Option<i64>,
    pub domain: String,
    /// Cache key this record is stored under, set on registration.
    pub queue_key: Option<String>,
}

impl Queue {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            queue_id: None,
            domain: domain.into(),
            queue_key: None,
        }
    }

    pub fn with_id(queue_id: i64, domain: impl Into<String>) -> Self {
        Self {
            queue_id: Some(queue_id),
            domain: domain.into(),
            queue_key: None,
        }
    }

    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("domain".into(), self.domain.clone());
        if let Some(id) = self.queue_id {
            fields.insert("queue_id".into(), id.to_string());
        }
        if let Some(ref key) = self.queue_key {
            fields.insert("queue_key".into(), key.clone());
        }
        fields
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, PoolError> {
        Ok(Self {
            queue_id: parse_opt_i64(fields, "queue_id")?,
            domain: require(fields, "domain")?.to_string(),
            queue_key: fields.get("queue_key").cloned(),
        })
    }
}

/// One proxy's standing within one queue. Identity is `(proxy, queue)`,
/// unique. The counters are mutated only by the dispatch/report cycle and
/// written back through the cache store.
#[derive(Debug, Clone, PartialEq)]
pub struct Detail {
    pub detail_id: Option<i64>,
    pub proxy_id: Option<i64>,
    pub queue_id: Option<i64>,
    pub proxy_key: Option<String>,
    pub queue_key: Option<String>,
    /// Must agree with which rotation sub-queue holds this detail.
    pub active: bool,
    /// Seconds the last dispatch took.
    pub load_time: f64,
    /// Unix seconds.
    pub last_active: i64,
    /// Unix seconds.
    pub last_used: i64,
    pub bad_count: i64,
    pub blacklisted: bool,
    pub blacklisted_count: i64,
    pub lifetime_good: i64,
    pub lifetime_bad: i64,
}

impl Default for Detail {
    fn default() -> Self {
        Self {
            detail_id: None,
            proxy_id: None,
            queue_id: None,
            proxy_key: None,
            queue_key: None,
            active: false,
            load_time: 0.0,
            last_active: 0,
            last_used: 0,
            bad_count: 0,
            blacklisted: false,
            blacklisted_count: 0,
            lifetime_good: 0,
            lifetime_bad: 0,
        }
    }
}

impl Detail {
    /// A fresh standing record joining the given cache keys.
    pub fn joining(proxy_key: impl Into<String>, queue_key: impl Into<String>) -> Self {
        Self {
            proxy_key: Some(proxy_key.into()),
            queue_key: Some(queue_key.into()),
            ..Self::default()
        }
    }

    /// Cache key for this detail; requires both referenced keys.
    pub fn detail_key(&self) -> Option<String> {
        match (&self.queue_key, &self.proxy_key) {
            (Some(q), Some(p)) => Some(format!("d_{q}_{p}")),
            _ => None,
        }
    }

    pub fn to_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("active".into(), bool_str(self.active));
        fields.insert("load_time".into(), self.load_time.to_string());
        fields.insert("last_active".into(), self.last_active.to_string());
        fields.insert("last_used".into(), self.last_used.to_string());
        fields.insert("bad_count".into(), self.bad_count.to_string());
        fields.insert("blacklisted".into(), bool_str(self.blacklisted));
        fields.insert("blacklisted_count".into(), self.blacklisted_count.to_string());
        fields.insert("lifetime_good".into(), self.lifetime_good.to_string());
        fields.insert("lifetime_bad".into(), self.lifetime_bad.to_string());
        if let Some(id) = self.detail_id {
            fields.insert("detail_id".into(), id.to_string());
        }
        if let Some(id) = self.proxy_id {
            fields.insert("proxy_id".into(), id.to_string());
        }
        if let Some(id) = self.queue_id {
            fields.insert("queue_id".into(), id.to_string());
        }
        if let Some(ref key) = self.proxy_key {
            fields.insert("proxy_key".into(), key.clone());
        }
        if let Some(ref key) = self.queue_key {
            fields.insert("queue_key".into(), key.clone());
        }
        fields
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, PoolError> {
        Ok(Self {
            detail_id: parse_opt_i64(fields, "detail_id")?,
            proxy_id: parse_opt_i64(fields, "proxy_id")?,
            queue_id: parse_opt_i64(fields, "queue_id")?,
            proxy_key: fields.get("proxy_key").cloned(),
            queue_key: fields.get("queue_key").cloned(),
            active: parse_bool(fields, "active")?,
            load_time: parse_or_default(fields, "load_time")?,
            last_active: parse_or_default(fields, "last_active")?,
            last_used: parse_or_default(fields, "last_used")?,
            bad_count: parse_or_default(fields, "bad_count")?,
            blacklisted: parse_bool(fields, "blacklisted")?,
            blacklisted_count: parse_or_default(fields, "blacklisted_count")?,
            lifetime_good: parse_or_default(fields, "lifetime_good")?,
            lifetime_bad: parse_or_default(fields, "lifetime_bad")?,
        })
    }
}

fn bool_str(v: bool) -> String {
    if v { "true".into() } else { "false".into() }
}

fn require<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, PoolError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| PoolError::Malformed(format!("missing field '{name}'")))
}

fn parse_opt_i64(fields: &HashMap<String, String>, name: &str) -> Result<Option<i64>, PoolError> {
    match fields.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| PoolError::Malformed(format!("field '{name}' is not an id"))),
    }
}

fn parse_bool(fields: &HashMap<String, String>, name: &str) -> Result<bool, PoolError> {
    match fields.get(name).map(String::as_str) {
        None => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") | Some("") => Ok(false),
        Some(other) => Err(PoolError::Malformed(format!(
            "field '{name}' is not a bool: '{other}'"
        ))),
    }
}

fn parse_or_default<T>(fields: &HashMap<String, String>, name: &str) -> Result<T, PoolError>
where
    T: FromStr + Default,
{
    match fields.get(name) {
        None => Ok(T::default()),
        Some(raw) => raw
            .parse()
            .map_err(|_| PoolError::Malformed(format!("field '{name}' is not numeric"))),
    }
}
