//! Provider addresses.
//!
//! A `ServiceAddress` is an immutable value identified by its canonical string
//! form `protocol://host:port/interface?form=..&version=..&key=value`. Options are
//! kept sorted so two addresses with the same content always print, compare and
//! hash the same way. Query keys and values are percent-encoded.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::FrameworkError;

/// Well-known option keys.
pub mod keys {
    /// Call timeout in milliseconds.
    pub const TIMEOUT: &str = "timeout";
    /// Serializer id used for arguments and results.
    pub const SERIALIZATION: &str = "serialization";
    /// Failover retry budget.
    pub const RETRIES: &str = "retries";
    /// Physical connections per channel.
    pub const CONNECTIONS: &str = "connections";
    /// Load balancer name.
    pub const LOADBALANCE: &str = "loadbalance";
    /// Fault-tolerance strategy name.
    pub const CLUSTER: &str = "cluster";
    /// Form/group query key.
    pub const FORM: &str = "form";
    /// Version query key.
    pub const VERSION: &str = "version";
}

/// Default protocol name.
pub const DEFAULT_PROTOCOL: &str = "strato";

#[derive(Debug)]
struct AddressInner {
    protocol: String,
    host: String,
    port: u16,
    interface: String,
    form: String,
    version: String,
    options: BTreeMap<String, String>,
    canonical: String,
}

/// Immutable provider address.
///
/// Cloning is cheap; every "setter" returns a new value.
///
/// ## Example
///
/// ```rust
/// use strato_core::ServiceAddress;
///
/// let addr: ServiceAddress = "strato://127.0.0.1:9000/Echo?version=1.0&timeout=500"
///     .parse()
///     .unwrap();
/// assert_eq!(addr.interface(), "Echo");
/// assert_eq!(addr.timeout(), Some(std::time::Duration::from_millis(500)));
///
/// let tuned = addr.with_option("retries", "5");
/// assert_ne!(addr, tuned);
/// assert_eq!(addr.retries(), None);
/// ```
#[derive(Clone)]
pub struct ServiceAddress {
    inner: Arc<AddressInner>,
}

impl ServiceAddress {
    /// Create an address with the default protocol, no form, version or options.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, interface: impl Into<String>) -> Self {
        Self::build(
            DEFAULT_PROTOCOL.to_string(),
            host.into(),
            port,
            interface.into(),
            String::new(),
            String::new(),
            BTreeMap::new(),
        )
    }

    fn build(
        protocol: String,
        host: String,
        port: u16,
        interface: String,
        form: String,
        version: String,
        options: BTreeMap<String, String>,
    ) -> Self {
        let mut canonical = if host.contains(':') {
            format!("{protocol}://[{host}]:{port}/{interface}")
        } else {
            format!("{protocol}://{host}:{port}/{interface}")
        };
        let mut sep = '?';
        let mut push = |key: &str, value: &str| {
            canonical.push(sep);
            canonical.push_str(&urlencoding::encode(key));
            canonical.push('=');
            canonical.push_str(&urlencoding::encode(value));
            sep = '&';
        };
        if !form.is_empty() {
            push(keys::FORM, &form);
        }
        if !version.is_empty() {
            push(keys::VERSION, &version);
        }
        for (key, value) in &options {
            push(key, value);
        }

        Self {
            inner: Arc::new(AddressInner {
                protocol,
                host,
                port,
                interface,
                form,
                version,
                options,
                canonical,
            }),
        }
    }

    fn rebuild(&self, edit: impl FnOnce(&mut AddressParts)) -> Self {
        let inner = &self.inner;
        let mut parts = AddressParts {
            protocol: inner.protocol.clone(),
            host: inner.host.clone(),
            port: inner.port,
            interface: inner.interface.clone(),
            form: inner.form.clone(),
            version: inner.version.clone(),
            options: inner.options.clone(),
        };
        edit(&mut parts);
        Self::build(
            parts.protocol,
            parts.host,
            parts.port,
            parts.interface,
            parts.form,
            parts.version,
            parts.options,
        )
    }

    /// Copy with a different protocol.
    #[must_use]
    pub fn with_protocol(&self, protocol: impl Into<String>) -> Self {
        let protocol = protocol.into();
        self.rebuild(|p| p.protocol = protocol)
    }

    /// Copy with a different form/group.
    #[must_use]
    pub fn with_form(&self, form: impl Into<String>) -> Self {
        let form = form.into();
        self.rebuild(|p| p.form = form)
    }

    /// Copy with a different version.
    #[must_use]
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        let version = version.into();
        self.rebuild(|p| p.version = version)
    }

    /// Copy with one option set.
    ///
    /// `form` and `version` set the dedicated fields.
    #[must_use]
    pub fn with_option(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        self.rebuild(|p| match key.as_str() {
            keys::FORM => p.form = value,
            keys::VERSION => p.version = value,
            _ => {
                p.options.insert(key, value);
            }
        })
    }

    /// Copy with one option removed.
    #[must_use]
    pub fn without_option(&self, key: &str) -> Self {
        self.rebuild(|p| match key {
            keys::FORM => p.form.clear(),
            keys::VERSION => p.version.clear(),
            _ => {
                p.options.remove(key);
            }
        })
    }

    /// Copy bound to another host and port.
    #[must_use]
    pub fn with_endpoint(&self, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        self.rebuild(|p| {
            p.host = host;
            p.port = port;
        })
    }

    /// Protocol name.
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    /// Host name or IP literal.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// TCP port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Interface name.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.inner.interface
    }

    /// Form/group, empty when unset.
    #[must_use]
    pub fn form(&self) -> &str {
        &self.inner.form
    }

    /// Version, empty when unset.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// All options in key order.
    #[must_use]
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.inner.options
    }

    /// `host:port`, suitable for connecting.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.inner.host.contains(':') {
            format!("[{}]:{}", self.inner.host, self.inner.port)
        } else {
            format!("{}:{}", self.inner.host, self.inner.port)
        }
    }

    /// Key the provider router uses to find a service: `interface` or `interface:version`.
    #[must_use]
    pub fn service_key(&self) -> String {
        service_key(&self.inner.interface, &self.inner.version)
    }

    /// Canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.inner.canonical
    }

    /// Raw option value.
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&str> {
        self.inner.options.get(key).map(String::as_str)
    }

    /// Option parsed into `T`; unparsable values read as absent.
    #[must_use]
    pub fn option_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.option(key).and_then(|v| v.parse().ok())
    }

    /// Call timeout from the `timeout` option (milliseconds).
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.option_parsed::<u64>(keys::TIMEOUT)
            .map(Duration::from_millis)
    }

    /// Serializer id from the `serialization` option.
    #[must_use]
    pub fn serialization(&self) -> Option<u8> {
        self.option_parsed(keys::SERIALIZATION)
    }

    /// Failover budget from the `retries` option.
    #[must_use]
    pub fn retries(&self) -> Option<u32> {
        self.option_parsed(keys::RETRIES)
    }

    /// Pool size from the `connections` option.
    #[must_use]
    pub fn connections(&self) -> Option<usize> {
        self.option_parsed(keys::CONNECTIONS)
    }
}

struct AddressParts {
    protocol: String,
    host: String,
    port: u16,
    interface: String,
    form: String,
    version: String,
    options: BTreeMap<String, String>,
}

/// Routing key for an interface and version.
#[must_use]
pub fn service_key(interface: &str, version: &str) -> String {
    if version.is_empty() {
        interface.to_string()
    } else {
        format!("{interface}:{version}")
    }
}

impl PartialEq for ServiceAddress {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.canonical == other.inner.canonical
    }
}

impl Eq for ServiceAddress {}

impl Hash for ServiceAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.canonical.hash(state);
    }
}

impl PartialOrd for ServiceAddress {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceAddress {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.inner.canonical.cmp(&other.inner.canonical)
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.canonical)
    }
}

impl fmt::Debug for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceAddress")
            .field(&self.inner.canonical)
            .finish()
    }
}

impl FromStr for ServiceAddress {
    type Err = FrameworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| FrameworkError::InvalidAddress(format!("{s}: {why}"));

        let (protocol, rest) = s.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if protocol.is_empty() {
            return Err(invalid("empty protocol"));
        }
        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };
        let (authority, interface) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing interface"))?;
        if interface.is_empty() {
            return Err(invalid("empty interface"));
        }
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;

        let mut form = String::new();
        let mut version = String::new();
        let mut options = BTreeMap::new();
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(key).map_err(|_| invalid("bad query encoding"))?;
            let value = urlencoding::decode(value)
                .map_err(|_| invalid("bad query encoding"))?
                .into_owned();
            match key.as_ref() {
                keys::FORM => form = value,
                keys::VERSION => version = value,
                _ => {
                    options.insert(key.into_owned(), value);
                }
            }
        }

        Ok(Self::build(
            protocol.to_string(),
            host.to_string(),
            port,
            interface.to_string(),
            form,
            version,
            options,
        ))
    }
}
