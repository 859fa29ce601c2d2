//! Cluster configuration: connection string parsing, timeout profile,
//! credentials and TLS settings.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("connection string has no scheme: {0}")]
    MissingScheme(String),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("connection string lists no seed hosts")]
    NoSeeds,
    #[error("invalid port in seed: {0}")]
    InvalidPort(String),
    #[error("invalid value for option {option}: {value}")]
    InvalidOption { option: String, value: String },
}

/// How to reach the cluster: seed list plus TLS flag, parsed from
/// `couchbase://host[:port][,host…][?k=v&…]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub tls: bool,
    pub seeds: Vec<Seed>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    pub host: String,
    pub port: Option<u16>,
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

/// Address family preference for DNS results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IpProtocol {
    #[default]
    Any,
    ForceIpv4,
    ForceIpv6,
}

/// Per-service and lifecycle timeouts, in the server defaults unless
/// overridden by connection-string options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutProfile {
    pub key_value: Duration,
    pub key_value_durable: Duration,
    pub query: Duration,
    pub search: Duration,
    pub analytics: Duration,
    pub view: Duration,
    pub management: Duration,
    pub eventing: Duration,
    pub connect: Duration,
    pub bootstrap: Duration,
    pub resolve: Duration,
}

impl Default for TimeoutProfile {
    fn default() -> Self {
        Self {
            key_value: Duration::from_millis(2_500),
            key_value_durable: Duration::from_millis(10_000),
            query: Duration::from_millis(75_000),
            search: Duration::from_millis(75_000),
            analytics: Duration::from_millis(75_000),
            view: Duration::from_millis(75_000),
            management: Duration::from_millis(75_000),
            eventing: Duration::from_millis(75_000),
            connect: Duration::from_millis(10_000),
            bootstrap: Duration::from_millis(10_000),
            resolve: Duration::from_millis(2_000),
        }
    }
}

/// TLS verification settings. `trust_certificate` replaces the default trust
/// anchors with a PEM file; `accept_all_certificates` disables verification
/// entirely (development setups only). X.509 client-certificate auth is
/// carried by [`Credentials::Certificate`], not here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub trust_certificate: Option<String>,
    pub accept_all_certificates: bool,
}

/// Everything tunable about a cluster object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterOptions {
    pub timeouts: TimeoutProfile,
    pub config_poll_interval: Duration,
    pub idle_http_connection_timeout: Duration,
    pub max_http_connections: usize,
    pub enable_tcp_keep_alive: bool,
    pub tcp_keep_alive_interval: Duration,
    pub ip_protocol: IpProtocol,
    pub preferred_network: Option<String>,
    pub enable_compression: bool,
    pub tls: TlsOptions,
}

/// The poller never runs hotter than this
pub const CONFIG_POLL_FLOOR: Duration = Duration::from_millis(50);

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            timeouts: TimeoutProfile::default(),
            config_poll_interval: Duration::from_millis(2_500),
            idle_http_connection_timeout: Duration::from_millis(4_500),
            max_http_connections: 0,
            enable_tcp_keep_alive: true,
            tcp_keep_alive_interval: Duration::from_secs(60),
            ip_protocol: IpProtocol::Any,
            preferred_network: None,
            enable_compression: true,
            tls: TlsOptions::default(),
        }
    }
}

impl ClusterOptions {
    /// Poll interval with the floor applied
    pub fn effective_poll_interval(&self) -> Duration {
        self.config_poll_interval.max(CONFIG_POLL_FLOOR)
    }
}

/// How the client authenticates.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// SASL username/password
    UsernamePassword { username: String, password: String },
    /// X.509 client certificate; skips SASL entirely
    Certificate { cert_path: String, key_path: String },
    /// OAUTHBEARER token
    OauthBearer { token: String },
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::UsernamePassword { username: username.into(), password: password.into() }
    }

    pub fn uses_sasl(&self) -> bool {
        !matches!(self, Credentials::Certificate { .. })
    }
}

/// Parse a connection string and fold its query options into `options`.
/// Unrecognized options are ignored so newer strings stay usable.
pub fn parse_connection_string(
    input: &str,
    options: &mut ClusterOptions,
) -> Result<ConnectionString, ConfigError> {
    let (scheme, rest) = input
        .split_once("://")
        .ok_or_else(|| ConfigError::MissingScheme(input.to_string()))?;
    let tls = match scheme {
        "couchbase" => false,
        "couchbases" => true,
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };

    let (hosts, params) = match rest.split_once('?') {
        Some((hosts, params)) => (hosts, Some(params)),
        None => (rest, None),
    };

    let mut seeds = Vec::new();
    for entry in hosts.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let seed = match entry.rsplit_once(':') {
            // a colon inside brackets is an IPv6 literal, not a port
            Some((host, port)) if !host.contains('[') || host.ends_with(']') => Seed {
                host: host.trim_matches(['[', ']']).to_string(),
                port: Some(
                    port.parse().map_err(|_| ConfigError::InvalidPort(entry.to_string()))?,
                ),
            },
            _ => Seed { host: entry.trim_matches(['[', ']']).to_string(), port: None },
        };
        seeds.push(seed);
    }
    if seeds.is_empty() {
        return Err(ConfigError::NoSeeds);
    }

    if let Some(params) = params {
        for pair in params.split('&') {
            let Some((key, value)) = pair.split_once('=') else { continue };
            apply_option(options, key, value)?;
        }
    }

    Ok(ConnectionString { tls, seeds })
}

fn parse_millis(option: &str, value: &str) -> Result<Duration, ConfigError> {
    value.parse::<u64>().map(Duration::from_millis).map_err(|_| ConfigError::InvalidOption {
        option: option.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(option: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidOption {
            option: option.to_string(),
            value: value.to_string(),
        }),
    }
}

fn apply_option(options: &mut ClusterOptions, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "kv_timeout" => options.timeouts.key_value = parse_millis(key, value)?,
        "kv_durable_timeout" => options.timeouts.key_value_durable = parse_millis(key, value)?,
        "query_timeout" => options.timeouts.query = parse_millis(key, value)?,
        "search_timeout" => options.timeouts.search = parse_millis(key, value)?,
        "analytics_timeout" => options.timeouts.analytics = parse_millis(key, value)?,
        "view_timeout" => options.timeouts.view = parse_millis(key, value)?,
        "management_timeout" => options.timeouts.management = parse_millis(key, value)?,
        "eventing_timeout" => options.timeouts.eventing = parse_millis(key, value)?,
        "connect_timeout" => options.timeouts.connect = parse_millis(key, value)?,
        "bootstrap_timeout" => options.timeouts.bootstrap = parse_millis(key, value)?,
        "resolve_timeout" => options.timeouts.resolve = parse_millis(key, value)?,
        "config_poll_interval" => options.config_poll_interval = parse_millis(key, value)?,
        "idle_http_connection_timeout" => {
            options.idle_http_connection_timeout = parse_millis(key, value)?
        }
        "max_http_connections" => {
            options.max_http_connections =
                value.parse().map_err(|_| ConfigError::InvalidOption {
                    option: key.to_string(),
                    value: value.to_string(),
                })?
        }
        "enable_tcp_keep_alive" => options.enable_tcp_keep_alive = parse_bool(key, value)?,
        "tcp_keep_alive_interval" => options.tcp_keep_alive_interval = parse_millis(key, value)?,
        "enable_compression" => options.enable_compression = parse_bool(key, value)?,
        "ip_protocol" => {
            options.ip_protocol = match value {
                "any" => IpProtocol::Any,
                "force_ipv4" => IpProtocol::ForceIpv4,
                "force_ipv6" => IpProtocol::ForceIpv6,
                _ => {
                    return Err(ConfigError::InvalidOption {
                        option: key.to_string(),
                        value: value.to_string(),
                    });
                }
            }
        }
        "network" | "preferred_network" => options.preferred_network = Some(value.to_string()),
        "trust_certificate" => options.tls.trust_certificate = Some(value.to_string()),
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_seed_string_with_options() {
        let mut options = ClusterOptions::default();
        let conn = parse_connection_string(
            "couchbase://10.0.0.1,10.0.0.2:11999,db.example.com?kv_timeout=1500&config_poll_interval=100&ip_protocol=force_ipv4",
            &mut options,
        )
        .unwrap();
        assert!(!conn.tls);
        assert_eq!(conn.seeds.len(), 3);
        assert_eq!(conn.seeds[0], Seed { host: "10.0.0.1".into(), port: None });
        assert_eq!(conn.seeds[1], Seed { host: "10.0.0.2".into(), port: Some(11999) });
        assert_eq!(options.timeouts.key_value, Duration::from_millis(1_500));
        assert_eq!(options.config_poll_interval, Duration::from_millis(100));
        assert_eq!(options.ip_protocol, IpProtocol::ForceIpv4);
    }

    #[test]
    fn tls_scheme_sets_tls() {
        let mut options = ClusterOptions::default();
        let conn = parse_connection_string("couchbases://secure.example.com", &mut options).unwrap();
        assert!(conn.tls);
    }

    #[test]
    fn rejects_bad_schemes_and_ports() {
        let mut options = ClusterOptions::default();
        assert!(matches!(
            parse_connection_string("http://x", &mut options),
            Err(ConfigError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            parse_connection_string("hostname", &mut options),
            Err(ConfigError::MissingScheme(_))
        ));
        assert!(matches!(
            parse_connection_string("couchbase://x:notaport", &mut options),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn ipv6_literals_keep_their_colons() {
        let mut options = ClusterOptions::default();
        let conn =
            parse_connection_string("couchbase://[2001:db8::1],[2001:db8::2]:11210", &mut options)
                .unwrap();
        assert_eq!(conn.seeds[0], Seed { host: "2001:db8::1".into(), port: None });
        assert_eq!(conn.seeds[1], Seed { host: "2001:db8::2".into(), port: Some(11210) });
    }

    #[test]
    fn unknown_options_are_ignored() {
        let mut options = ClusterOptions::default();
        parse_connection_string("couchbase://h?future_option=yes", &mut options).unwrap();
        assert_eq!(options, ClusterOptions::default());
    }

    #[test]
    fn poll_interval_floor_applies() {
        let options = ClusterOptions {
            config_poll_interval: Duration::from_millis(1),
            ..Default::default()
        };
        assert_eq!(options.effective_poll_interval(), CONFIG_POLL_FLOOR);
    }
}
