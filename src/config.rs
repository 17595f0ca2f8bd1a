//! Connection configuration.
//!
//! [`ConnectOptions`] collects what the caller asked for (builder values and
//! an optional DSN). Negotiation resolves it, together with an [`Env`]
//! snapshot, into the immutable [`ConnectionParameters`] used for every
//! attempt.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PgError, PgResult};

pub const DEFAULT_PORT: u16 = 5432;

/// Socket directories probed, in order, when no host is configured.
pub const DEFAULT_SOCKET_DIRS: &[&str] = &[
    "/run/postgresql",
    "/var/run/postgresql",
    "/tmp",
    "/private/tmp",
];

// ============================================================================
// SSL mode and target session attributes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    /// Modes that continue in plaintext on an `'N'` answer to SSLRequest.
    /// The SSL attempt of `allow` is a retry and must be encrypted.
    pub fn is_advisory(self) -> bool {
        matches!(self, SslMode::Prefer)
    }

    /// Whether the first attempt for an address goes over SSL.
    pub fn ssl_first(self) -> bool {
        !matches!(self, SslMode::Disable | SslMode::Allow)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Allow => "allow",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

impl FromStr for SslMode {
    type Err = PgError;

    fn from_str(s: &str) -> PgResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" | "verify_ca" => Ok(SslMode::VerifyCa),
            "verify-full" | "verify_full" => Ok(SslMode::VerifyFull),
            other => Err(PgError::Config(format!(
                "`sslmode` parameter must be one of: disable, allow, prefer, require, verify-ca, verify-full (got {:?})",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetSessionAttrs {
    #[default]
    Any,
    Primary,
    Standby,
    PreferStandby,
    ReadWrite,
    ReadOnly,
}

impl TargetSessionAttrs {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetSessionAttrs::Any => "any",
            TargetSessionAttrs::Primary => "primary",
            TargetSessionAttrs::Standby => "standby",
            TargetSessionAttrs::PreferStandby => "prefer-standby",
            TargetSessionAttrs::ReadWrite => "read-write",
            TargetSessionAttrs::ReadOnly => "read-only",
        }
    }
}

impl fmt::Display for TargetSessionAttrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetSessionAttrs {
    type Err = PgError;

    fn from_str(s: &str) -> PgResult<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "any" => Ok(TargetSessionAttrs::Any),
            "primary" => Ok(TargetSessionAttrs::Primary),
            "standby" => Ok(TargetSessionAttrs::Standby),
            "prefer-standby" => Ok(TargetSessionAttrs::PreferStandby),
            "read-write" => Ok(TargetSessionAttrs::ReadWrite),
            "read-only" => Ok(TargetSessionAttrs::ReadOnly),
            other => Err(PgError::Config(format!(
                "target_session_attrs is expected to be one of any, primary, standby, prefer-standby, read-write, read-only, got {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl FromStr for TlsVersion {
    type Err = PgError;

    fn from_str(s: &str) -> PgResult<Self> {
        match s {
            "TLSv1.2" => Ok(TlsVersion::Tls12),
            "TLSv1.3" => Ok(TlsVersion::Tls13),
            other => Err(PgError::Config(format!(
                "unsupported TLS protocol version {:?} (expected TLSv1.2 or TLSv1.3)",
                other
            ))),
        }
    }
}

// ============================================================================
// Addresses and passwords
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Address {
    /// Address for a configured host, which may be a socket directory.
    pub fn for_host(host: &str, port: u16) -> Self {
        if host.starts_with('/') {
            Address::Unix(Path::new(host).join(format!(".s.PGSQL.{}", port)))
        } else {
            Address::Tcp {
                host: host.to_string(),
                port,
            }
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Address::Unix(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Address::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Address::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

pub type PasswordFuture = Pin<Box<dyn Future<Output = PgResult<String>> + Send>>;

/// A password, either known up front or fetched on every connection attempt.
#[derive(Clone)]
pub enum Password {
    Plain(String),
    Provider(Arc<dyn Fn() -> PasswordFuture + Send + Sync>),
}

impl Password {
    pub async fn resolve(&self) -> PgResult<String> {
        match self {
            Password::Plain(p) => Ok(p.clone()),
            Password::Provider(provider) => provider().await,
        }
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Password::Plain(_) => f.write_str("Password::Plain(***)"),
            Password::Provider(_) => f.write_str("Password::Provider(..)"),
        }
    }
}

impl From<&str> for Password {
    fn from(p: &str) -> Self {
        Password::Plain(p.to_string())
    }
}

impl From<String> for Password {
    fn from(p: String) -> Self {
        Password::Plain(p)
    }
}

// ============================================================================
// Resolved parameters
// ============================================================================

/// Certificate material and protocol bounds for TLS sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
    pub root_cert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
}

/// Everything needed to authenticate one session. Immutable once resolved.
#[derive(Debug, Clone)]
pub struct ConnectionParameters {
    pub user: String,
    pub password: Option<Password>,
    pub database: String,
    pub ssl_mode: SslMode,
    pub direct_tls: bool,
    pub tls: TlsFiles,
    pub target_session_attrs: TargetSessionAttrs,
    /// Sent in the startup packet, in order.
    pub server_settings: Vec<(String, String)>,
}

/// Client-side behaviour knobs that do not affect authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Default timeout for queries; `None` waits forever.
    pub command_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub statement_cache_size: usize,
    /// Zero disables the statement cache.
    pub max_cached_statement_lifetime: Duration,
    /// Longer queries are never cached.
    pub max_cacheable_statement_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command_timeout: None,
            connect_timeout: Duration::from_secs(60),
            statement_cache_size: 100,
            max_cached_statement_lifetime: Duration::from_secs(300),
            max_cacheable_statement_size: 1024 * 15,
        }
    }
}

// ============================================================================
// Environment snapshot
// ============================================================================

/// A read-only view of environment variables.
///
/// Resolution reads through this instead of `std::env` so it can be driven
/// deterministically.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, String>,
}

impl Env {
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    /// Non-empty value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn home_dir(&self) -> Option<PathBuf> {
        self.get("HOME").map(PathBuf::from)
    }

    pub fn os_user(&self) -> Option<&str> {
        self.get("USER")
            .or_else(|| self.get("LOGNAME"))
            .or_else(|| self.get("USERNAME"))
    }
}

// ============================================================================
// Connect options (builder)
// ============================================================================

/// What the caller asked for. Unset fields fall back to the DSN, then the
/// environment, then built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub(crate) dsn: Option<String>,
    pub(crate) hosts: Vec<String>,
    pub(crate) ports: Vec<u16>,
    pub(crate) user: Option<String>,
    pub(crate) password: Option<Password>,
    pub(crate) passfile: Option<PathBuf>,
    pub(crate) database: Option<String>,
    pub(crate) ssl_mode: Option<SslMode>,
    pub(crate) direct_tls: bool,
    pub(crate) tls: TlsFiles,
    pub(crate) target_session_attrs: Option<TargetSessionAttrs>,
    pub(crate) server_settings: Vec<(String, String)>,
    pub(crate) client: ClientConfig,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a `postgres://` URL.
    pub fn from_dsn(dsn: &str) -> Self {
        Self {
            dsn: Some(dsn.to_string()),
            ..Self::default()
        }
    }

    /// Add a host. Accepts a comma-separated list, `[ipv6]:port`, `host:port`
    /// and socket directories.
    pub fn host(mut self, host: &str) -> Self {
        self.hosts.push(host.to_string());
        self
    }

    /// A single port for all hosts.
    pub fn port(mut self, port: u16) -> Self {
        self.ports = vec![port];
        self
    }

    /// One port per host.
    pub fn ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn password(mut self, password: impl Into<Password>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Fetch the password lazily on every attempt.
    pub fn password_provider<F, Fut>(mut self, provider: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PgResult<String>> + Send + 'static,
    {
        self.password = Some(Password::Provider(Arc::new(move || {
            Box::pin(provider()) as PasswordFuture
        })));
        self
    }

    pub fn passfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.passfile = Some(path.into());
        self
    }

    pub fn database(mut self, database: &str) -> Self {
        self.database = Some(database.to_string());
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = Some(mode);
        self
    }

    /// Start TLS immediately instead of sending an SSLRequest first.
    pub fn direct_tls(mut self, direct: bool) -> Self {
        self.direct_tls = direct;
        self
    }

    pub fn ssl_root_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls.root_cert = Some(path.into());
        self
    }

    pub fn ssl_client_cert(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls.cert = Some(cert.into());
        self.tls.key = Some(key.into());
        self
    }

    pub fn target_session_attrs(mut self, attrs: TargetSessionAttrs) -> Self {
        self.target_session_attrs = Some(attrs);
        self
    }

    pub fn server_setting(mut self, name: &str, value: &str) -> Self {
        set_ordered(&mut self.server_settings, name, value);
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.client.command_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.client.connect_timeout = timeout;
        self
    }

    pub fn statement_cache_size(mut self, size: usize) -> Self {
        self.client.statement_cache_size = size;
        self
    }

    pub fn max_cached_statement_lifetime(mut self, lifetime: Duration) -> Self {
        self.client.max_cached_statement_lifetime = lifetime;
        self
    }

    pub fn max_cacheable_statement_size(mut self, size: usize) -> Self {
        self.client.max_cacheable_statement_size = size;
        self
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.client
    }
}

fn set_ordered(settings: &mut Vec<(String, String)>, name: &str, value: &str) {
    match settings.iter_mut().find(|(k, _)| k == name) {
        Some(entry) => entry.1 = value.to_string(),
        None => settings.push((name.to_string(), value.to_string())),
    }
}

// ============================================================================
// DSN parsing
// ============================================================================

/// Components of a `postgres://` URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dsn {
    /// Raw host specs from the netloc (may carry `:port`).
    pub hosts: Vec<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub params: Vec<(String, String)>,
}

impl Dsn {
    pub fn parse(dsn: &str) -> PgResult<Self> {
        let rest = dsn
            .strip_prefix("postgresql://")
            .or_else(|| dsn.strip_prefix("postgres://"))
            .ok_or_else(|| {
                PgError::Config(format!(
                    "invalid DSN: scheme is expected to be either \"postgresql\" or \"postgres\", got {:?}",
                    dsn.split("://").next().unwrap_or_default()
                ))
            })?;

        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };
        let (netloc, path) = match rest.split_once('/') {
            Some((n, p)) => (n, Some(p)),
            None => (rest, None),
        };

        let mut out = Dsn::default();
        let hostlist = match netloc.rsplit_once('@') {
            Some((credentials, hosts)) => {
                match credentials.split_once(':') {
                    Some((user, password)) => {
                        out.user = non_empty(percent_decode(user)?);
                        out.password = Some(percent_decode(password)?);
                    }
                    None => out.user = non_empty(percent_decode(credentials)?),
                }
                hosts
            }
            None => netloc,
        };
        if !hostlist.is_empty() {
            out.hosts = hostlist
                .split(',')
                .map(percent_decode)
                .collect::<PgResult<_>>()?;
        }
        if let Some(path) = path {
            out.database = non_empty(percent_decode(path)?);
        }
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                out.params
                    .push((percent_decode(key)?, percent_decode(value)?));
            }
        }
        Ok(out)
    }

    /// Remove and return a query parameter.
    pub(crate) fn take_param(&mut self, name: &str) -> Option<String> {
        let idx = self.params.iter().position(|(k, _)| k == name)?;
        Some(self.params.remove(idx).1)
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn percent_decode(s: &str) -> PgResult<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = s
                    .get(i + 1..i + 3)
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| {
                        PgError::Config(format!("invalid percent-encoding in DSN component {:?}", s))
                    })?;
                out.push(hex);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out)
        .map_err(|_| PgError::Config(format!("DSN component {:?} is not valid UTF-8", s)))
}

// ============================================================================
// Host list parsing
// ============================================================================

/// Expand host specs and ports into parallel `(host, port)` lists.
///
/// `ports` is either empty, a single port for every host, or one port per
/// host. An entry's own `:port` suffix is used when no explicit port applies.
pub fn parse_hostlist(
    specs: &[String],
    ports: &[u16],
    default_port: u16,
) -> PgResult<Vec<(String, u16)>> {
    let specs: Vec<&str> = specs
        .iter()
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if ports.len() > 1 && ports.len() != specs.len() {
        return Err(PgError::Config(format!(
            "could not match {} port numbers to {} hosts",
            ports.len(),
            specs.len()
        )));
    }

    let mut out = Vec::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        let (host, spec_port) = split_host_port(spec)?;
        let port = match ports.len() {
            0 => spec_port.unwrap_or(default_port),
            1 => ports[0],
            _ => ports[i],
        };
        out.push((host, port));
    }
    Ok(out)
}

fn split_host_port(spec: &str) -> PgResult<(String, Option<u16>)> {
    if spec.starts_with('/') {
        return Ok((spec.to_string(), None));
    }
    if let Some(rest) = spec.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            PgError::Config(format!("invalid IPv6 host specification {:?}", spec))
        })?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None => None,
        };
        return Ok((host.to_string(), port));
    }
    match spec.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host.to_string(), Some(parse_port(port)?))),
        // bare IPv6 literal
        Some(_) => Ok((spec.to_string(), None)),
        None => Ok((spec.to_string(), None)),
    }
}

pub(crate) fn parse_port(s: &str) -> PgResult<u16> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| PgError::Config(format!("invalid port {:?}", s)))
}

/// Parse a comma-separated port list (`PGPORT`, `?port=`).
pub(crate) fn parse_port_list(s: &str) -> PgResult<Vec<u16>> {
    s.split(',').map(parse_port).collect()
}
