use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables shared by the coordination loops. Injected into each core at
/// construction; there is no process-global configuration.
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    /// Fallback polling interval for tickers and the cron backend.
    pub poll_interval: Duration,
    /// A started job whose last heartbeat is older than this becomes
    /// claimable again.
    pub heartbeat_deadline: Duration,
    /// A lock lease older than this can be taken over.
    pub hold_deadline: Duration,
    /// Relative deviation applied to every ticker sleep, in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            heartbeat_deadline: Duration::from_secs(20),
            hold_deadline: Duration::from_secs(20),
            jitter_factor: 0.1,
        }
    }
}

impl CoreConfig {
    /// Lease renewal cadence used by the lock client helper.
    pub fn renew_interval(&self) -> Duration {
        self.hold_deadline / 2
    }
}

/// The four independently startable server components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Component {
    Jobs,
    Cronjobs,
    Locks,
    Events,
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_cert_path: Option<PathBuf>,
}

impl TlsConfig {
    /// TLS is enabled only when all three materials are configured.
    pub fn is_configured(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some() && self.ca_cert_path.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db: String,
    pub listen_addr: SocketAddr,
    pub components: Vec<Component>,
    pub tls: TlsConfig,
    /// Bind address for the HTTP health listener.
    pub health_addr: Option<SocketAddr>,
    pub core: CoreConfig,
}

/// Parse a duration flag like `10s`, `500ms`, `2m` or `1m30s`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                digits.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration {:?}", input))?;
        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        total += match unit.as_str() {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            _ => return Err(format!("invalid duration unit {:?} in {:?}", unit, input)),
        };
    }
    Ok(total)
}
