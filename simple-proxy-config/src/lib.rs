use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;

/// Proxy configuration loaded from YAML.
///
/// Every field has a default, so an empty file (or no file at all) yields a
/// proxy listening on port 8000 that identifies itself as `simple_proxy/1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address to accept proxy clients on (e.g., "0.0.0.0:8000")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Name and version advertised in `Via` and `Proxy-agent`
    #[serde(default)]
    pub agent: Agent,
    /// Prometheus metrics configuration
    #[serde(default)]
    pub metrics: Metrics,
    /// Optional span collector for request tracing
    #[serde(default)]
    pub tracing: Option<Tracing>,
    /// Diagnostic echo settings
    #[serde(default)]
    pub diagnostic: Diagnostic,
}

/// Identification string for the proxy itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_agent_version")]
    pub version: String,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind metrics HTTP server (e.g., "127.0.0.1:9000")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// External span collector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tracing {
    /// Collector endpoint, e.g. "kafka://broker:9092/zipkin"
    pub collector: String,
}

/// Diagnostic responder settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// JSON-escape echoed values. Off by default: values are echoed raw.
    #[serde(default)]
    pub escape_values: bool,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_agent_name() -> String {
    "simple_proxy".to_string()
}

fn default_agent_version() -> String {
    "1.0".to_string()
}

fn default_metrics_address() -> String {
    "127.0.0.1:9000".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            agent: Agent::default(),
            metrics: Metrics::default(),
            tracing: None,
            diagnostic: Diagnostic::default(),
        }
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            version: default_agent_version(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Yaml(serde_yaml_ng::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config: {}", e),
            ConfigError::Yaml(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Yaml(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml_ng::Error> for ConfigError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

impl Config {
    /// Loads configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use simple_proxy_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parses configuration from a YAML string.
    ///
    /// Blank input yields [`Config::default`].
    ///
    /// # Examples
    ///
    /// ```
    /// use simple_proxy_config::Config;
    ///
    /// let yaml = r#"
    /// listen_addr: "127.0.0.1:3128"
    /// metrics:
    ///   enabled: true
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.listen_addr, "127.0.0.1:3128");
    /// assert_eq!(config.metrics.address, "127.0.0.1:9000");
    /// ```
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = serde_yaml_ng::from_str(contents)?;
        Ok(config)
    }

    /// Checks values that serde cannot: socket addresses, the agent token
    /// and the collector URI.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_socket_addr()?;

        if self.metrics.enabled {
            self.metrics
                .address
                .parse::<SocketAddr>()
                .map_err(|e| {
                    ConfigError::Invalid(format!(
                        "metrics.address '{}': {}",
                        self.metrics.address, e
                    ))
                })?;
        }

        for (field, value) in [
            ("agent.name", &self.agent.name),
            ("agent.version", &self.agent.version),
        ] {
            if value.is_empty() || !value.chars().all(is_token_char) {
                return Err(ConfigError::Invalid(format!(
                    "{} '{}' must be a non-empty token",
                    field, value
                )));
            }
        }

        if let Some(ref tracing) = self.tracing {
            CollectorUri::parse(&tracing.collector)?;
        }

        Ok(())
    }

    /// The listen address as a socket address.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr.parse().map_err(|e| {
            ConfigError::Invalid(format!("listen_addr '{}': {}", self.listen_addr, e))
        })
    }

    /// Replaces the port of `listen_addr`, keeping the bind IP.
    pub fn set_listen_port(&mut self, port: u16) -> Result<(), ConfigError> {
        let mut addr = self.listen_socket_addr()?;
        addr.set_port(port);
        self.listen_addr = addr.to_string();
        Ok(())
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_graphic() && !matches!(c, '(' | ')' | '/' | '"' | ',' | ';')
}

/// Location of the span collector, split the way a Kafka producer wants it:
/// a broker address and a topic taken from the first path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorUri {
    pub scheme: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub topic: Option<String>,
}

impl CollectorUri {
    /// Parses `[scheme://]host[:port][/topic[/...]]`.
    ///
    /// # Examples
    ///
    /// ```
    /// use simple_proxy_config::CollectorUri;
    ///
    /// let uri = CollectorUri::parse("kafka://localhost:9092/zipkin").unwrap();
    /// assert_eq!(uri.broker(), "localhost:9092");
    /// assert_eq!(uri.topic.as_deref(), Some("zipkin"));
    /// ```
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let invalid = |why: &str| ConfigError::Invalid(format!("collector '{}': {}", uri, why));

        let (scheme, rest) = match uri.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() => (Some(scheme.to_string()), rest),
            Some(_) => return Err(invalid("empty scheme")),
            None => (None, uri),
        };

        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, ""),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p.parse::<u16>().map_err(|_| invalid("bad port"))?),
                None if tail.is_empty() => None,
                None => return Err(invalid("garbage after IPv6 literal")),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, p)) => (host, Some(p.parse::<u16>().map_err(|_| invalid("bad port"))?)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let topic = path
            .split('/')
            .find(|segment| !segment.is_empty())
            .map(str::to_string);

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            topic,
        })
    }

    /// `host:port`, or just `host` when no port was given.
    pub fn broker(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }
}
