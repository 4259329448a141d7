//! Command line and environment configuration
//!
//! Every option can be given as a flag or as an environment variable. A flag wins over the
//! environment, and an empty value is treated as if it were not given at all.

use std::ffi::OsString;

use amqp_ws_tunnel::ProxyTarget;
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::{error::ConfigError, settings::ProxyStrategy};

/// Environment variable holding the connection string
pub const CONNECTION_STRING_ENV: &str = "SERVICE_BUS_CONNECTION_STRING";

/// Environment variable holding the queue name
pub const QUEUE_NAME_ENV: &str = "QUEUE_NAME";

/// Environment variable holding the proxy hostname
pub const PROXY_HOSTNAME_ENV: &str = "PROXY_HOSTNAME";

/// Environment variable holding the proxy port
pub const PROXY_PORT_ENV: &str = "PROXY_PORT";

const CONNECTION_STRING: &str = "connectionString";
const QUEUE_NAME: &str = "queueName";
const PROXY_HOSTNAME: &str = "proxyHostname";
const PROXY_PORT: &str = "proxyPort";
const PROXY_SCOPE: &str = "proxyScope";

const BASE_USAGE: &str = "Run sample with either command line options -c connectionString -q queueName \
or with environment variables 'SERVICE_BUS_CONNECTION_STRING' and 'QUEUE_NAME' set";

const PROXY_USAGE: &str = "Run sample with either command line options -c connectionString -q queueName \
-h proxyHostname -p proxyPort or with environment variables 'SERVICE_BUS_CONNECTION_STRING', \
'QUEUE_NAME', 'PROXY_HOSTNAME', and 'PROXY_PORT' set";

/// The options a binary accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionSet {
    /// Connection string and queue name
    Base,

    /// [`OptionSet::Base`] plus a mandatory proxy hostname and port
    Proxy,
}

impl OptionSet {
    /// Whether the proxy options are part of this set
    pub fn has_proxy(&self) -> bool {
        matches!(self, OptionSet::Proxy)
    }

    fn command_name(&self) -> &'static str {
        match self {
            OptionSet::Base => "websocket_sample",
            OptionSet::Proxy => "proxy_sample",
        }
    }
}

/// Resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    connection_string: String,
    queue_name: String,
    proxy: Option<ProxyTarget>,
    proxy_strategy: ProxyStrategy,
}

impl Configuration {
    /// Raw connection string
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Name of the queue
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Proxy to route through, if any
    pub fn proxy(&self) -> Option<&ProxyTarget> {
        self.proxy.as_ref()
    }

    /// Where the proxy should be installed
    pub fn proxy_strategy(&self) -> ProxyStrategy {
        self.proxy_strategy
    }
}

/// Usage text printed when the configuration is incomplete
pub fn usage(set: OptionSet) -> &'static str {
    match set {
        OptionSet::Base => BASE_USAGE,
        OptionSet::Proxy => PROXY_USAGE,
    }
}

fn command(set: OptionSet) -> Command {
    let command = Command::new(set.command_name())
        .about(usage(set))
        .disable_help_flag(true)
        .arg(
            Arg::new("help")
                .long("help")
                .action(ArgAction::Help)
                .help("Print help"),
        )
        .arg(
            Arg::new(CONNECTION_STRING)
                .short('c')
                .value_name(CONNECTION_STRING)
                .help("Service Bus connection string"),
        )
        .arg(
            Arg::new(QUEUE_NAME)
                .short('q')
                .value_name(QUEUE_NAME)
                .help("Name of the queue"),
        );

    if !set.has_proxy() {
        return command;
    }

    command
        .arg(
            Arg::new(PROXY_HOSTNAME)
                .short('h')
                .value_name(PROXY_HOSTNAME)
                .help("Hostname of the HTTP proxy"),
        )
        .arg(
            Arg::new(PROXY_PORT)
                .short('p')
                .value_name(PROXY_PORT)
                .help("Port of the HTTP proxy"),
        )
        .arg(
            Arg::new(PROXY_SCOPE)
                .long("proxy-scope")
                .value_name("scope")
                .value_parser(["client", "process"])
                .default_value("client")
                .help("Route only the sample's clients (client) or the whole process (process) through the proxy"),
        )
}

/// Resolves the configuration from `args` (including the binary name) and the `env` lookup
pub fn resolve<I, T, E>(args: I, env: E, set: OptionSet) -> Result<Configuration, ConfigError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    E: Fn(&str) -> Option<String>,
{
    let matches = command(set).try_get_matches_from(args)?;
    let lookup = |id: &str, var: &str| {
        matches
            .get_one::<String>(id)
            .cloned()
            .filter(|value| !value.is_empty())
            .or_else(|| env(var).filter(|value| !value.is_empty()))
    };

    let mut missing = Vec::new();
    let connection_string = lookup(CONNECTION_STRING, CONNECTION_STRING_ENV);
    if connection_string.is_none() {
        missing.push(CONNECTION_STRING);
    }
    let queue_name = lookup(QUEUE_NAME, QUEUE_NAME_ENV);
    if queue_name.is_none() {
        missing.push(QUEUE_NAME);
    }

    let mut proxy = None;
    let mut proxy_strategy = ProxyStrategy::default();
    if set.has_proxy() {
        let hostname = lookup(PROXY_HOSTNAME, PROXY_HOSTNAME_ENV);
        let port = lookup(PROXY_PORT, PROXY_PORT_ENV)
            .map(|value| parse_port(&value))
            .transpose()?
            .flatten();
        if hostname.is_none() {
            missing.push(PROXY_HOSTNAME);
        }
        if port.is_none() {
            missing.push(PROXY_PORT);
        }
        if let (Some(hostname), Some(port)) = (hostname, port) {
            proxy = Some(ProxyTarget::new(hostname, port));
        }
        proxy_strategy = proxy_scope(&matches);
    }

    match (connection_string, queue_name) {
        (Some(connection_string), Some(queue_name)) if missing.is_empty() => Ok(Configuration {
            connection_string,
            queue_name,
            proxy,
            proxy_strategy,
        }),
        _ => Err(ConfigError::MissingConfiguration(missing)),
    }
}

/// `--proxy-scope` is restricted to known values by clap
fn proxy_scope(matches: &ArgMatches) -> ProxyStrategy {
    matches
        .get_one::<String>(PROXY_SCOPE)
        .and_then(|scope| scope.parse().ok())
        .unwrap_or_default()
}

/// Parses a proxy port. `0` means no port.
fn parse_port(value: &str) -> Result<Option<u16>, ConfigError> {
    let malformed = || ConfigError::MalformedNumericOption {
        option: PROXY_PORT,
        value: value.to_string(),
    };
    match value.trim().parse::<u32>().map_err(|_| malformed())? {
        0 => Ok(None),
        port => u16::try_from(port).map(Some).map_err(|_| malformed()),
    }
}
