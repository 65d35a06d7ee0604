//! Configuration for a pull-through gateway
//!
//! The best way to configure the gateway is by using [`Config::default_config`]
//! or by turning on the "cli" feature and using [`Config::new_from_flags`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[cfg(feature = "cli")]
use structopt::StructOpt;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_CACHE_SIZE: usize = 2048;

/// The configuration needed for a gateway to run properly.
///
/// This can be configured manually in your code or if you are exposing a CLI, use the
/// [`Config::new_from_flags`] (this requires the "cli" feature to
/// be enabled).
#[derive(Clone, Debug)]
pub struct Config {
    /// The HTTP server configuration
    pub server_config: ServerConfig,
    /// The directory where local content is stored
    pub data_dir: PathBuf,
    /// How many digest locations the gateway remembers
    pub cache_size: usize,
    /// Whether local misses are served from the origin registry
    pub pullthrough: bool,
    /// Username and password per origin registry host. Origins without an
    /// entry are accessed anonymously.
    pub upstream_auth: HashMap<String, (String, String)>,
}

/// The configuration for the gateway's HTTP server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// The ip address the server listens on
    pub addr: IpAddr,
    /// The port the server listens on
    pub port: u16,
    /// Path to the TLS certificate. The server speaks plain HTTP unless both
    /// files are set.
    pub tls_cert_file: Option<PathBuf>,
    /// Path to the TLS private key.
    pub tls_private_key_file: Option<PathBuf>,
}

impl ServerConfig {
    /// The certificate and key paths, when TLS is configured.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert_file, &self.tls_private_key_file) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

impl Config {
    /// Returns a Config object set with all of the defaults.
    pub fn default_config() -> anyhow::Result<Self> {
        Ok(Config {
            server_config: ServerConfig {
                addr: IpAddr::from([0, 0, 0, 0]),
                port: DEFAULT_PORT,
                tls_cert_file: None,
                tls_private_key_file: None,
            },
            data_dir: default_data_dir()?,
            cache_size: DEFAULT_CACHE_SIZE,
            pullthrough: true,
            upstream_auth: HashMap::new(),
        })
    }

    /// Parses all command line flags and sets the proper defaults. The version
    /// of your application should be passed to set the proper version for the CLI
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn new_from_flags(version: &str) -> anyhow::Result<Self> {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        Self::from_opts(opts)
    }

    #[cfg(any(feature = "cli", feature = "docs"))]
    fn from_opts(opts: Opts) -> anyhow::Result<Self> {
        let data_dir = match opts.data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };

        Ok(Config {
            server_config: ServerConfig {
                addr: opts.addr,
                port: opts.port,
                tls_cert_file: opts.tls_cert_file,
                tls_private_key_file: opts.tls_private_key_file,
            },
            data_dir,
            cache_size: opts.cache_size,
            pullthrough: opts.pullthrough,
            upstream_auth: opts.upstream_auth.into_iter().collect(),
        })
    }
}

/// CLI options that can be configured for the gateway
///
/// These can be parsed from args using `Opts::into_app()`
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "pullthrough-gateway",
    about = "A registry gateway serving images from their origin registries"
)]
pub struct Opts {
    #[structopt(
        short = "a",
        long = "addr",
        default_value = "0.0.0.0",
        env = "PULLTHROUGH_ADDRESS",
        help = "The address the gateway should listen on"
    )]
    addr: IpAddr,

    #[structopt(
        short = "p",
        long = "port",
        default_value = "5000",
        env = "PULLTHROUGH_PORT",
        help = "The port the gateway should listen on"
    )]
    port: u16,

    #[structopt(
        long = "data-dir",
        env = "PULLTHROUGH_DATA_DIR",
        help = "The directory holding locally stored manifests and blobs. Defaults to $HOME/.pullthrough"
    )]
    data_dir: Option<PathBuf>,

    #[structopt(
        long = "cache-size",
        default_value = "2048",
        env = "PULLTHROUGH_CACHE_SIZE",
        help = "How many digests to remember the origin repository of. Must be at least 1"
    )]
    cache_size: usize,

    #[structopt(
        long = "pullthrough",
        default_value = "true",
        env = "PULLTHROUGH_ENABLED",
        parse(try_from_str),
        help = "Whether content missing locally is fetched from its origin registry"
    )]
    pullthrough: bool,

    #[structopt(
        long = "upstream-auth",
        env = "PULLTHROUGH_UPSTREAM_AUTH",
        hide_env_values = true,
        use_delimiter = true,
        number_of_values = 1,
        parse(try_from_str = parse_upstream_auth),
        help = "Credentials for one origin registry as REGISTRY=USERNAME:PASSWORD. May be repeated; the environment variable takes a comma separated list"
    )]
    upstream_auth: Vec<(String, (String, String))>,

    #[structopt(
        long = "tls-cert-file",
        env = "TLS_CERT_FILE",
        help = "The path to the TLS certificate. TLS is only enabled when the key is set too"
    )]
    tls_cert_file: Option<PathBuf>,

    #[structopt(
        long = "tls-private-key-file",
        env = "TLS_PRIVATE_KEY_FILE",
        help = "The path to the TLS private key"
    )]
    tls_private_key_file: Option<PathBuf>,
}

#[cfg(any(feature = "cli", feature = "docs"))]
fn parse_upstream_auth(value: &str) -> anyhow::Result<(String, (String, String))> {
    let (registry, credentials) = value
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected REGISTRY=USERNAME:PASSWORD"))?;
    let (username, password) = credentials
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected USERNAME:PASSWORD for {}", registry))?;
    if registry.is_empty() || username.is_empty() {
        return Err(anyhow::anyhow!("registry and username must not be empty"));
    }
    Ok((
        registry.to_owned(),
        (username.to_owned(), password.to_owned()),
    ))
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    Ok(dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Unable to get home directory"))?
        .join(".pullthrough"))
}
