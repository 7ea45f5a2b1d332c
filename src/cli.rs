//! Command Line Interface (CLI) arguments.

use crate::error::DmrppError;

use byte_unit::Byte;
use clap::Parser;
use expanduser::expanduser;
use std::path::PathBuf;

/// dmrpp-store command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// The IP address on which the server should listen
    #[arg(long, default_value = "0.0.0.0", env = "DMRPP_STORE_HOST")]
    pub host: String,
    /// The port to which the server should bind
    #[arg(long, default_value_t = 8080, env = "DMRPP_STORE_PORT")]
    pub port: u16,
    /// Flag indicating whether HTTPS should be used
    #[arg(long, default_value_t = false, env = "DMRPP_STORE_HTTPS")]
    pub https: bool,
    /// Path to the certificate file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/dmrpp-store/certs/cert.pem",
        env = "DMRPP_STORE_CERT_FILE"
    )]
    pub cert_file: String,
    /// Path to the key file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/dmrpp-store/certs/key.pem",
        env = "DMRPP_STORE_KEY_FILE"
    )]
    pub key_file: String,
    /// Maximum time in seconds to wait for operations to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "DMRPP_STORE_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Whether to enable sending traces to Jaeger.
    #[arg(long, default_value_t = false, env = "DMRPP_STORE_ENABLE_JAEGER")]
    pub enable_jaeger: bool,
    /// Whether to use Rayon for decoding chunks.
    #[arg(long, default_value_t = false, env = "DMRPP_STORE_USE_RAYON")]
    pub use_rayon: bool,
    /// Directory of the manifest store
    #[arg(long, default_value = "~/.cache/dmrpp-store", env = "DMRPP_STORE_STORE_PATH")]
    pub store_path: String,
    /// Maximum total size of stored manifests, e.g. "512MB"
    #[arg(long, env = "DMRPP_STORE_STORE_SIZE_LIMIT", value_parser = parse_size)]
    pub store_size_limit: Option<u64>,
    /// File name of the manifest store ledger
    #[arg(long, default_value = "ledger.txt", env = "DMRPP_STORE_LEDGER_NAME")]
    pub ledger_name: String,
    /// Maximum number of concurrent byte range fetches
    #[arg(long, env = "DMRPP_STORE_FETCH_CONNECTION_LIMIT")]
    pub fetch_connection_limit: Option<usize>,
    /// Memory limit in bytes for decoded chunks
    #[arg(long, env = "DMRPP_STORE_MEMORY_LIMIT")]
    pub memory_limit: Option<usize>,
    /// Maximum number of chunk decode tasks. Defaults to one less than the number of CPUs.
    #[arg(long, env = "DMRPP_STORE_THREAD_LIMIT")]
    pub thread_limit: Option<usize>,
    /// Directory holding the local files manifests may refer to. Local sources are refused
    /// when unset.
    #[arg(long, env = "DMRPP_STORE_LOCAL_ROOT")]
    pub local_root: Option<String>,
    /// Whether to fetch `http://` and `https://` sources
    #[arg(long, default_value_t = false, env = "DMRPP_STORE_ENABLE_HTTP_SOURCES")]
    pub enable_http_sources: bool,
    /// Username sent with requests to HTTP sources
    #[arg(long, env = "DMRPP_STORE_HTTP_USERNAME")]
    pub http_username: Option<String>,
    /// Password sent with requests to HTTP sources
    #[arg(long, default_value = "", env = "DMRPP_STORE_HTTP_PASSWORD", hide_env_values = true)]
    pub http_password: String,
    /// Endpoint of the S3 service serving `s3://` sources
    #[arg(long, env = "DMRPP_STORE_S3_ENDPOINT")]
    pub s3_endpoint: Option<url::Url>,
    /// S3 access key
    #[arg(long, default_value = "", env = "DMRPP_STORE_S3_ACCESS_KEY")]
    pub s3_access_key: String,
    /// S3 secret key
    #[arg(long, default_value = "", env = "DMRPP_STORE_S3_SECRET_KEY", hide_env_values = true)]
    pub s3_secret_key: String,
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}

/// Build a DMR++ manifest for an HDF4 or HDF5 file
#[derive(Clone, Debug, Parser)]
#[command(name = "build-dmrpp")]
pub struct BuildArgs {
    /// Source HDF4 or HDF5 file
    pub source: String,
    /// JSON descriptor of the source's variables and attributes
    #[arg(long)]
    pub descriptor: String,
    /// JSON inventory of the source's storage layout
    #[arg(long)]
    pub layout: String,
    /// Write the manifest to this path
    #[arg(long)]
    pub output: Option<String>,
    /// Store the manifest in the manifest store at this directory
    #[arg(long)]
    pub store_path: Option<String>,
    /// Logical name of the manifest in the store. Defaults to the source path.
    #[arg(long)]
    pub name: Option<String>,
    /// Skip variables whose values would be synthesized
    #[arg(long, default_value_t = false)]
    pub no_synthesis: bool,
    /// Do not record declared fill values
    #[arg(long, default_value_t = false)]
    pub no_fill_values: bool,
    /// Record build provenance in the manifest
    #[arg(long, default_value_t = false)]
    pub provenance: bool,
    /// Fail the build if this variable cannot be built
    #[arg(long = "require")]
    pub required: Vec<String>,
    /// Identifier recorded in the manifest for later byte range fetches
    #[arg(long)]
    pub source_identifier: Option<String>,
    /// Build variables in parallel
    #[arg(long, default_value_t = false)]
    pub parallel: bool,
}

/// Expand a leading `~` in a path.
///
/// # Arguments
///
/// * `path`: Path as given on the command line
pub fn expand_path(path: &str) -> Result<PathBuf, DmrppError> {
    Ok(expanduser(path)?)
}

/// Parse a human readable size such as `512MB` into bytes.
///
/// # Arguments
///
/// * `size`: Size with an optional unit, case insensitive
pub fn parse_size(size: &str) -> Result<u64, String> {
    Byte::parse_str(size, true)
        .map(|bytes| bytes.as_u64())
        .map_err(|err| format!("invalid size {}: {}", size, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let args = CommandLineArgs::parse_from(["dmrpp-store"]);
        assert_eq!(8080, args.port);
        assert_eq!("ledger.txt", args.ledger_name);
        assert!(args.store_size_limit.is_none());
        assert!(args.s3_endpoint.is_none());
        assert!(args.local_root.is_none());
        assert!(!args.enable_http_sources);
    }

    #[test]
    fn server_sources() {
        let args = CommandLineArgs::parse_from([
            "dmrpp-store",
            "--local-root",
            "/data",
            "--enable-http-sources",
            "--http-username",
            "user",
        ]);
        assert_eq!(Some("/data".to_string()), args.local_root);
        assert!(args.enable_http_sources);
        assert_eq!(Some("user".to_string()), args.http_username);
    }

    #[test]
    fn server_size_limit() {
        let args = CommandLineArgs::parse_from(["dmrpp-store", "--store-size-limit", "2 MiB"]);
        assert_eq!(Some(2 * 1024 * 1024), args.store_size_limit);
        assert!(CommandLineArgs::try_parse_from(["dmrpp-store", "--store-size-limit", "x"]).is_err());
    }

    #[test]
    fn build_args() {
        let args = BuildArgs::parse_from([
            "build-dmrpp",
            "granule.h5",
            "--descriptor",
            "granule.json",
            "--layout",
            "granule.layout.json",
            "--require",
            "/lat",
            "--require",
            "/lon",
            "--no-synthesis",
            "--provenance",
        ]);
        assert_eq!("granule.h5", args.source);
        assert_eq!(vec!["/lat", "/lon"], args.required);
        assert!(args.no_synthesis);
        assert!(args.provenance);
        assert!(!args.parallel);
        assert!(args.output.is_none());
    }

    #[test]
    fn sizes() {
        assert_eq!(512_000_000, parse_size("512MB").unwrap());
        assert_eq!(1024, parse_size("1 KiB").unwrap());
        assert_eq!(100, parse_size("100").unwrap());
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn expands_home() {
        assert!(!expand_path("~/store").unwrap().starts_with("~"));
        assert_eq!(PathBuf::from("/data/store"), expand_path("/data/store").unwrap());
    }
}
