use crate::byte_range_fetcher::{FetcherRouter, LocalFileFetcher};
use crate::cli::{self, CommandLineArgs};
use crate::error::DmrppError;
use crate::http_client::HttpFetcher;
use crate::manifest_store::ManifestStore;
use crate::reader::PartialArrayReader;
use crate::resource_manager::ResourceManager;
use crate::s3_client::{S3Credentials, S3Fetcher};

use std::sync::Arc;

/// Shared application state passed to each request handler.
pub struct AppState {
    /// Command line arguments.
    pub args: CommandLineArgs,

    /// Partial array reader over local, S3 and HTTP sources.
    pub reader: PartialArrayReader<FetcherRouter>,

    /// Manifest store.
    pub store: ManifestStore,
}

impl AppState {
    /// Create and return an [AppState].
    pub fn new(args: &CommandLineArgs) -> Result<Self, DmrppError> {
        let task_limit = args
            .thread_limit
            .or_else(|| Some(num_cpus::get().saturating_sub(1).max(1)));
        let resource_manager = Arc::new(ResourceManager::new(
            args.fetch_connection_limit,
            args.memory_limit,
            task_limit,
        ));
        let s3 = args.s3_endpoint.clone().map(|endpoint| {
            let credentials = if args.s3_access_key.is_empty() {
                S3Credentials::None
            } else {
                S3Credentials::access_key(&args.s3_access_key, &args.s3_secret_key)
            };
            S3Fetcher::new(endpoint, credentials)
        });
        let local = args
            .local_root
            .as_deref()
            .map(|root| LocalFileFetcher::new(&cli::expand_path(root)?))
            .transpose()?;
        let http = args.enable_http_sources.then(|| match &args.http_username {
            Some(username) => HttpFetcher::new().with_basic_auth(username, &args.http_password),
            None => HttpFetcher::new(),
        });
        let fetcher = Arc::new(FetcherRouter::new(local, s3, http));
        let reader = PartialArrayReader::new(fetcher, resource_manager, args.use_rayon);

        let store = ManifestStore::open(
            &cli::expand_path(&args.store_path)?,
            args.store_size_limit,
            &args.ledger_name,
        )?;

        Ok(Self {
            args: args.clone(),
            reader,
            store,
        })
    }
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;
