//! This crate builds and serves DMR++-style chunk-map manifests for chunked HDF4 and HDF5 data.
//!
//! A manifest records, for every variable of a source file, the byte ranges where its chunks
//! live together with their filters, byte order and fill value. With a manifest in hand a
//! client can read any hyperslab of a variable by fetching only the chunks it intersects,
//! without opening the source file with its native library.
//!
//! The crate has three parts:
//!
//! * [builder] walks a [source::StorageSource] and produces a [models::Manifest]. The
//!   `build-dmrpp` binary drives it from a JSON inventory of the file ([inventory]).
//! * [manifest_store] keeps manifests on disk, keyed by a hash of their logical name, with
//!   per-name reader/writer locking, an audit ledger and size-limited LRU purging.
//! * [reader] resolves a hyperslab against a manifest, fetches the intersecting chunks through a
//!   [byte_range_fetcher::ByteRangeFetcher], reverses their [filters] and assembles the result.
//!
//! The `dmrpp-store` binary serves the store and the reader over HTTP.
//!
//! It is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [Axum](axum) web framework, built by the Tokio team, on top of the [hyper] HTTP library.
//! * [Serde](serde) performs (de)serialisation of manifests and request data.
//! * [AWS SDK for S3](aws-sdk-s3) is used to fetch byte ranges from S3-compatible object stores.
//! * [reqwest] fetches byte ranges from HTTP servers.
//! * [ndarray] provides the strided views used to place chunk data into the output buffer.
//! * [sled] holds the manifest store's index.

pub mod app;
pub mod app_state;
pub mod array;
pub mod builder;
pub mod byte_range_fetcher;
pub mod chunk_map;
pub mod cli;
pub mod compression;
pub mod error;
pub mod filter_pipeline;
pub mod filters;
pub mod http_client;
pub mod inventory;
pub mod manifest_store;
pub mod metrics;
pub mod models;
pub mod reader;
pub mod resource_manager;
pub mod s3_client;
pub mod server;
pub mod source;
pub mod synthesis;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod types;
pub mod validated_json;
