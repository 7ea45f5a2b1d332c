//! This file defines the build-dmrpp binary entry point.
//!
//! Builds the manifest of one HDF4 or HDF5 file from its inventory and writes it to a file,
//! to stdout, or into a manifest store.

use dmrpp_store::builder::{BuildOptions, StorageLayoutExtractor};
use dmrpp_store::cli::{expand_path, BuildArgs};
use dmrpp_store::error::DmrppError;
use dmrpp_store::inventory::InventorySource;
use dmrpp_store::manifest_store::{ManifestStore, DEFAULT_LEDGER_NAME};
use dmrpp_store::models::Provenance;
use dmrpp_store::tracing::init_cli_tracing;

use clap::Parser;
use std::error::Error;
use std::io::Write;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args = BuildArgs::parse();
    init_cli_tracing();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("build-dmrpp: {}", err);
            let mut current = err.source();
            while let Some(source) = current {
                eprintln!("  caused by: {}", source);
                current = source.source();
            }
            ExitCode::FAILURE
        }
    }
}

fn options(args: &BuildArgs) -> Result<BuildOptions, DmrppError> {
    let mut options = BuildOptions {
        capture_fill_values: !args.no_fill_values,
        synthesize_missing: !args.no_synthesis,
        provenance: None,
        required: args.required.clone(),
        source_identifier: args.source_identifier.clone(),
        parallel: args.parallel,
    };
    if args.provenance {
        let configuration = format!(
            "capture_fill_values={} synthesize_missing={} required={:?} parallel={}",
            options.capture_fill_values,
            options.synthesize_missing,
            options.required,
            options.parallel
        );
        let invocation = std::env::args().collect::<Vec<_>>().join(" ");
        options.provenance = Some(Provenance::now(&configuration, &invocation)?);
    }
    Ok(options)
}

fn run(args: &BuildArgs) -> Result<(), DmrppError> {
    let source = InventorySource::open(
        &expand_path(&args.source)?,
        &expand_path(&args.descriptor)?,
        &expand_path(&args.layout)?,
    )?;
    let outcome = StorageLayoutExtractor::new(options(args)?).build(&source)?;
    for failure in &outcome.failures {
        eprintln!("build-dmrpp: {}: {}", failure.variable, failure.error);
    }
    for skipped in &outcome.skipped {
        eprintln!("build-dmrpp: {}: skipped", skipped);
    }

    let manifest = outcome.manifest;
    let json = manifest.to_json()?;
    if let Some(output) = &args.output {
        let path = expand_path(output)?;
        std::fs::write(&path, &json)?;
        tracing::info!("wrote {}", path.display());
    }
    if let Some(store_path) = &args.store_path {
        let store = ManifestStore::open(&expand_path(store_path)?, None, DEFAULT_LEDGER_NAME)?;
        let name = args.name.as_deref().unwrap_or(&args.source);
        let outcome = tokio::runtime::Runtime::new()?.block_on(store.store(name, &manifest))?;
        tracing::info!("{}: {:?}", name, outcome);
    }
    if args.output.is_none() && args.store_path.is_none() {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&json)?;
        stdout.write_all(b"\n")?;
    }
    Ok(())
}
