use anyhow::{Context, Result};
use blobport::{
    ListOptions, UrlMux, WriterOptions,
    config::{Cli, Command, ServeConfig},
    server,
};
use clap::Parser;
use std::{
    io::{self, Write},
    process::ExitCode,
};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    // clap exits with status 2 on usage errors
    let cli = Cli::parse();
    let mux = UrlMux::with_default_drivers();

    match run(cli.command, &mux) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, mux: &UrlMux) -> Result<()> {
    match command {
        Command::Download { bucket_url, key } => download(mux, &bucket_url, &key),
        Command::Ls {
            prefix,
            delimiter,
            bucket_url,
        } => ls(mux, &bucket_url, prefix, delimiter),
        Command::Upload { bucket_url, key } => upload(mux, &bucket_url, &key),
        Command::Serve(args) => {
            let cfg = ServeConfig::from_env_and_args(args)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("starting tokio runtime")?;
            runtime.block_on(server::run(cfg, mux))
        }
    }
}

fn download(mux: &UrlMux, bucket_url: &str, key: &str) -> Result<()> {
    let bucket = mux.open_bucket(bucket_url)?;
    let mut reader = bucket
        .new_reader(key, &Default::default())
        .with_context(|| format!("opening {key}"))?;

    let mut stdout = io::stdout().lock();
    let copied = io::copy(&mut reader, &mut stdout).with_context(|| format!("reading {key}"))?;
    stdout.flush()?;
    reader.close()?;

    tracing::debug!("Downloaded {} ({} bytes)", key, copied);
    bucket.close()?;
    Ok(())
}

fn ls(mux: &UrlMux, bucket_url: &str, prefix: String, delimiter: String) -> Result<()> {
    let bucket = mux.open_bucket(bucket_url)?;
    let opts = ListOptions::with_prefix(prefix).delimiter(delimiter);

    let mut stdout = io::stdout().lock();
    for obj in bucket.list(opts) {
        writeln!(stdout, "{}", obj?.key)?;
    }
    stdout.flush()?;
    bucket.close()?;
    Ok(())
}

fn upload(mux: &UrlMux, bucket_url: &str, key: &str) -> Result<()> {
    let bucket = mux.open_bucket(bucket_url)?;
    let mut writer = bucket
        .new_writer(key, WriterOptions::default())
        .with_context(|| format!("opening {key} for writing"))?;

    // dropping the writer on a failed copy discards the partial upload
    let copied = io::copy(&mut io::stdin().lock(), &mut writer)
        .with_context(|| format!("writing {key}"))?;
    writer.close().with_context(|| format!("committing {key}"))?;

    tracing::info!("Uploaded {} ({} bytes)", key, copied);
    bucket.close()?;
    Ok(())
}
