use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::env;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(author, version, about = "Portable blob storage: read, write and list buckets by URL")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read the blob <KEY> from <BUCKET_URL> and write it to stdout.
    Download { bucket_url: String, key: String },

    /// List the blobs in <BUCKET_URL>, one key per line.
    Ls {
        /// Prefix to match
        #[arg(short = 'p', long, default_value = "")]
        prefix: String,

        /// Directory delimiter; an empty string returns a flattened listing
        #[arg(short = 'd', long, default_value = "/")]
        delimiter: String,

        bucket_url: String,
    },

    /// Read from stdin and write to the blob <KEY> in <BUCKET_URL>.
    Upload { bucket_url: String, key: String },

    /// Serve a bucket over HTTP.
    Serve(ServeArgs),
}

/// Flags for `serve`; each falls back to an environment variable.
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Host to bind to (overrides BLOBPORT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BLOBPORT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Bucket to serve (overrides BLOBPORT_BUCKET_URL)
    pub bucket_url: Option<String>,
}

/// Resolved configuration for the HTTP gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeConfig {
    pub host: String,
    pub port: u16,
    pub bucket_url: String,
}

impl ServeConfig {
    /// Merge CLI args over environment variables.
    pub fn from_env_and_args(args: ServeArgs) -> Result<Self> {
        Self::merge(args, |name| env::var(name))
    }

    fn merge<F>(args: ServeArgs, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        // --- Environment fallback ---
        let env_host = lookup("BLOBPORT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match lookup("BLOBPORT_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing BLOBPORT_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading BLOBPORT_PORT"),
        };
        let env_bucket = lookup("BLOBPORT_BUCKET_URL").unwrap_or_else(|_| "mem://".into());

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            bucket_url: args.bucket_url.unwrap_or(env_bucket),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, env::VarError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn defaults_apply_without_env_or_args() {
        let cfg = ServeConfig::merge(ServeArgs::default(), lookup(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.bucket_url, "mem://");
    }

    #[test]
    fn args_override_env() {
        let vars = lookup(&[("BLOBPORT_PORT", "8080"), ("BLOBPORT_HOST", "10.0.0.1")]);
        let args = ServeArgs {
            port: Some(9000),
            bucket_url: Some("file:///srv/blobs".into()),
            ..Default::default()
        };
        let cfg = ServeConfig::merge(args, vars).unwrap();
        assert_eq!(cfg.addr(), "10.0.0.1:9000");
        assert_eq!(cfg.bucket_url, "file:///srv/blobs");
    }

    #[test]
    fn bad_port_is_an_error() {
        let err = ServeConfig::merge(ServeArgs::default(), lookup(&[("BLOBPORT_PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("BLOBPORT_PORT"));
    }

    #[test]
    fn cli_parses_ls_defaults() {
        let cli = Cli::try_parse_from(["blobport", "ls", "mem://"]).unwrap();
        match cli.command {
            Command::Ls {
                prefix,
                delimiter,
                bucket_url,
            } => {
                assert_eq!(prefix, "");
                assert_eq!(delimiter, "/");
                assert_eq!(bucket_url, "mem://");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_rejects_missing_key() {
        assert!(Cli::try_parse_from(["blobport", "download", "mem://"]).is_err());
    }
}
