//! credcache - inspect and maintain the secure file cache
//!
//! Operates on the cache directory from `CREDCACHE_DIR` or the per-user default.

use std::env;
use std::io::{self, Read, Write};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use credential_cache::filecache::{CacheValue, SecureFileCache};
use credential_cache::FileCacheOptions;

/// CLI command
#[derive(Debug)]
enum Command {
    /// Print the file backing an entry
    Path { bucket: String, key_id: String },
    /// Write an entry's payload to stdout
    Read { bucket: String, key_id: String },
    /// Store stdin as an entry's payload
    Write {
        bucket: String,
        key_id: String,
        ttl: Duration,
        refresh_in: Option<Duration>,
    },
    /// Delete an entry
    Remove { bucket: String, key_id: String },
    /// Delete leftover temp files
    Cleanup,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"credcache - Inspect the secure credential file cache

USAGE:
    credcache path <bucket> <key_id>
    credcache read <bucket> <key_id>
    credcache write <bucket> <key_id> <ttl_secs> [refresh_in_secs]   < payload
    credcache remove <bucket> <key_id>
    credcache cleanup
    credcache help

COMMANDS:
    path     Print the file that stores an entry
    read     Write a non-expired payload to stdout (exit code 1 on miss)
    write    Store stdin as the payload, expiring after ttl_secs
    remove   Delete an entry
    cleanup  Delete temp files left by interrupted writes
    help     Show this help message

ENVIRONMENT:
    CREDCACHE_DIR                 Cache directory (default: per-user profile location)
    CREDCACHE_LOCK_TIMEOUT_SECS   Cross-process refresh lock timeout
    CREDCACHE_EXPIRY_SKEW_SECS    Safety margin before expiry
    RUST_LOG                      Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_secs(raw: &str, what: &str) -> Result<Duration> {
    raw.parse::<u64>()
        .map(Duration::from_secs)
        .with_context(|| format!("Invalid {}: {:?}", what, raw))
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some(command) = args.get(1) else {
        return Ok(Command::Help);
    };

    let entry = || -> Result<(String, String)> {
        match (args.get(2), args.get(3)) {
            (Some(bucket), Some(key_id)) => Ok((bucket.clone(), key_id.clone())),
            _ => Err(anyhow!("Usage: credcache {} <bucket> <key_id>", command)),
        }
    };

    match command.as_str() {
        "path" => {
            let (bucket, key_id) = entry()?;
            Ok(Command::Path { bucket, key_id })
        }
        "read" => {
            let (bucket, key_id) = entry()?;
            Ok(Command::Read { bucket, key_id })
        }
        "write" => {
            let (bucket, key_id) = entry()?;
            let ttl = args
                .get(4)
                .ok_or_else(|| anyhow!("Usage: credcache write <bucket> <key_id> <ttl_secs> [refresh_in_secs]"))
                .and_then(|raw| parse_secs(raw, "ttl_secs"))?;
            let refresh_in = args
                .get(5)
                .map(|raw| parse_secs(raw, "refresh_in_secs"))
                .transpose()?;
            Ok(Command::Write {
                bucket,
                key_id,
                ttl,
                refresh_in,
            })
        }
        "remove" => {
            let (bucket, key_id) = entry()?;
            Ok(Command::Remove { bucket, key_id })
        }
        "cleanup" => Ok(Command::Cleanup),
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", command);
            Ok(Command::Help)
        }
    }
}

fn run(command: Command) -> Result<()> {
    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let cache = SecureFileCache::new(FileCacheOptions::from_env())
        .context("Failed to open the file cache")?;

    match command {
        Command::Path { bucket, key_id } => {
            println!("{}", cache.path_for(&bucket, &key_id).display());
        }
        Command::Read { bucket, key_id } => match cache.try_read(&bucket, &key_id) {
            Some(payload) => {
                io::stdout()
                    .write_all(&payload)
                    .context("Failed to write payload to stdout")?;
            }
            None => {
                eprintln!("No valid entry for {}/{}", bucket, key_id);
                std::process::exit(1);
            }
        },
        Command::Write {
            bucket,
            key_id,
            ttl,
            refresh_in,
        } => {
            let mut payload = Vec::new();
            io::stdin()
                .read_to_end(&mut payload)
                .context("Failed to read payload from stdin")?;

            let mut value = CacheValue::expiring_in(payload, ttl);
            if let Some(refresh_in) = refresh_in {
                value = value.refresh_in(refresh_in);
            }
            cache
                .write(&bucket, &key_id, &value)
                .with_context(|| format!("Failed to write {}/{}", bucket, key_id))?;
            info!(bucket = %bucket, size = value.payload.len(), "Entry written");
        }
        Command::Remove { bucket, key_id } => {
            if cache.remove(&bucket, &key_id)? {
                println!("Removed {}/{}", bucket, key_id);
            } else {
                println!("No entry for {}/{}", bucket, key_id);
            }
        }
        Command::Cleanup => {
            let removed = cache.cleanup(Duration::ZERO);
            println!("Removed {} temp file(s) from {}", removed, cache.base_directory().display());
        }
        Command::Help => print_help(),
    }

    Ok(())
}

fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::WARN);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = env::args().collect();
    let command = match parse_args(&args) {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    run(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        std::iter::once("credcache")
            .chain(raw.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_parse_write() {
        match parse_args(&args(&["write", "pop", "key-1", "3600", "1800"])).unwrap() {
            Command::Write {
                bucket,
                key_id,
                ttl,
                refresh_in,
            } => {
                assert_eq!(bucket, "pop");
                assert_eq!(key_id, "key-1");
                assert_eq!(ttl, Duration::from_secs(3600));
                assert_eq!(refresh_in, Some(Duration::from_secs(1800)));
            }
            other => panic!("Expected Write, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&["read", "pop"])).is_err());
        assert!(parse_args(&args(&["write", "pop", "key-1", "soon"])).is_err());
        assert!(matches!(parse_args(&args(&[])).unwrap(), Command::Help));
        assert!(matches!(parse_args(&args(&["bogus"])).unwrap(), Command::Help));
    }
}
