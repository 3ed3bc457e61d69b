//! Rewind CLI

use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context as _;
use rewind::config::Config;
use rewind::proxy::ProxyServer;
use rewind::storage::Archive;
use tracing_subscriber::EnvFilter;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Rewind v{}", env!("CARGO_PKG_VERSION"));
        eprintln!();
        eprintln!("Usage: rewind <command> <path>");
        eprintln!();
        eprintln!("Commands:");
        eprintln!("  serve <config.toml>   Start the proxy");
        eprintln!("  inspect <archive>     List stored transactions");
        process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = PathBuf::from(&args[2]);
    let result = match args[1].as_str() {
        "serve" => serve(&path),
        "inspect" => inspect(&path),
        command => {
            eprintln!("Unknown command: {command}");
            eprintln!("Run 'rewind' for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn serve(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let server = ProxyServer::new(config).context("building proxy")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting runtime")?;
    runtime.block_on(server.run())?;
    Ok(())
}

fn inspect(archive: &Path) -> anyhow::Result<()> {
    let entries = Archive::inspect(archive)
        .with_context(|| format!("reading {}", archive.display()))?;

    println!("Archive: {}", archive.display());
    println!("Entries: {}", entries.len());

    let mut current_bucket: Option<&str> = None;
    for entry in &entries {
        if current_bucket != Some(entry.bucket.as_str()) {
            println!();
            println!("[{}]", entry.bucket);
            current_bucket = Some(entry.bucket.as_str());
        }

        let placement = match entry.blob {
            Some(id) => format!("blob {id}"),
            None => "inline".to_string(),
        };
        println!(
            "  {}  {}  {:>10} bytes  {}",
            entry.key, entry.status, entry.body_len, placement
        );
    }

    Ok(())
}
