//! gsg - copy, sync and lock objects across cloud buckets and local disk

use anyhow::Context as _;
use clap::Parser;
use gsg::cli::{Cli, Commands, ConfigArgs, GlobalArgs};
use gsg::config::Config;
use gsg::context::Context;
use gsg::locator::Locator;
use gsg::ops::{self, CopyOptions};
use gsg::sync::SyncOptions;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose, cli.global.json);

    if let Commands::Config(args) = &cli.command {
        return handle_config_command(args, &cli.global);
    }

    let config = cli.global.to_config()?;
    let retry = cli.global.read_retry(&config)?;
    let ctx = Context::new(config);

    // Only the lock wait traps Ctrl+C; other commands keep the default SIGINT exit
    let cancel = CancellationToken::new();
    if cli.command.traps_interrupt() {
        setup_shutdown_handler(cancel.clone());
    }

    let result = run(&ctx, cli.command, &retry, &cancel).await;
    ctx.finish(result).await?;
    Ok(())
}

async fn run(
    ctx: &Context,
    command: Commands,
    retry: &gsg::retry::RetryConfig,
    cancel: &CancellationToken,
) -> gsg::Result<()> {
    match command {
        Commands::Ls(args) => {
            let loc = Locator::parse(&args.target)?;
            let entries = ops::ls(ctx, &loc, args.recursive, retry).await?;
            print_lines(ctx, ops::format_listing(&entries));
        }

        Commands::Stat(args) => {
            let loc = Locator::parse(&args.target)?;
            let attrs = ops::stat(ctx, &loc, retry).await?;
            let crc = attrs.checksum.value().await?;
            print_lines(ctx, ops::format_stat(&loc, &attrs, crc));
        }

        Commands::Hash(args) => {
            let loc = Locator::parse(&args.target)?;
            let crc = ops::hash(ctx, &loc, retry).await?;
            print_lines(ctx, vec![format!("{:08x}  {}", crc, loc)]);
        }

        Commands::Cat(args) => {
            let loc = Locator::parse(&args.target)?;
            let data = ops::cat(ctx, &loc, retry).await?;
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&data)
                .and_then(|_| stdout.flush())
                .map_err(|e| gsg::Error::io("writing to stdout", e))?;
        }

        Commands::Cp(args) => {
            let (sources, dst) = split_paths(&args.paths)?;
            let options = CopyOptions {
                recursive: args.recursive,
                force_checksum: args.checksum,
            };
            let items = ops::cp(ctx, &sources, &dst, options).await?;
            if args.verbose {
                print_lines(ctx, items.iter().map(|i| format!("{} -> {}", i.src, i.dst)).collect());
            }
        }

        Commands::Mv(args) => {
            let (sources, dst) = split_paths(&args.paths)?;
            let options = CopyOptions {
                recursive: args.recursive,
                force_checksum: args.checksum,
            };
            let items = ops::mv(ctx, &sources, &dst, options).await?;
            if args.verbose {
                print_lines(ctx, items.iter().map(|i| format!("{} -> {}", i.src, i.dst)).collect());
            }
        }

        Commands::Rm(args) => {
            let loc = Locator::parse(&args.target)?;
            let removed = ops::rm(ctx, &loc, args.recursive).await?;
            tracing::info!(count = removed.len(), "Removed");
        }

        Commands::Du(args) => {
            let loc = Locator::parse(&args.target)?;
            let usage = ops::du(ctx, &loc, retry).await?;
            print_lines(ctx, ops::format_usage(&loc, &usage, args.human, args.summarize));
        }

        Commands::Rsync(args) => {
            let src = Locator::parse(&args.source)?;
            let dst = Locator::parse(&args.destination)?;
            let options = SyncOptions {
                recursive: args.recursive,
                delete: args.delete,
                force_checksum: args.checksum,
            };
            let report = ops::rsync(ctx, &src, &dst, options).await?;
            if args.verbose {
                let mut lines: Vec<String> =
                    report.copied.iter().map(|p| format!("copy   {}", p)).collect();
                lines.extend(report.deleted.iter().map(|p| format!("delete {}", p)));
                print_lines(ctx, lines);
            }
            tracing::info!(
                copied = report.copied.len(),
                deleted = report.deleted.len(),
                unchanged = report.unchanged,
                bytes = report.bytes,
                "Sync completed successfully"
            );
        }

        Commands::Lock(args) => {
            let loc = Locator::parse(&args.target)?;
            let ttl = Duration::from_secs(args.ttl.unwrap_or(ctx.config.lock_ttl_secs));
            let token = ops::lock(ctx, &loc, ttl, cancel).await?;
            print_lines(ctx, vec![token.to_string()]);
        }

        Commands::Unlock(args) => {
            let loc = Locator::parse(&args.target)?;
            ops::unlock(ctx, &loc).await?;
        }

        Commands::Config(_) => {}
    }
    Ok(())
}

fn split_paths(paths: &[String]) -> gsg::Result<(Vec<Locator>, Locator)> {
    let Some((dst, sources)) = paths.split_last() else {
        return Err(gsg::Error::config("missing destination"));
    };
    let sources = sources
        .iter()
        .map(|s| Locator::parse(s))
        .collect::<gsg::Result<Vec<_>>>()?;
    Ok((sources, Locator::parse(dst)?))
}

fn print_lines(ctx: &Context, lines: Vec<String>) {
    for line in lines {
        ctx.progress.println(&line);
    }
}

fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::new("gsg=info"),
        1 => EnvFilter::new("gsg=debug"),
        _ => EnvFilter::new("gsg=trace"),
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

fn setup_shutdown_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Received Ctrl+C, giving up on the lock");
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    });
}

fn handle_config_command(args: &ConfigArgs, global: &GlobalArgs) -> anyhow::Result<()> {
    let path = match &global.config {
        Some(path) => path.clone(),
        None => Config::default_config_path()?,
    };

    if args.path {
        println!("{}", path.display());
    } else if args.init {
        Config::default()
            .save_to(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Created default configuration at {}", path.display());
    } else {
        let config = global.to_config()?;
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}
