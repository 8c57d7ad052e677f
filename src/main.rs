mod config;
mod detector;
mod error;
mod ipc;
mod lifecycle;
mod prober;
mod quality;
mod router;
mod selector;
mod traits;
mod types;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::StatePaths;
use lifecycle::AUTO_QUIT_INTERVAL;
use prober::{ProbeHeaders, Prober};
use router::SmartMirror;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use traits::MirrorRouter;

#[derive(Parser)]
#[command(name = "smartmirror")]
#[command(about = "Route package downloads to the fastest reachable mirror", long_about = None)]
struct Cli {
    /// State directory holding mirrors.json and the smartmirror_* files
    /// (defaults to $STATE_DIRECTORY)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON-line requests on stdin/stdout (e.g. smartmirror serve --daemon)
    Serve {
        /// Never quit when idle
        #[arg(long)]
        daemon: bool,
    },
    /// Route one URL (e.g. smartmirror query <url> https://packages.example/)
    Query {
        /// The original download URL
        original: String,
        /// URL prefix of the official repository
        official: String,
        /// Mirror used while the service is disabled
        #[arg(default_value = "")]
        hint: String,
    },
    /// Turn smart routing on
    Enable,
    /// Turn smart routing off (queries use the mirror hint)
    Disable,
    /// Show the switch and the mirror ranking
    Status,
    /// Probe every known mirror for a path and record the results
    Check {
        /// Path below each mirror base (e.g. dists/stable/Release)
        path: String,
    },
    /// Compare one official URL with one mirror URL (exit code 1/2/3)
    Detect {
        official: String,
        mirror: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let paths = StatePaths::resolve(cli.state_dir);

    match cli.command {
        Commands::Serve { daemon } => handle_serve(&paths, daemon).await?,
        Commands::Query {
            original,
            official,
            hint,
        } => handle_query(&paths, &original, &official, &hint).await?,
        Commands::Enable => handle_set_enable(&paths, true).await?,
        Commands::Disable => handle_set_enable(&paths, false).await?,
        Commands::Status => handle_status(&paths).await?,
        Commands::Check { path } => handle_check(&paths, &path).await?,
        Commands::Detect { official, mirror } => handle_detect(&official, &mirror).await?,
    }

    Ok(())
}

/// 日志输出到 stderr, stdout 留给 serve 的响应
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("smartmirror={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn load_service(paths: &StatePaths) -> Result<SmartMirror> {
    let prober = Prober::new(ProbeHeaders::detect())?;
    Ok(SmartMirror::load(paths, prober).await?)
}

// --- Handlers ---

async fn handle_serve(paths: &StatePaths, daemon: bool) -> Result<()> {
    let service = Arc::new(load_service(paths).await?);
    info!("Starting smartmirror service (daemon={})", daemon);

    let idle = {
        let service = service.clone();
        async move {
            if daemon {
                std::future::pending::<()>().await;
            } else {
                service.lifecycle().wait_idle(AUTO_QUIT_INTERVAL).await;
            }
        }
    };

    ipc::serve(service.clone(), tokio::io::stdin(), tokio::io::stdout(), idle).await?;

    // 退出前等待后台探测结果落盘
    if !service.can_quit() {
        info!("Waiting for {} probe reports", service.lifecycle().outstanding());
    }
    service.lifecycle().wait_settled().await;
    info!("Stopped");
    Ok(())
}

async fn handle_query(paths: &StatePaths, original: &str, official: &str, hint: &str) -> Result<()> {
    let service = load_service(paths).await?;
    let url = service.query(original, official, hint).await;
    println!("{}", url);
    service.lifecycle().wait_settled().await;
    Ok(())
}

async fn handle_set_enable(paths: &StatePaths, enable: bool) -> Result<()> {
    let service = load_service(paths).await?;
    service.set_enable(enable).await?;
    println!("Smart mirror is now {}.", if enable { "enabled" } else { "disabled" });
    Ok(())
}

async fn handle_status(paths: &StatePaths) -> Result<()> {
    let service = load_service(paths).await?;
    let exploit = service.exploit_set();

    println!("Enable: {}", service.enable());
    println!("{}", "-".repeat(78));
    println!(
        "{:<4} {:<2} {:<28} {:>8} {:>8} {:>10}  URL",
        "RANK", "", "NAME", "ACCESS", "FAILED", "DELAY"
    );
    println!("{}", "-".repeat(78));

    for (i, (source, quality)) in service.ranked().iter().enumerate() {
        // ✓ 表示下一次请求必定会探测的镜像
        let mark = if exploit.contains(&source.url) { "✓" } else { "" };

        let mut name = source.name.clone();
        if name.chars().count() > 26 {
            name = format!("{}...", name.chars().take(23).collect::<String>());
        }

        println!(
            "{:<4} {:<2} {:<28} {:>8} {:>8} {:>8}ms  {}",
            i + 1,
            mark,
            name,
            quality.access_count,
            quality.failed_count,
            quality.average_delay_ms,
            source.url
        );
    }
    println!("{}", "-".repeat(78));
    Ok(())
}

async fn handle_check(paths: &StatePaths, path: &str) -> Result<()> {
    let service = load_service(paths).await?;
    if service.sources().is_empty() {
        anyhow::bail!("No mirrors configured in {:?}", paths.mirrors());
    }

    let results = service.check_all(path).await;

    println!();
    println!("{:<4} {:<10} {:<28} URL", "RANK", "LATENCY", "MIRROR");
    println!("{}", "-".repeat(70));

    for (i, report) in results.iter().enumerate() {
        let latency = if report.failed {
            format!("E{}", report.status_code)
        } else {
            format!("{}ms", report.delay_ms())
        };
        let name = service
            .sources()
            .iter()
            .find(|s| s.url == report.mirror)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        println!("{:<4} {:<10} {:<28} {}", i + 1, latency, name, report.mirror);
    }

    if let Some(best) = results.iter().find(|r| !r.failed) {
        println!("{}", "-".repeat(70));
        println!("Fastest mirror is {} ({}ms)", best.mirror, best.delay_ms());
    }

    service.lifecycle().wait_settled().await;
    Ok(())
}

async fn handle_detect(official: &str, mirror: &str) -> Result<()> {
    let prober = Prober::new(ProbeHeaders::detect())?;
    let hit = detector::detect(&prober, official, mirror).await;
    println!("{}", hit);
    std::process::exit(hit.exit_code());
}
