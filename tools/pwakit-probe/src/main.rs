//! Probe harness for the PwaKit offline worker.
//!
//! Provides commands for:
//! - Registering the worker against a live origin and replaying requests
//! - Listing or clearing the worker cache over the control channel
//! - Writing the default asset manifest
//!
//! ## Usage
//!
//! ```bash
//! # Install against a dev server, replay two requests, list the cache
//! pwakit-probe run http://localhost:8080/ -r style.css -n index.html
//!
//! # Same, with a custom manifest and a JSON report
//! pwakit-probe run http://localhost:8080/ --config worker.json --report probe.json
//!
//! # Write the default manifest
//! pwakit-probe default-config --output worker.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pwakit_channel::ControlClient;
use pwakit_common::{init_logging, LogConfig, LogFormat};
use pwakit_net::{LoaderConfig, Request, ResourceLoader};
use pwakit_sw::{
    HostConfig, MemoryCacheStorage, RegistrationOptions, WorkerConfig, WorkerHost,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

#[derive(Parser)]
#[command(name = "pwakit-probe")]
#[command(about = "Drive the PwaKit offline worker against a live origin")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "compact", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the worker, replay requests and list the cache
    Run {
        /// Origin (and directory) the app is served from
        origin: Url,
        /// Worker script path, relative to the origin
        #[arg(long, default_value = "sw.js")]
        script: String,
        /// Asset manifest (JSON); defaults to the built-in one
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Subresource paths to request through the worker
        #[arg(short, long = "request")]
        requests: Vec<String>,
        /// Paths to request as navigations
        #[arg(short, long = "navigate")]
        navigations: Vec<String>,
        /// Clear the cache after listing it
        #[arg(long)]
        clear: bool,
        /// Network timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
        /// Output JSON report path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Write the built-in asset manifest as JSON
    DefaultConfig {
        /// Output path (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_logging(LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format))?;

    match cli.command {
        Commands::Run {
            origin,
            script,
            config,
            requests,
            navigations,
            clear,
            timeout,
            report,
        } => {
            let worker = match config {
                Some(path) => WorkerConfig::load(path)?,
                None => WorkerConfig::default(),
            };
            let plan = ProbePlan {
                origin,
                script,
                requests,
                navigations,
                clear,
                timeout: Duration::from_secs(timeout),
            };

            let result = run_probe(worker, &plan).await?;
            print_report(&result);

            if let Some(report_path) = report {
                write_report(&result, &report_path)?;
                println!("Report written to: {}", report_path.display());
            }

            if !result.registered {
                std::process::exit(1);
            }
        }

        Commands::DefaultConfig { output } => {
            let json = serde_json::to_string_pretty(&WorkerConfig::default())?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("Manifest written to: {}", path.display());
                }
                None => println!("{json}"),
            }
        }
    }

    Ok(())
}

/// What to do against the origin.
struct ProbePlan {
    origin: Url,
    script: String,
    requests: Vec<String>,
    navigations: Vec<String>,
    clear: bool,
    timeout: Duration,
}

/// Probe report structure.
#[derive(Debug, Serialize, Deserialize)]
struct ProbeReport {
    status: String,
    registered: bool,
    cache_name: String,
    requests: Vec<RequestResult>,
    cache_contents: Vec<String>,
    cleared: Option<bool>,
    events: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestResult {
    url: String,
    navigation: bool,
    status: Option<u16>,
    error: Option<String>,
}

async fn run_probe(
    worker: WorkerConfig,
    plan: &ProbePlan,
) -> Result<ProbeReport, Box<dyn std::error::Error>> {
    let loader = ResourceLoader::new(LoaderConfig {
        default_timeout: plan.timeout,
        ..Default::default()
    })?;
    let storage = Arc::new(MemoryCacheStorage::new());
    let (host, mut events) = WorkerHost::new(HostConfig::default(), storage, Arc::new(loader));
    let host = Arc::new(host);

    host.connect_client(plan.origin.clone()).await;

    let script_url = plan.origin.join(&plan.script)?;
    let cache_name = worker.cache_name.clone();
    let registered = match host
        .register(script_url.as_str(), worker, RegistrationOptions::default())
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Registration failed");
            false
        }
    };
    let status = host.registration_status().await;
    info!(status = status.indicator(), "Registration finished");

    let mut requests = Vec::new();
    let targets = plan
        .requests
        .iter()
        .map(|p| (p, false))
        .chain(plan.navigations.iter().map(|p| (p, true)));
    for (path, navigation) in targets {
        let url = plan.origin.join(path)?;
        let request = if navigation {
            Request::navigate(url.clone())
        } else {
            Request::get(url.clone())
        };

        let (status, error) = match host.dispatch_fetch(&request).await {
            Ok(response) => (Some(response.status.as_u16()), None),
            Err(e) => (None, Some(e.to_string())),
        };
        requests.push(RequestResult {
            url: url.to_string(),
            navigation,
            status,
            error,
        });
    }

    let client = ControlClient::new(host.clone());
    let (cache_contents, cleared) = if registered {
        let contents = client.get_cache_contents().await?;
        let cleared = if plan.clear {
            Some(client.clear_cache().await?)
        } else {
            None
        };
        (contents, cleared)
    } else {
        (Vec::new(), None)
    };

    let events = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e| format!("{e:?}"))
        .collect();

    Ok(ProbeReport {
        status: format!("{status:?}"),
        registered,
        cache_name,
        requests,
        cache_contents,
        cleared,
        events,
    })
}

fn print_report(report: &ProbeReport) {
    println!("Registration: {}", report.status);
    println!("Cache:        {}", report.cache_name);

    if !report.requests.is_empty() {
        println!("Requests:");
        for r in &report.requests {
            let kind = if r.navigation { "nav" } else { "get" };
            match (&r.status, &r.error) {
                (Some(status), _) => println!("  [{kind}] {} -> {status}", r.url),
                (None, Some(error)) => println!("  [{kind}] {} -> error: {error}", r.url),
                (None, None) => println!("  [{kind}] {} -> no response", r.url),
            }
        }
    }

    println!("Cache contents ({}):", report.cache_contents.len());
    for url in &report.cache_contents {
        println!("  {url}");
    }

    if let Some(cleared) = report.cleared {
        println!("Cleared:      {cleared}");
    }

    println!("Events:");
    for event in &report.events {
        println!("  {event}");
    }
}

fn write_report(report: &ProbeReport, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    Ok(())
}
