// src/main.rs

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use trafficflow::logging;
use trafficflow::memory::as_mib;
use trafficflow::prelude::*;

const RULE: &str = "============================================================";

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();

    let settings = Settings::parse();
    let config = settings.to_config()?;

    let urls = load_urls(&settings.urls_file)
        .await
        .with_context(|| format!("cannot read URL list {}", settings.urls_file.display()))?;
    if urls.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "{} contains no URLs",
            settings.urls_file.display()
        ))
        .into());
    }

    let transport = Arc::new(HttpTransport::new().context("cannot build HTTP client")?);
    let shutdown = Shutdown::new();
    let (progress_tx, mut progress_rx) = mpsc::channel(16);
    let scheduler = TrafficScheduler::new(
        config.clone(),
        transport,
        Arc::new(SystemMemory::new()),
        shutdown.clone(),
    )
    .with_progress(progress_tx);

    print_banner(&config, urls.len(), scheduler.effective_max_concurrency());
    install_signal_handlers(shutdown);

    let printer = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            print_event(&event);
        }
    });

    let summary = scheduler.run(&urls).await;
    // Dropping the scheduler closes the progress channel so the printer drains and exits.
    drop(scheduler);
    let _ = printer.await;

    println!("\n{}", RULE);
    println!("Final statistics:");
    if settings.json {
        println!("{}", serde_json::to_string_pretty(&summary.snapshot)?);
    } else {
        println!("{}", summary.snapshot);
    }
    println!("trafficflow stopped");
    Ok(())
}

fn print_banner(config: &TrafficConfig, url_count: usize, concurrency: usize) {
    println!("{}", RULE);
    println!("trafficflow - network traffic generator");
    println!("{}", RULE);
    println!("URLs:             {}", url_count);
    println!("round interval:   {} s", config.round_interval.as_secs());
    println!("max concurrency:  {}", concurrency);
    println!("memory ceiling:   {:.0} MB", as_mib(config.max_memory_bytes));
    println!("chunk size:       {} bytes", config.chunk_size_bytes);
    match config.repeat_count {
        Some(count) => println!("rounds:           {}", count),
        None => println!("rounds:           unlimited"),
    }
    if config.global_rate_limit > 0 {
        println!("global limit:     {} KB/s", config.global_rate_limit / 1024);
    }
    if config.per_download_rate_limit > 0 {
        println!("download limit:   {} KB/s", config.per_download_rate_limit / 1024);
    }
    println!("{}", RULE);
    println!("press Ctrl+C to stop");
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::RoundStarted {
            round,
            concurrency,
            rate_limit,
        } => {
            println!("\n--- round {} started ---", round);
            println!("max concurrency: {}", concurrency);
            if *rate_limit > 0 {
                println!("per-download limit: {} KB/s", rate_limit / 1024);
            }
        }
        ProgressEvent::RoundFinished { result, snapshot } => {
            println!(
                "round {} done: {}/{} files",
                result.round_number, result.succeeded, result.attempted
            );
            println!("\n{}", snapshot);
        }
        ProgressEvent::RoundSkipped { round, snapshot } => {
            println!("memory did not drop in time, round {} skipped", round);
            println!("\n{}", snapshot);
        }
        ProgressEvent::RoundInterrupted { round } => {
            println!("round {} interrupted by stop request", round);
        }
    }
}
