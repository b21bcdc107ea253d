use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::bounded;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cachetop::analysis;
use cachetop::assembly;
use cachetop::capture::{self, CaptureError};
use cachetop::cli::Cli;
use cachetop::config::Config;
use cachetop::decode;
use cachetop::presentation::{Presenter, PresenterConfig};
use cachetop::protocol::EventSink;
use cachetop::stats::PipelineStats;

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(e) = run(&cli) {
        error!("{e:#}");
        // capture setup problems exit 2, configuration problems exit 1
        let code = if e.downcast_ref::<CaptureError>().is_some() {
            2
        } else {
            1
        };
        std::process::exit(code);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = Config::from_cli(cli)?;
    let stats = Arc::new(PipelineStats::default());

    let analysis_pool = Arc::new(
        analysis::Pool::new(config.analysis_workers, &config.format, stats.clone())
            .context("invalid --format")?,
    );
    analysis_pool
        .set_filter_pattern(&config.filter)
        .context("invalid --filter")?;

    let source = capture::new_source(
        config.interface.as_deref(),
        config.read_file.as_deref(),
        config.buffer_size_mib,
        config.no_delay,
        &config.ports,
    )?;

    let sink: Arc<dyn EventSink> = analysis_pool.clone();
    let assembly_pool = Arc::new(assembly::Pool::new(
        config.assembly_workers,
        config.ports.clone(),
        config.protocol,
        sink,
        stats.clone(),
    ));

    let assembly_for_decode = assembly_pool.clone();
    let handler: decode::pool::Handler =
        Arc::new(move |batch| assembly_for_decode.handle_packets(batch));
    let mut decode_pool = decode::Pool::new(config.decode_workers, source, handler, stats.clone());

    info!(
        workers.decode = config.decode_workers,
        workers.assembly = config.assembly_workers,
        workers.analysis = config.analysis_workers,
        format = %config.format,
        "starting capture"
    );

    let (shutdown_tx, shutdown_rx) = bounded::<()>(2);
    let ctrlc_tx = shutdown_tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.try_send(());
    })
    .context("installing signal handler")?;

    thread::spawn(move || {
        if let Err(e) = decode_pool.run() {
            warn!(error = %e, "capture stopped");
        }
        // EOF or a fatal capture error: trigger the final report
        let _ = shutdown_tx.try_send(());
    });

    let mut presenter = Presenter::new(
        analysis_pool,
        assembly_pool,
        stats,
        PresenterConfig {
            interval: config.interval,
            cumulative: config.cumulative,
            top: config.top,
            json: config.json_reports,
            output: config.output.clone(),
        },
    )
    .context("opening report output")?;
    presenter.run(shutdown_rx).context("writing report")?;
    Ok(())
}
