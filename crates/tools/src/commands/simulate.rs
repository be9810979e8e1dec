use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use serde_json::{Value, json};
use streaming::{
    ChannelSink, LoadEvent, Pipeline, PipelineConfig, SchedulerState, ViewportLoadScheduler,
    WebMercatorViewport,
};
use tokio::time::sleep;
use tracing::info;

use super::{SourceArgs, parse_floats};

/// Replay a sequence of viewports through the load scheduler
#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Viewport as `lon,lat,zoom` (repeatable, replayed in order)
    #[arg(long = "view", required = true, value_parser = parse_view, allow_hyphen_values = true)]
    pub views: Vec<[f64; 3]>,

    /// Pause between viewport changes
    #[arg(long, default_value_t = 100)]
    pub interval_ms: u64,

    #[arg(long, default_value_t = 1024.0)]
    pub width: f64,

    #[arg(long, default_value_t = 768.0)]
    pub height: f64,

    /// Treat the viewports as globe views
    #[arg(long)]
    pub globe: bool,
}

fn parse_view(s: &str) -> Result<[f64; 3], String> {
    let v = parse_floats(s, 3)?;
    Ok([v[0], v[1], v[2]])
}

pub async fn run_simulate(args: SimulateArgs, mut config: PipelineConfig) -> Result<()> {
    let source = args.source.open(&mut config).await?;
    let settle = config.debounce() + Duration::from_millis(50);
    let pipeline = Pipeline::with_worker_runtime(source, config)?;

    let (sink, mut events) = ChannelSink::new();
    let handle = ViewportLoadScheduler::spawn(pipeline, Arc::new(sink));
    let mut status = handle.state();

    let printer = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(event) = events.recv().await {
            println!("{}", describe(&event));
            count += 1;
        }
        count
    });

    for (i, [lon, lat, zoom]) in args.views.iter().copied().enumerate() {
        if i > 0 {
            sleep(Duration::from_millis(args.interval_ms)).await;
        }
        let mut viewport = WebMercatorViewport::new([lon, lat], zoom, args.width, args.height);
        if args.globe {
            viewport = viewport.as_globe();
        }
        info!("viewport #{i}: {lon},{lat} z{zoom}");
        handle.viewport_changed(Arc::new(viewport));
    }

    sleep(settle).await;
    let last = *status.wait_for(|s| s.state == SchedulerState::Idle).await?;
    handle.shutdown().await;
    let count = printer.await?;

    eprintln!(
        "{} events, last generation {}, outcome {:?}",
        count, last.generation, last.last_outcome
    );
    Ok(())
}

fn describe(event: &LoadEvent) -> Value {
    match event {
        LoadEvent::Partial {
            generation,
            target,
            payload,
        } => json!({
            "event": "partial",
            "generation": generation.0,
            "target": target.to_string(),
            "features": payload.feature_count(),
        }),
        LoadEvent::Loaded {
            generation,
            target,
            payload,
        } => json!({
            "event": "load",
            "generation": generation.0,
            "target": target.to_string(),
            "features": payload.feature_count(),
        }),
        LoadEvent::Failed {
            generation,
            kind,
            detail,
        } => json!({
            "event": "error",
            "generation": generation.0,
            "kind": kind.as_str(),
            "detail": detail,
        }),
    }
}
