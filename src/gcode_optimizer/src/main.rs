use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use gcode_optimizer_lib as go;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gcode_optimizer")]
#[command(about = "Post-processes drilling/routing G-code into a shorter, safer toolpath")]
#[command(version)]
struct Cli {
    /// G-code to read
    input: PathBuf,

    /// Where to write the result. Can be the same file as the input; it's only replaced once the
    /// complete output has been written.
    output: PathBuf,

    /// Run the geometry passes: route grouping, drill speed, lift speed, redundant move removal
    #[arg(short, long)]
    optimize: bool,

    /// Replace the detected safety height with this one
    #[arg(long)]
    safety_height: Option<go::Mm>,

    /// Make sure the program ends at X0 Y0 Z0
    #[arg(long)]
    enforce_return: bool,

    /// Clamp every feedrate to this
    #[arg(long)]
    feed_limit: Option<go::Mm>,

    /// Multiply every feedrate by this (after --feed-limit)
    #[arg(long)]
    feed_multiplier: Option<go::Factor>,

    /// Run the spindle at this speed for the whole program
    #[arg(long)]
    spindle_speed: Option<go::Mm>,

    /// With --spindle-speed, run the spindle counter-clockwise (M4) instead of clockwise (M3)
    #[arg(long, requires = "spindle_speed")]
    spindle_ccw: bool,

    /// Two xy positions closer than this are treated as the same point
    #[arg(long, default_value_t = go::DEFAULT_TOLERANCE)]
    tolerance: go::Mm,
}

impl Cli {
    fn pipeline_config(&self) -> go::PipelineConfig {
        go::PipelineConfig {
            optimize: self.optimize,
            safety_height: self.safety_height,
            enforce_return: self.enforce_return,
            feed_limit: self.feed_limit,
            feed_multiplier: self.feed_multiplier,
            spindle: self.spindle_speed.map(|speed| go::SpindleSettings {
                enabled: true,
                clockwise: !self.spindle_ccw,
                speed,
            }),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gcode_optimizer=info,gcode_optimizer_lib=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::info!(input = %cli.input.display(), output = %cli.output.display(), "gcode_optimizer starting");

    go::process_files(&cli.input, &cli.output, cli.tolerance, &cli.pipeline_config())
        .with_context(|| format!("failed to optimize {}", cli.input.display()))?;

    Ok(())
}
