use tracing::{info, warn};

use crate::{Factor, Machine, Mm, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpindleSettings {
    pub enabled: bool,
    pub clockwise: bool,
    pub speed: Mm,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    // Run the geometry passes: route grouping, drill speed, lift speed and bogus move removal.
    pub optimize: bool,

    pub safety_height: Option<Mm>,

    pub enforce_return: bool,

    pub feed_limit: Option<Mm>,

    // Multiply all feedrates by this. Applied after `feed_limit`.
    pub feed_multiplier: Option<Factor>,

    pub spindle: Option<SpindleSettings>,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_safety_height(mut self, height: Mm) -> Self {
        self.safety_height = Some(height);
        self
    }

    pub fn with_enforce_return(mut self, enforce_return: bool) -> Self {
        self.enforce_return = enforce_return;
        self
    }

    pub fn with_feed_limit(mut self, feed: Mm) -> Self {
        self.feed_limit = Some(feed);
        self
    }

    pub fn with_feed_multiplier(mut self, factor: Factor) -> Self {
        self.feed_multiplier = Some(factor);
        self
    }

    pub fn with_spindle(mut self, spindle: SpindleSettings) -> Self {
        self.spindle = Some(spindle);
        self
    }
}

// Route grouping first: it needs the null move and the untouched drill feedrate.
pub fn run_pipeline(machine: &mut Machine, config: &PipelineConfig) -> Result<()> {
    let moves_before = machine.len();

    if config.optimize {
        if let Err(err) = machine.opt_route_grouping() {
            warn!(%err, "skipping route grouping");
        }
        machine.opt_drill_speed();
        machine.opt_lift_speed();
        machine.opt_bogus_moves();
    }

    if let Some(height) = config.safety_height {
        machine.set_safety_height(height)?;
    }

    if let Some(feed) = config.feed_limit {
        machine.limit_feedrate(feed);
    }
    if let Some(factor) = config.feed_multiplier {
        machine.multiply_feedrate(factor);
    }
    if let Some(spindle) = config.spindle {
        machine.enforce_spindle(spindle.enabled, spindle.clockwise, spindle.speed);
    }

    if config.enforce_return {
        machine.return_to_origin()?;
    }

    info!(moves_before, moves_after = machine.len(), "pipeline done");
    Ok(())
}
