//! Built-in pipeline stage executors.
//!
//! The stages stand in for the scraping, processing, indexing and analysis
//! services. Each walks its work in fixed ticks, reports progress after every
//! tick and checks for cancellation between ticks.

use async_trait::async_trait;
use marketflow_core::{
    ExecutorRegistry, ProgressSink, ProgressUpdate, StepContext, StepError, StepExecutor,
    StepOutput, StepParams,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::server::config::PipelineConfig;

/// Stage types served by this binary
pub const STAGES: [&str; 4] = ["scraping", "processing", "indexing", "analysis"];

/// Simulated stage
pub struct SimulatedStage {
    stage: &'static str,
    tick: Duration,
    ticks: u32,
}

impl SimulatedStage {
    pub fn new(stage: &'static str, config: &PipelineConfig) -> Self {
        Self {
            stage,
            tick: Duration::from_millis(config.tick_ms),
            ticks: config.ticks.max(1),
        }
    }
}

/// Number of symbols the stage works on; the parameter name differs per
/// stage after renaming.
fn symbol_count(params: &StepParams) -> usize {
    ["symbols", "constituents", "tickers"]
        .iter()
        .find_map(|key| params.get(*key).and_then(Value::as_array))
        .map_or(0, Vec::len)
}

#[async_trait]
impl StepExecutor for SimulatedStage {
    async fn execute(
        &self,
        ctx: StepContext,
        params: StepParams,
        progress: ProgressSink,
    ) -> Result<StepOutput, StepError> {
        let symbols = symbol_count(&params);
        debug!(
            operation_id = %ctx.operation_id,
            step = %ctx.step_name,
            attempt = ctx.attempt,
            symbols,
            "Stage started"
        );

        for tick in 1..=self.ticks {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
                _ = tokio::time::sleep(self.tick) => {}
            }
            let percent = (tick * 100 / self.ticks) as u8;
            progress.report(
                ProgressUpdate::percent(percent)
                    .with_message(format!("{} {}/{}", self.stage, tick, self.ticks)),
            );
        }

        let records = u64::from(self.ticks) * 100 * symbols.max(1) as u64;
        Ok(StepOutput::new()
            .with_metadata("stage", self.stage)
            .with_metadata("records", records)
            .with_metadata("symbols", symbols as u64))
    }
}

/// Register every built-in stage.
pub fn register_stages(registry: &mut ExecutorRegistry, config: &PipelineConfig) {
    for stage in STAGES {
        registry.register(stage, Arc::new(SimulatedStage::new(stage, config)));
    }
}
