use super::RunContext;
use crate::model::SampleResult;
use crate::result::EvalResult;

pub trait Reporter: Send + Sync {
    fn name(&self) -> &str;

    fn handle_sample(&self, _result: &SampleResult, _ctx: &RunContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle_summary(&self, _result: &EvalResult, _ctx: &RunContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes one debug line per sample and an info summary through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn name(&self) -> &str {
        "log"
    }

    fn handle_sample(&self, result: &SampleResult, ctx: &RunContext) -> anyhow::Result<()> {
        match &result.error {
            Some(error) => tracing::debug!(
                run_id = %ctx.run_id,
                sample_id = %result.sample_id,
                latency_ms = result.latency_ms,
                error = %error,
                "sample failed"
            ),
            None => tracing::debug!(
                run_id = %ctx.run_id,
                sample_id = %result.sample_id,
                latency_ms = result.latency_ms,
                scores = ?result.scores,
                "sample scored"
            ),
        }
        Ok(())
    }

    fn handle_summary(&self, result: &EvalResult, ctx: &RunContext) -> anyhow::Result<()> {
        tracing::info!(
            run_id = %ctx.run_id,
            samples = result.sample_count,
            completed = result.completed_count,
            errors = result.error_count,
            pass_rate = ?result.pass_rate,
            duration_ms = result.duration_ms,
            "run summary"
        );
        Ok(())
    }
}
