use super::RunContext;
use crate::result::EvalResult;

/// Pre/post hooks around a run. `pre_process` runs once before any sample is
/// dispatched; `post_process` runs on the finalized result.
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    fn pre_process(&self, _ctx: &mut RunContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_process(&self, _result: &mut EvalResult, _ctx: &RunContext) -> anyhow::Result<()> {
        Ok(())
    }
}
