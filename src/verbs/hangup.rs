use super::{Outcome, VerbHandler};
use crate::config::CallConfig;
use crate::error::FlowError;
use crate::plan::{Instruction, PlanProducer};
use crate::registry::Session;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct HangupVerb;

#[derive(Debug)]
pub struct HangupContext {
    pub cause: &'static str,
    /// Seconds from now; 0 hangs up immediately.
    pub schedule: u64,
}

impl HangupVerb {
    pub fn fetch_context(
        &self,
        instruction: &Instruction,
        _config: &CallConfig,
    ) -> Result<HangupContext, FlowError> {
        let cause = match instruction.attr("reason") {
            Some("rejected") => "CALL_REJECTED",
            Some("busy") => "USER_BUSY",
            _ => "NORMAL_CLEARING",
        };
        Ok(HangupContext {
            cause,
            schedule: instruction.bounded_attr("schedule", 0, 0, i64::MAX)? as u64,
        })
    }
}

#[async_trait]
impl VerbHandler for HangupVerb {
    fn validate(&self, instruction: &Instruction, config: &CallConfig) -> Result<()> {
        self.fetch_context(instruction, config)?;
        Ok(())
    }

    async fn execute(
        &self,
        producer: &PlanProducer,
        session: &Arc<Session>,
        instruction: &Instruction,
    ) -> Result<Outcome> {
        let ctx = self.fetch_context(instruction, &producer.config().call)?;
        if ctx.schedule > 0 {
            let entry = producer
                .scheduler()
                .arm_hangup(&session.instance()?, session.id(), ctx.schedule, ctx.cause)
                .await?;
            info!(
                session_id = %session.id(),
                id = %entry.id,
                seconds = ctx.schedule,
                "hangup scheduled"
            );
            session.set_scheduled_hangup_id(Some(entry.id));
            return Ok(Outcome::Continue);
        }
        // the hangup event may not carry our reason
        session.set_hangup_cause(ctx.cause);
        session.execute("hangup", ctx.cause).await?;
        Ok(Outcome::Terminate)
    }
}
