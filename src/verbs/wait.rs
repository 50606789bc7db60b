use super::media::silence;
use super::{Outcome, VerbHandler};
use crate::config::CallConfig;
use crate::error::FlowError;
use crate::plan::{Instruction, PlanProducer};
use crate::registry::Session;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub struct WaitVerb;

#[derive(Debug)]
pub struct WaitContext {
    /// Seconds.
    pub length: u64,
    pub silence: bool,
}

impl WaitVerb {
    pub fn fetch_context(
        &self,
        instruction: &Instruction,
        _config: &CallConfig,
    ) -> Result<WaitContext, FlowError> {
        Ok(WaitContext {
            length: instruction.bounded_attr("length", 1, 1, 86_400)? as u64,
            silence: instruction.bool_attr("silence", false)?,
        })
    }
}

#[async_trait]
impl VerbHandler for WaitVerb {
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
        let ms = ctx.length * 1000;
        let (app, arg) = if ctx.silence {
            ("playback", silence(ms))
        } else {
            ("sleep", ms.to_string())
        };
        session.execute(app, &arg).await?;
        session.wait_for_app(app, None).await;
        Ok(Outcome::Continue)
    }
}
