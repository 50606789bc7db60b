use super::{Outcome, VerbHandler};
use crate::config::CallConfig;
use crate::error::FlowError;
use crate::plan::{Instruction, PlanProducer};
use crate::registry::Session;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Send DTMF tones on the leg.
pub struct DtmfVerb;

#[derive(Debug)]
pub struct DtmfContext {
    pub digits: String,
    pub wait: bool,
}

impl DtmfVerb {
    pub fn fetch_context(
        &self,
        instruction: &Instruction,
        _config: &CallConfig,
    ) -> Result<DtmfContext, FlowError> {
        let digits = instruction.text();
        if digits.is_empty() {
            return Err(FlowError::attribute("DTMF needs digits"));
        }
        // w and W are half and full second pauses
        if let Some(bad) = digits
            .chars()
            .find(|c| !(c.is_ascii_digit() || "*#ABCDwW".contains(*c)))
        {
            return Err(FlowError::attribute(format!("DTMF digit {} invalid", bad)));
        }
        Ok(DtmfContext {
            digits: digits.to_string(),
            wait: !instruction.bool_attr("async", true)?,
        })
    }
}

#[async_trait]
impl VerbHandler for DtmfVerb {
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
        session.execute("send_dtmf", &ctx.digits).await?;
        if ctx.wait {
            session.wait_for_app("send_dtmf", None).await;
        }
        Ok(Outcome::Continue)
    }
}
