use super::{Outcome, VerbHandler};
use crate::config::CallConfig;
use crate::error::FlowError;
use crate::plan::instruction::validate_url;
use crate::plan::{Instruction, PlanProducer};
use crate::registry::Session;
use crate::signal::WebhookRequest;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub struct RedirectVerb;

impl RedirectVerb {
    pub fn fetch_context(
        &self,
        instruction: &Instruction,
        _config: &CallConfig,
    ) -> Result<WebhookRequest, FlowError> {
        let url = validate_url(instruction.text())
            .map_err(|e| FlowError::attribute(format!("Redirect: {}", e)))?;
        let method = instruction.method_attr("method", "POST")?;
        Ok(WebhookRequest::new(url, method))
    }
}

#[async_trait]
impl VerbHandler for RedirectVerb {
    fn validate(&self, instruction: &Instruction, config: &CallConfig) -> Result<()> {
        self.fetch_context(instruction, config)?;
        Ok(())
    }

    async fn execute(
        &self,
        producer: &PlanProducer,
        _session: &Arc<Session>,
        instruction: &Instruction,
    ) -> Result<Outcome> {
        Ok(Outcome::Redirect(
            self.fetch_context(instruction, &producer.config().call)?,
        ))
    }
}
