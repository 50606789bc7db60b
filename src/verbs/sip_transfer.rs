use super::{Outcome, VerbHandler};
use crate::config::CallConfig;
use crate::error::FlowError;
use crate::plan::{Instruction, PlanProducer};
use crate::registry::Session;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Hand the leg to another SIP endpoint: REFER when answered, 302 otherwise.
pub struct SipTransferVerb;

impl SipTransferVerb {
    pub fn fetch_context(
        &self,
        instruction: &Instruction,
        _config: &CallConfig,
    ) -> Result<Vec<String>, FlowError> {
        let uris = instruction
            .text()
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(|u| {
                let parsed = url::Url::parse(u)
                    .map_err(|e| FlowError::attribute(format!("SIPTransfer {}: {}", u, e)))?;
                if parsed.scheme() != "sip" || parsed.path().is_empty() {
                    return Err(FlowError::attribute(format!(
                        "SIPTransfer {} is not a sip uri",
                        u
                    )));
                }
                Ok(u.to_string())
            })
            .collect::<Result<Vec<_>, _>>()?;
        if uris.is_empty() {
            return Err(FlowError::attribute("SIPTransfer needs at least one sip uri"));
        }
        Ok(uris)
    }
}

#[async_trait]
impl VerbHandler for SipTransferVerb {
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
        let uris = self.fetch_context(instruction, &producer.config().call)?;
        if session.is_answered() {
            if uris.len() > 1 {
                debug!(session_id = %session.id(), "deflect takes one target, using the first");
            }
            info!(session_id = %session.id(), target = %uris[0], "deflecting");
            session.execute("deflect", &uris[0]).await?;
        } else {
            let targets = uris.join(",");
            info!(session_id = %session.id(), targets = %targets, "redirecting before answer");
            session.execute("redirect", &targets).await?;
        }
        Ok(Outcome::Terminate)
    }
}
