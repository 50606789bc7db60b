use super::{Outcome, VerbHandler};
use crate::config::CallConfig;
use crate::plan::{Instruction, PlanProducer};
use crate::registry::Session;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Run the nested instructions with early media, before the leg is answered.
pub struct PreAnswerVerb;

#[async_trait]
impl VerbHandler for PreAnswerVerb {
    fn validate(&self, _instruction: &Instruction, _config: &CallConfig) -> Result<()> {
        Ok(())
    }

    async fn execute(
        &self,
        producer: &PlanProducer,
        session: &Arc<Session>,
        instruction: &Instruction,
    ) -> Result<Outcome> {
        if !session.is_answered() {
            session.execute("pre_answer", "").await?;
        }
        producer
            .execute_sequence(session, instruction.children.clone())
            .await
    }
}
