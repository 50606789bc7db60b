use super::media::media_path;
use super::{Outcome, VerbHandler};
use crate::config::CallConfig;
use crate::error::FlowError;
use crate::plan::{Instruction, PlanProducer};
use crate::registry::Session;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub struct PlayVerb;

#[derive(Debug)]
pub struct PlayContext {
    pub media: String,
    /// `loop` as written.
    pub requested_loops: u32,
    /// Iterations actually played: `loop=0` means as many as allowed.
    pub loops: u32,
}

impl PlayVerb {
    pub fn fetch_context(
        &self,
        instruction: &Instruction,
        config: &CallConfig,
    ) -> Result<PlayContext, FlowError> {
        let media = instruction.text();
        if media.is_empty() {
            return Err(FlowError::attribute("Play needs a media url or path"));
        }
        let requested = instruction.bounded_attr("loop", 1, 0, i64::from(u32::MAX))? as u32;
        let loops = match requested {
            0 => config.max_loop,
            n => n.min(config.max_loop),
        };
        Ok(PlayContext {
            media: media.to_string(),
            requested_loops: requested,
            loops,
        })
    }
}

#[async_trait]
impl VerbHandler for PlayVerb {
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
        let path = media_path(&ctx.media);
        for _ in 0..ctx.loops {
            if session.is_hung_up() {
                break;
            }
            session.execute("playback", &path).await?;
            if session.wait_for_app("playback", None).await.is_none() {
                break;
            }
        }
        Ok(Outcome::Continue)
    }
}
