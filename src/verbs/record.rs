use super::media::BEEP;
use super::{callback_attr, report, Outcome, VerbHandler};
use crate::config::CallConfig;
use crate::error::FlowError;
use crate::plan::{Instruction, PlanProducer};
use crate::registry::{Callback, Session};
use crate::scheduler::Scheduler;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const SILENCE_THRESHOLD: u32 = 500;

pub struct RecordVerb;

#[derive(Debug)]
pub struct RecordContext {
    pub action: Option<Callback>,
    pub redirect: bool,
    pub callback: Option<Callback>,
    /// Seconds of silence that end the recording.
    pub timeout: u64,
    pub finish_on_key: String,
    pub max_length: u64,
    pub play_beep: bool,
    pub both_legs: bool,
    pub file_path: String,
    pub file_name: Option<String>,
    pub file_format: String,
}

impl RecordContext {
    /// Full path of the file written for `session_id`.
    pub fn record_file(&self, session_id: &str) -> String {
        let name = match &self.file_name {
            Some(name) => name.clone(),
            None => format!(
                "{}_{}",
                chrono::Utc::now().format("%Y%m%d-%H%M%S"),
                session_id
            ),
        };
        format!(
            "{}/{}.{}",
            self.file_path.trim_end_matches('/'),
            name,
            self.file_format
        )
    }
}

impl RecordVerb {
    pub fn fetch_context(
        &self,
        instruction: &Instruction,
        config: &CallConfig,
    ) -> Result<RecordContext, FlowError> {
        let file_format = instruction.attr_or("fileFormat", "mp3").to_lowercase();
        if file_format != "mp3" && file_format != "wav" {
            return Err(FlowError::attribute(format!(
                "Record fileFormat {} must be mp3 or wav",
                file_format
            )));
        }
        let finish_on_key = instruction.attr_or("finishOnKey", "1234567890*#").to_string();
        if let Some(bad) = finish_on_key.chars().find(|c| !"1234567890*#".contains(*c)) {
            return Err(FlowError::attribute(format!(
                "Record finishOnKey has invalid key {}",
                bad
            )));
        }
        Ok(RecordContext {
            action: callback_attr(instruction, "action", "method")?,
            redirect: instruction.bool_attr("redirect", true)?,
            callback: callback_attr(instruction, "callbackUrl", "callbackMethod")?,
            timeout: instruction.bounded_attr("timeout", 15, 1, i64::MAX)? as u64,
            finish_on_key,
            max_length: instruction.bounded_attr("maxLength", 60, 1, i64::MAX)? as u64,
            play_beep: instruction.bool_attr("playBeep", true)?,
            both_legs: instruction.bool_attr("bothLegs", false)?,
            file_path: instruction
                .attr_or("filePath", &config.record_path)
                .to_string(),
            file_name: instruction.attr("fileName").map(str::to_string),
            file_format,
        })
    }

    async fn record_both_legs(
        &self,
        ctx: &RecordContext,
        session: &Session,
        file: &str,
    ) -> Result<BTreeMap<String, String>> {
        session.set_var("RECORD_STEREO", "true").await?;
        let reply = session
            .command(&format!("uuid_record {} start {}", session.id(), file))
            .await?;
        if !reply.is_ok() {
            warn!(
                session_id = %session.id(),
                "uuid_record refused: {}",
                reply.error_cause().unwrap_or_default()
            );
        }
        let stop = format!("uuid_record {} stop {}", session.id(), file);
        if let Err(e) = Scheduler::schedule_command(
            &session.instance()?.client(),
            "none",
            ctx.max_length,
            &stop,
        )
        .await
        {
            warn!(session_id = %session.id(), "recording stop not scheduled: {}", e);
        }
        // no per-leg duration or terminator for a bridged recording
        Ok(BTreeMap::from([
            ("RecordUrl".to_string(), file.to_string()),
            ("RecordFile".to_string(), file.to_string()),
            ("RecordingDuration".to_string(), "-1".to_string()),
            ("RecordingDurationMs".to_string(), "-1".to_string()),
            ("Digits".to_string(), String::new()),
        ]))
    }

    async fn record_single_leg(
        &self,
        ctx: &RecordContext,
        session: &Session,
        file: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        if ctx.play_beep {
            session.execute("playback", BEEP).await?;
            if session.wait_for_app("playback", None).await.is_none() {
                return Ok(None);
            }
        }
        session
            .set_var("playback_terminators", &ctx.finish_on_key)
            .await?;
        session
            .execute(
                "record",
                &format!(
                    "{} {} {} {}",
                    file, ctx.max_length, SILENCE_THRESHOLD, ctx.timeout
                ),
            )
            .await?;
        if session.wait_for_app("record", None).await.is_none() {
            return Ok(None);
        }

        let duration_ms = session
            .get_var("record_ms")
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(-1);
        let digits = session
            .get_var("playback_terminator_used")
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        let duration = if duration_ms < 0 {
            -1
        } else {
            duration_ms / 1000
        };
        Ok(Some(BTreeMap::from([
            ("RecordUrl".to_string(), file.to_string()),
            ("RecordFile".to_string(), file.to_string()),
            ("RecordingDuration".to_string(), duration.to_string()),
            ("RecordingDurationMs".to_string(), duration_ms.to_string()),
            ("Digits".to_string(), digits),
        ])))
    }
}

#[async_trait]
impl VerbHandler for RecordVerb {
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
        let file = ctx.record_file(session.id());
        if ctx.callback.is_some() {
            session.set_record_callback(ctx.callback.clone());
        }
        info!(session_id = %session.id(), file = %file, both_legs = ctx.both_legs, "recording");

        let params = if ctx.both_legs {
            self.record_both_legs(&ctx, session, &file).await?
        } else {
            match self.record_single_leg(&ctx, session, &file).await? {
                Some(params) => params,
                None => return Ok(Outcome::Terminate),
            }
        };
        Ok(report(
            producer,
            session,
            ctx.action.as_ref(),
            ctx.redirect,
            params,
        ))
    }
}
