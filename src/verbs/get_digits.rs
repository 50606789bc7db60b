use super::media::{media_path, prompt_playback, silence};
use super::{callback_attr, report, Outcome, VerbHandler};
use crate::config::CallConfig;
use crate::error::FlowError;
use crate::plan::{Instruction, PlanProducer};
use crate::registry::{Callback, Session};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const DIGITS_VAR: &str = "flowswitch_get_digits";
const VALID_KEYS: &str = "1234567890*#";

pub struct GetDigitsVerb;

#[derive(Debug)]
pub struct GetDigitsContext {
    pub action: Option<Callback>,
    pub redirect: bool,
    /// Seconds, clamped to the configured maximum.
    pub timeout: u64,
    pub digit_timeout: u64,
    pub finish_on_key: String,
    pub num_digits: u32,
    pub retries: u32,
    pub play_beep: bool,
    pub valid_digits: String,
    pub invalid_digits_sound: Option<String>,
    pub prompts: Vec<Instruction>,
}

impl GetDigitsContext {
    /// `play_and_get_digits` argument list.
    pub fn arguments(&self, playback: &str) -> String {
        let pattern: String = self
            .valid_digits
            .chars()
            .map(|c| regex::escape(&c.to_string()))
            .collect();
        let terminators = if self.finish_on_key.is_empty() {
            "none"
        } else {
            self.finish_on_key.as_str()
        };
        let invalid = self
            .invalid_digits_sound
            .as_deref()
            .map(media_path)
            .unwrap_or_else(|| silence(150));
        format!(
            "1 {} {} {} {} {} {} {} ^[{}]+$ {}",
            self.num_digits,
            self.retries,
            self.timeout * 1000,
            terminators,
            playback,
            invalid,
            DIGITS_VAR,
            pattern,
            self.digit_timeout * 1000,
        )
    }
}

impl GetDigitsVerb {
    pub fn fetch_context(
        &self,
        instruction: &Instruction,
        config: &CallConfig,
    ) -> Result<GetDigitsContext, FlowError> {
        let timeout = instruction.bounded_attr("timeout", 5, 1, i64::MAX)? as u64;
        let digit_timeout = instruction.bounded_attr("digitTimeout", 2, 1, i64::MAX)? as u64;
        let finish_on_key = instruction.attr_or("finishOnKey", "#").to_string();
        if finish_on_key.chars().count() > 1
            || finish_on_key.chars().any(|c| !VALID_KEYS.contains(c))
        {
            return Err(FlowError::attribute(format!(
                "GetDigits finishOnKey {} must be one key",
                finish_on_key
            )));
        }
        let valid_digits = instruction.attr_or("validDigits", VALID_KEYS).to_string();
        if let Some(bad) = valid_digits.chars().find(|c| !VALID_KEYS.contains(*c)) {
            return Err(FlowError::attribute(format!(
                "GetDigits validDigits has invalid key {}",
                bad
            )));
        }
        let max = config.max_digits_timeout_secs.max(1);
        Ok(GetDigitsContext {
            action: callback_attr(instruction, "action", "method")?,
            redirect: instruction.bool_attr("redirect", true)?,
            timeout: timeout.min(max),
            digit_timeout: digit_timeout.min(max),
            finish_on_key,
            num_digits: instruction.bounded_attr("numDigits", 99, 1, 99)? as u32,
            retries: instruction.bounded_attr("retries", 1, 1, 100)? as u32,
            play_beep: instruction.bool_attr("playBeep", false)?,
            valid_digits,
            invalid_digits_sound: instruction.attr("invalidDigitsSound").map(str::to_string),
            prompts: instruction.children.clone(),
        })
    }
}

#[async_trait]
impl VerbHandler for GetDigitsVerb {
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
        let config = &producer.config().call;
        let ctx = self.fetch_context(instruction, config)?;
        let playback = prompt_playback(&ctx.prompts, config, ctx.play_beep)?;

        session.unset_var(DIGITS_VAR).await?;
        session
            .execute("play_and_get_digits", &ctx.arguments(&playback))
            .await?;
        if session
            .wait_for_app("play_and_get_digits", None)
            .await
            .is_none()
        {
            return Ok(Outcome::Terminate);
        }

        let digits = match session.get_var(DIGITS_VAR).await {
            Ok(digits) => digits,
            Err(e) => {
                warn!(session_id = %session.id(), "could not read collected digits: {}", e);
                None
            }
        };
        let mut params = BTreeMap::new();
        match digits {
            Some(digits) => {
                info!(session_id = %session.id(), digits = %digits, "digits received");
                params.insert("Digits".to_string(), digits);
            }
            None => info!(session_id = %session.id(), "No Digits Received"),
        }
        Ok(report(
            producer,
            session,
            ctx.action.as_ref(),
            ctx.redirect,
            params,
        ))
    }
}
