use super::{Outcome, VerbHandler};
use crate::config::CallConfig;
use crate::error::FlowError;
use crate::plan::{Instruction, PlanProducer};
use crate::registry::Session;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

const SAY_TYPES: &[&str] = &[
    "NUMBER",
    "ITEMS",
    "PERSONS",
    "MESSAGES",
    "CURRENCY",
    "TIME_MEASUREMENT",
    "CURRENT_DATE",
    "CURRENT_TIME",
    "CURRENT_DATE_TIME",
    "TELEPHONE_NUMBER",
    "TELEPHONE_EXTENSION",
    "URL",
    "IP_ADDRESS",
    "EMAIL_ADDRESS",
    "POSTAL_ADDRESS",
    "ACCOUNT_NUMBER",
    "NAME_SPELLED",
    "NAME_PHONETIC",
    "SHORT_DATE_TIME",
];

const SAY_METHODS: &[&str] = &["PRONOUNCED", "ITERATED", "COUNTED"];

pub struct SpeakVerb;

#[derive(Debug)]
pub struct SpeakContext {
    pub text: String,
    pub engine: String,
    pub voice: String,
    pub language: String,
    pub requested_loops: u32,
    pub loops: u32,
    /// Set when the text is read with the switch's `say` module instead of
    /// the text-to-speech engine.
    pub say: Option<(String, String)>,
}

impl SpeakContext {
    /// Application and argument for one iteration.
    fn command(&self) -> (&'static str, String) {
        match &self.say {
            Some((say_type, method)) => (
                "say",
                format!("{} {} {} {}", self.language, say_type, method, self.text),
            ),
            None => (
                "speak",
                format!("{}|{}|{}", self.engine, self.voice, self.text),
            ),
        }
    }
}

impl SpeakVerb {
    pub fn fetch_context(
        &self,
        instruction: &Instruction,
        config: &CallConfig,
    ) -> Result<SpeakContext, FlowError> {
        let text = instruction.text();
        if text.is_empty() {
            return Err(FlowError::attribute("Speak needs text"));
        }
        let requested = instruction.bounded_attr("loop", 1, 0, i64::from(u32::MAX))? as u32;
        let loops = match requested {
            0 => config.max_loop,
            n => n.min(config.max_loop),
        };
        let say = match instruction.attr("type") {
            None => None,
            Some(t) => {
                let say_type = t.to_uppercase();
                if !SAY_TYPES.contains(&say_type.as_str()) {
                    return Err(FlowError::attribute(format!("Speak type {} unknown", t)));
                }
                let method = instruction.attr_or("method", "pronounced").to_uppercase();
                if !SAY_METHODS.contains(&method.as_str()) {
                    return Err(FlowError::attribute(format!(
                        "Speak method {} unknown",
                        method
                    )));
                }
                Some((say_type, method.to_lowercase()))
            }
        };
        Ok(SpeakContext {
            text: text.to_string(),
            engine: instruction.attr_or("engine", &config.tts_engine).to_string(),
            voice: instruction.attr_or("voice", &config.tts_voice).to_string(),
            language: instruction.attr_or("language", "en").to_string(),
            requested_loops: requested,
            loops,
            say,
        })
    }
}

#[async_trait]
impl VerbHandler for SpeakVerb {
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
        let (app, arg) = ctx.command();
        for _ in 0..ctx.loops {
            if session.is_hung_up() {
                break;
            }
            session.execute(app, &arg).await?;
            if session.wait_for_app(app, None).await.is_none() {
                break;
            }
        }
        Ok(Outcome::Continue)
    }
}
