use super::media::prompt_playback;
use super::{report, Outcome, VerbHandler};
use crate::config::CallConfig;
use crate::error::FlowError;
use crate::plan::{Instruction, PlanProducer};
use crate::registry::{Callback, Session};
use crate::switch::event::{CHANNEL_HANGUP_COMPLETE, DETECTED_SPEECH};
use anyhow::Result;
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub struct GetSpeechVerb;

#[derive(Debug)]
pub struct GetSpeechContext {
    pub action: Callback,
    pub timeout: u64,
    pub engine: String,
    pub grammar: String,
    pub grammar_path: Option<String>,
    pub play_beep: bool,
    pub prompts: Vec<Instruction>,
}

impl GetSpeechContext {
    fn detect_arguments(&self) -> String {
        let location = match &self.grammar_path {
            Some(dir) => format!("{}/{}", dir.trim_end_matches('/'), self.grammar),
            None => self.grammar.clone(),
        };
        format!("{} {} {}", self.engine, self.grammar, location)
    }
}

/// Recognition result read from an NLSML document.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechResult {
    pub grammar: String,
    pub confidence: i32,
    pub mode: String,
    pub text: String,
}

impl Default for SpeechResult {
    fn default() -> Self {
        Self {
            grammar: String::new(),
            confidence: -1,
            mode: String::new(),
            text: String::new(),
        }
    }
}

impl SpeechResult {
    fn params(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("Grammar".to_string(), self.grammar.clone()),
            ("Confidence".to_string(), self.confidence.to_string()),
            ("Mode".to_string(), self.mode.clone()),
            ("SpeechResult".to_string(), self.text.clone()),
        ])
    }
}

/// Parse the first interpretation of an NLSML result. Anything unreadable
/// yields a result with confidence -1.
pub fn parse_nlsml(body: &str) -> SpeechResult {
    match try_parse_nlsml(body) {
        Ok(Some(result)) => result,
        Ok(None) => {
            error!("speech result has no interpretation");
            SpeechResult::default()
        }
        Err(e) => {
            error!("malformed speech result: {}", e);
            SpeechResult::default()
        }
    }
}

fn try_parse_nlsml(body: &str) -> Result<Option<SpeechResult>> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut result: Option<SpeechResult> = None;
    let mut in_input = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => match e.name().as_ref() {
                b"interpretation" if result.is_none() => {
                    let mut found = SpeechResult::default();
                    for attr in e.attributes() {
                        let attr = attr?;
                        let value = attr.unescape_value()?.to_string();
                        match attr.key.as_ref() {
                            b"grammar" => found.grammar = value,
                            b"confidence" | b"score" => {
                                found.confidence = value.trim().parse::<f32>()?.round() as i32
                            }
                            _ => {}
                        }
                    }
                    result = Some(found);
                }
                b"input" => {
                    if let Some(found) = result.as_mut() {
                        for attr in e.attributes() {
                            let attr = attr?;
                            if attr.key.as_ref() == b"mode" {
                                found.mode = attr.unescape_value()?.to_string();
                            }
                        }
                        in_input = true;
                    }
                }
                _ => {}
            },
            Event::Text(t) if in_input => {
                if let Some(found) = result.as_mut() {
                    found.text.push_str(&t.unescape()?);
                }
            }
            Event::End(e) if e.name().as_ref() == b"input" => in_input = false,
            Event::End(e) if e.name().as_ref() == b"interpretation" && result.is_some() => break,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(result)
}

impl GetSpeechVerb {
    pub fn fetch_context(
        &self,
        instruction: &Instruction,
        config: &CallConfig,
    ) -> Result<GetSpeechContext, FlowError> {
        let action = super::callback_attr(instruction, "action", "method")?
            .ok_or_else(|| FlowError::attribute("GetSpeech needs an action url"))?;
        let grammar = instruction
            .attr("grammar")
            .ok_or_else(|| FlowError::attribute("GetSpeech needs a grammar"))?;
        Ok(GetSpeechContext {
            action,
            timeout: (instruction.bounded_attr("timeout", 5, 1, i64::MAX)? as u64)
                .min(config.max_digits_timeout_secs.max(1)),
            engine: instruction.attr_or("engine", &config.speech_engine).to_string(),
            grammar: grammar.to_string(),
            grammar_path: instruction.attr("grammarPath").map(str::to_string),
            play_beep: instruction.bool_attr("playBeep", false)?,
            prompts: instruction.children.clone(),
        })
    }
}

#[async_trait]
impl VerbHandler for GetSpeechVerb {
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

        session
            .execute("detect_speech", &ctx.detect_arguments())
            .await?;
        if !ctx.prompts.is_empty() || ctx.play_beep {
            let playback = prompt_playback(&ctx.prompts, config, ctx.play_beep)?;
            session.execute("playback", &playback).await?;
            if session.wait_for_app("playback", None).await.is_none() {
                return Ok(Outcome::Terminate);
            }
        }

        let event = session
            .wait_for_event(Some(Duration::from_secs(ctx.timeout)), true, |e| {
                (e.is(DETECTED_SPEECH) && e.header("Speech-Type") == Some("detected-speech"))
                    || e.is(CHANNEL_HANGUP_COMPLETE)
            })
            .await;
        if !session.is_hung_up() {
            session.execute("detect_speech", "stop").await?;
        }

        let result = match event {
            Some(e) if e.is(DETECTED_SPEECH) => parse_nlsml(e.body().unwrap_or_default()),
            Some(_) => return Ok(Outcome::Terminate),
            None => {
                info!(session_id = %session.id(), "no speech detected");
                SpeechResult::default()
            }
        };
        Ok(report(
            producer,
            session,
            Some(&ctx.action),
            true,
            result.params(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nlsml() {
        let body = r#"<?xml version="1.0"?>
            <result grammar="yesno">
              <interpretation grammar="yesno" confidence="84.6">
                <instance>yes</instance>
                <input mode="speech">yes please</input>
              </interpretation>
            </result>"#;
        assert_eq!(
            parse_nlsml(body),
            SpeechResult {
                grammar: "yesno".into(),
                confidence: 85,
                mode: "speech".into(),
                text: "yes please".into(),
            }
        );
    }

    #[test]
    fn test_timeout_is_clamped() {
        let mut config = CallConfig::default();
        config.max_digits_timeout_secs = 30;
        let speech = Instruction::new(crate::plan::VerbKind::GetSpeech)
            .with_attr("action", "http://app/speech")
            .with_attr("grammar", "yesno")
            .with_attr("timeout", "600");
        assert_eq!(GetSpeechVerb.fetch_context(&speech, &config).unwrap().timeout, 30);
        let speech = speech.with_attr("timeout", "12");
        assert_eq!(GetSpeechVerb.fetch_context(&speech, &config).unwrap().timeout, 12);
    }

    #[test]
    fn test_malformed_result_yields_negative_confidence() {
        assert_eq!(parse_nlsml("<result><interpretation confidence=\"high\">").confidence, -1);
        assert_eq!(parse_nlsml("Completion-Cause: 001").confidence, -1);
    }
}
