use super::media::{file_string, prompt_parts, sound_path};
use super::{bind_digit_callbacks, callback_attr, report, Outcome, VerbHandler};
use crate::config::CallConfig;
use crate::error::FlowError;
use crate::plan::instruction::validate_url;
use crate::plan::{Instruction, PlanProducer};
use crate::registry::{Callback, DigitBinding, Session};
use crate::scheduler::Scheduler;
use crate::signal::{ConferenceMember, Signal};
use crate::switch::event::CHANNEL_HANGUP_COMPLETE;
use crate::switch::SwitchEvent;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DIGIT_REALM: &str = "flowswitch_conference";

pub struct ConferenceVerb;

#[derive(Debug)]
pub struct ConferenceContext {
    pub room: String,
    pub muted: bool,
    pub enter_sound: Option<String>,
    pub exit_sound: Option<String>,
    pub start_on_enter: bool,
    pub end_on_exit: bool,
    pub stay_alone: bool,
    pub wait_sound: Option<String>,
    pub max_members: u32,
    pub time_limit: u64,
    pub hangup_on_star: bool,
    pub record: bool,
    pub record_file_path: String,
    pub record_file_format: String,
    pub record_file_name: Option<String>,
    pub action: Option<Callback>,
    pub redirect: bool,
    pub callback: Option<Callback>,
    pub digits_match: Vec<String>,
    pub floor_event: bool,
}

impl ConferenceContext {
    /// Value for `conference_member_flags`.
    pub fn member_flags(&self) -> String {
        let mut flags = Vec::new();
        if self.muted {
            flags.push("mute");
        }
        flags.push(if self.start_on_enter {
            "moderator"
        } else {
            "wait-mod"
        });
        if self.end_on_exit {
            flags.push("endconf");
        }
        if !self.stay_alone {
            flags.push("mintwo");
        }
        flags.join("|")
    }

    pub fn record_file(&self) -> String {
        let name = match &self.record_file_name {
            Some(name) => name.clone(),
            None => format!(
                "{}_{}",
                chrono::Utc::now().format("%Y%m%d-%H%M%S"),
                self.room
            ),
        };
        format!(
            "{}/{}.{}",
            self.record_file_path.trim_end_matches('/'),
            name,
            self.record_file_format
        )
    }
}

fn sound_attr(instruction: &Instruction, name: &str) -> Result<Option<String>, FlowError> {
    match instruction.attr(name) {
        None => Ok(None),
        Some(v @ ("beep:1" | "beep:2")) => Ok(Some(v.to_string())),
        Some(v) => validate_url(v)
            .map(Some)
            .map_err(|e| FlowError::attribute(format!("Conference {}: {}", name, e))),
    }
}

fn member_event(event: &SwitchEvent, action: &str) -> bool {
    event.conference_action() == Some(action)
}

impl ConferenceVerb {
    pub fn fetch_context(
        &self,
        instruction: &Instruction,
        config: &CallConfig,
    ) -> Result<ConferenceContext, FlowError> {
        let room = instruction.text();
        if room.is_empty() {
            return Err(FlowError::attribute("Conference needs a room name"));
        }
        let record_file_format = instruction
            .attr_or("recordFileFormat", "mp3")
            .to_lowercase();
        if record_file_format != "mp3" && record_file_format != "wav" {
            return Err(FlowError::attribute(format!(
                "Conference recordFileFormat {} must be mp3 or wav",
                record_file_format
            )));
        }
        Ok(ConferenceContext {
            room: room.to_string(),
            muted: instruction.bool_attr("muted", false)?,
            enter_sound: sound_attr(instruction, "enterSound")?,
            exit_sound: sound_attr(instruction, "exitSound")?,
            start_on_enter: instruction.bool_attr("startConferenceOnEnter", true)?,
            end_on_exit: instruction.bool_attr("endConferenceOnExit", false)?,
            stay_alone: instruction.bool_attr("stayAlone", true)?,
            wait_sound: instruction.url_attr("waitSound")?,
            max_members: instruction.bounded_attr("maxMembers", 200, 1, i64::from(u32::MAX))?
                as u32,
            time_limit: instruction.bounded_attr("timeLimit", 0, 0, i64::MAX)? as u64,
            hangup_on_star: instruction.bool_attr("hangupOnStar", false)?,
            record: instruction.bool_attr("record", false)?,
            record_file_path: instruction
                .attr_or("recordFilePath", &config.record_path)
                .to_string(),
            record_file_format,
            record_file_name: instruction.attr("recordFileName").map(str::to_string),
            action: callback_attr(instruction, "action", "method")?,
            redirect: instruction.bool_attr("redirect", true)?,
            callback: callback_attr(instruction, "callbackUrl", "callbackMethod")?,
            digits_match: instruction
                .list_attr("digitsMatch")
                .into_iter()
                .filter(|d| !d.is_empty())
                .collect(),
            floor_event: instruction.bool_attr("floorEvent", false)?,
        })
    }

    async fn prepare_member(
        &self,
        producer: &PlanProducer,
        session: &Session,
        ctx: &ConferenceContext,
    ) -> Result<()> {
        let mut vars = vec![
            ("conference_max_members", ctx.max_members.to_string()),
            ("conference_member_flags", ctx.member_flags()),
        ];
        if let Some(url) = &ctx.wait_sound {
            let method = producer.config().http.default_method.clone();
            let prompts = producer.fetch_prompts(session, url, &method).await?;
            let parts = prompt_parts(&prompts, &producer.config().call)?;
            if !parts.is_empty() {
                vars.push(("conference_moh_sound", file_string(&parts)));
            }
        }
        futures::future::try_join_all(
            vars.iter()
                .map(|(name, value)| session.set_var(name, value)),
        )
        .await?;

        if ctx.time_limit > 0 {
            let kick = format!("conference {} kick all", ctx.room);
            if let Err(e) = Scheduler::replace_command(
                &session.instance()?.client(),
                &format!("conf_kick_{}", ctx.room),
                ctx.time_limit,
                &kick,
            )
            .await
            {
                warn!(session_id = %session.id(), room = %ctx.room, "time limit not armed: {}", e);
            }
        }
        Ok(())
    }

    /// Wait until the switch confirms the member. A window without news
    /// means the join is still in progress.
    async fn wait_joined(&self, producer: &PlanProducer, session: &Session) -> Option<SwitchEvent> {
        let window = producer.config().call.conference_join_window();
        loop {
            let event = session
                .wait_for_event(Some(window), true, |e| {
                    member_event(e, "add-member")
                        || e.is_execute_complete("conference")
                        || e.is(CHANNEL_HANGUP_COMPLETE)
                })
                .await;
            match event {
                Some(e) if member_event(&e, "add-member") => return Some(e),
                Some(_) => return None,
                None if session.is_hung_up() => return None,
                None => debug!(session_id = %session.id(), "still joining conference"),
            }
        }
    }

    async fn bind_digits(
        &self,
        session: &Session,
        ctx: &ConferenceContext,
        member: &ConferenceMember,
    ) -> Result<bool> {
        let mut bound = false;
        if let (Some(callback), false) = (&ctx.callback, ctx.digits_match.is_empty()) {
            let params = BTreeMap::from([
                ("ConferenceName".to_string(), member.name.clone()),
                ("ConferenceUUID".to_string(), member.uuid.clone()),
                ("ConferenceMemberID".to_string(), member.member_id.clone()),
            ]);
            bind_digit_callbacks(
                session,
                DIGIT_REALM,
                &ctx.digits_match,
                DigitBinding {
                    callback: callback.clone(),
                    digits_param: "ConferenceDigitsMatch".to_string(),
                    params,
                },
            )
            .await?;
            bound = true;
        }
        if ctx.hangup_on_star {
            if !bound {
                session.execute("digit_action_set_realm", DIGIT_REALM).await?;
            }
            session
                .execute(
                    "bind_digit_action",
                    &format!("{},*,exec:hangup", DIGIT_REALM),
                )
                .await?;
            bound = true;
        }
        Ok(bound)
    }
}

#[async_trait]
impl VerbHandler for ConferenceVerb {
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
        self.prepare_member(producer, session, &ctx).await?;

        let profile = &producer.config().call.conference_profile;
        session
            .execute("conference", &format!("{}@{}", ctx.room, profile))
            .await?;
        let Some(joined) = self.wait_joined(producer, session).await else {
            if session.is_hung_up() {
                return Ok(Outcome::Terminate);
            }
            warn!(session_id = %session.id(), room = %ctx.room, "conference left before joining");
            return Ok(Outcome::Continue);
        };

        let instance = session.instance()?;
        let conference_id = joined
            .present("Conference-Unique-ID")
            .unwrap_or(ctx.room.as_str())
            .to_string();
        let conference = instance.get_or_add_conference(&conference_id, &ctx.room);
        let member = ConferenceMember {
            name: ctx.room.clone(),
            uuid: conference_id,
            member_id: joined.present("Member-ID").unwrap_or_default().to_string(),
        };
        conference.add_member(member.member_id.clone());
        info!(
            session_id = %session.id(),
            room = %ctx.room,
            member_id = %member.member_id,
            "joined conference"
        );

        if let Some(callback) = &ctx.callback {
            let mut signals = vec![Signal::ConferenceEnter {
                callback: callback.clone(),
                member: member.clone(),
            }];
            if joined.is_true("Floor")
                && joined.is_true("Speak")
                && joined.header("Conference-Size") == Some("1")
            {
                signals.push(Signal::ConferenceFloor {
                    callback: callback.clone(),
                    member: member.clone(),
                });
            }
            producer.signals().dispatch_all(signals, Some(session.as_ref()));
        }

        let bound = self.bind_digits(session, &ctx, &member).await?;
        let record_file = if ctx.record {
            let file = ctx.record_file();
            session
                .command(&format!("conference {} record {}", ctx.room, file))
                .await?;
            Some(file)
        } else {
            None
        };
        if let Some(sound) = &ctx.enter_sound {
            session
                .command(&format!("conference {} play {}", ctx.room, sound_path(sound)))
                .await?;
        }

        loop {
            let event = session
                .wait_for_event(None, true, |e| {
                    member_event(e, "floor-change")
                        || member_event(e, "del-member")
                        || e.is_execute_complete("conference")
                        || e.is(CHANNEL_HANGUP_COMPLETE)
                })
                .await;
            match event {
                Some(e) if member_event(&e, "floor-change") => {
                    if let (true, Some(callback)) = (ctx.floor_event, &ctx.callback) {
                        producer.signals().dispatch(
                            Signal::ConferenceFloor {
                                callback: callback.clone(),
                                member: member.clone(),
                            },
                            Some(session.as_ref()),
                        );
                    }
                }
                Some(_) => break,
                None if session.is_hung_up() => break,
                None => {}
            }
        }

        session.disarm_digit_callback(DIGIT_REALM);
        if bound && !session.is_hung_up() {
            session.execute("clear_digit_action", DIGIT_REALM).await?;
        }
        conference.remove_member(&member.member_id);
        info!(session_id = %session.id(), room = %ctx.room, "left conference");

        if let Some(callback) = &ctx.callback {
            producer.signals().dispatch(
                Signal::ConferenceExit {
                    callback: callback.clone(),
                    member: member.clone(),
                },
                Some(session.as_ref()),
            );
        }
        if let Some(sound) = &ctx.exit_sound {
            session
                .command(&format!("conference {} play {}", ctx.room, sound_path(sound)))
                .await?;
        }

        let mut params = BTreeMap::from([
            ("ConferenceName".to_string(), member.name),
            ("ConferenceUUID".to_string(), member.uuid),
            ("ConferenceMemberID".to_string(), member.member_id),
        ]);
        if let Some(file) = record_file {
            params.insert("RecordFile".to_string(), file);
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
