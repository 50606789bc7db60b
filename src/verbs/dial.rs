use super::media::{file_string, prompt_parts};
use super::{
    bind_digit_callbacks, callback_attr, clear_digit_callbacks, report, Outcome, VerbHandler,
};
use crate::config::CallConfig;
use crate::error::FlowError;
use crate::plan::{Instruction, PlanProducer, VerbKind};
use crate::registry::{Callback, DigitBinding, Session};
use crate::signal::Signal;
use crate::switch::event::{CHANNEL_BRIDGE, CHANNEL_HANGUP_COMPLETE, CHANNEL_UNBRIDGE, UNDEF};
use crate::switch::SwitchEvent;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DIGIT_REALM: &str = "flowswitch_dial";
const LEG_SEPARATOR: &str = ":_:";
const FAILOVER_SEPARATOR: &str = "|";
const US_RINGBACK: &str = "%(2000,4000,440,480)";

pub struct DialVerb;

/// One `Number` inside a `Dial`.
#[derive(Debug, Clone)]
pub struct NumberSpec {
    pub number: String,
    pub gateways: Vec<String>,
    pub codecs: Vec<String>,
    pub timeouts: Vec<String>,
    pub retries: Vec<u32>,
    pub extra_dial_string: Option<String>,
    pub send_digits: Option<String>,
    pub send_on_preanswer: bool,
}

impl NumberSpec {
    pub fn from_instruction(instruction: &Instruction) -> Result<Self, FlowError> {
        let number = instruction.text();
        if number.is_empty() {
            return Err(FlowError::attribute("Number needs a destination"));
        }
        let gateways: Vec<String> = instruction
            .list_attr("gateways")
            .into_iter()
            .filter(|g| !g.is_empty())
            .collect();
        if gateways.is_empty() {
            return Err(FlowError::attribute(format!(
                "Number {} needs at least one gateway",
                number
            )));
        }
        let retries = instruction
            .list_attr("gatewayRetries")
            .iter()
            .map(|r| match r.as_str() {
                "" => Ok(1),
                r => r
                    .parse::<u32>()
                    .ok()
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| {
                        FlowError::attribute(format!("Number gatewayRetries {} invalid", r))
                    }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        for timeout in instruction.list_attr("gatewayTimeouts") {
            if !timeout.is_empty() && timeout.parse::<u32>().is_err() {
                return Err(FlowError::attribute(format!(
                    "Number gatewayTimeouts {} invalid",
                    timeout
                )));
            }
        }
        Ok(Self {
            number: number.to_string(),
            gateways,
            codecs: instruction.list_attr("gatewayCodecs"),
            timeouts: instruction.list_attr("gatewayTimeouts"),
            retries,
            extra_dial_string: instruction.attr("extraDialString").map(str::to_string),
            send_digits: instruction.attr("sendDigits").map(str::to_string),
            send_on_preanswer: instruction.bool_attr("sendOnPreanswer", false)?,
        })
    }

    /// Channel variables for the leg placed through gateway `index`.
    fn leg_options(&self, index: usize) -> Vec<String> {
        let mut options = Vec::new();
        if let Some(timeout) = self.timeouts.get(index).filter(|t| !t.is_empty()) {
            options.push(format!("leg_timeout={}", timeout));
        }
        if let Some(codecs) = self.codecs.get(index).filter(|c| !c.is_empty()) {
            options.push(format!("absolute_codec_string=^^:{}", codecs));
        }
        if let Some(digits) = &self.send_digits {
            let hook = if self.send_on_preanswer {
                "execute_on_pre_answer"
            } else {
                "execute_on_answer"
            };
            options.push(format!("{}='send_dtmf {}'", hook, digits));
        }
        if let Some(extra) = &self.extra_dial_string {
            options.push(extra.clone());
        }
        options
    }

    /// Every attempt for this number: gateways in order, each repeated by
    /// its retry count.
    pub fn attempts(&self) -> Vec<String> {
        let mut attempts = Vec::new();
        for (index, gateway) in self.gateways.iter().enumerate() {
            let options = self.leg_options(index);
            let prefix = if options.is_empty() {
                String::new()
            } else {
                format!("[{}]", options.join(","))
            };
            let tuple = format!("{}{}{}", prefix, gateway, self.number);
            let retries = self.retries.get(index).copied().unwrap_or(1);
            for _ in 0..retries {
                attempts.push(tuple.clone());
            }
        }
        attempts
    }
}

#[derive(Debug)]
pub struct DialContext {
    pub action: Option<Callback>,
    pub redirect: bool,
    pub callback: Option<Callback>,
    pub hangup_on_star: bool,
    pub time_limit: u64,
    pub timeout: Option<u64>,
    pub caller_id: Option<String>,
    pub caller_name: Option<String>,
    pub confirm_sound: Option<String>,
    pub confirm_key: Option<String>,
    pub dial_music: Option<String>,
    pub digits_match: Vec<String>,
    pub sip_headers: Vec<(String, String)>,
    pub numbers: Vec<NumberSpec>,
}

impl DialContext {
    /// Variables shared by every leg of the bridge.
    fn global_options(&self, a_leg: &str, confirm_file: Option<&str>) -> Vec<String> {
        let mut options = vec![format!("flowswitch_aleg_uuid={}", a_leg)];
        if let Some(caller_id) = &self.caller_id {
            options.push(format!("origination_caller_id_number={}", caller_id));
        }
        if let Some(name) = &self.caller_name {
            options.push(format!("origination_caller_id_name='{}'", name));
        }
        if let Some(timeout) = self.timeout {
            options.push(format!("call_timeout={}", timeout));
        }
        if self.dial_music.is_some() {
            options.push("ignore_early_media=true".to_string());
        }
        if let (Some(file), Some(key)) = (confirm_file, &self.confirm_key) {
            options.push(format!("group_confirm_file={}", file));
            options.push(format!("group_confirm_key={}", key));
        }
        for (name, value) in &self.sip_headers {
            options.push(format!("sip_h_{}={}", name, value));
        }
        options
    }

    pub fn dial_string(&self, a_leg: &str, confirm_file: Option<&str>) -> String {
        let legs = self
            .numbers
            .iter()
            .map(|n| n.attempts().join(FAILOVER_SEPARATOR))
            .collect::<Vec<_>>()
            .join(LEG_SEPARATOR);
        format!(
            "<{}>{}",
            self.global_options(a_leg, confirm_file).join(","),
            legs
        )
    }
}

impl DialVerb {
    pub fn fetch_context(
        &self,
        instruction: &Instruction,
        _config: &CallConfig,
    ) -> Result<DialContext, FlowError> {
        let numbers = instruction
            .children
            .iter()
            .filter(|c| c.kind == VerbKind::Number)
            .map(NumberSpec::from_instruction)
            .collect::<Result<Vec<_>, _>>()?;
        if numbers.is_empty() {
            return Err(FlowError::attribute("Dial needs at least one Number"));
        }
        let timeout = match instruction.int_attr("timeout", -1)? {
            t if t < 0 => None,
            0 => return Err(FlowError::attribute("Dial timeout must be positive")),
            t => Some(t as u64),
        };
        let sip_headers = instruction
            .list_attr("sipHeaders")
            .into_iter()
            .filter(|h| !h.is_empty())
            .map(|h| match h.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() => {
                    Ok((k.trim().to_string(), v.trim().to_string()))
                }
                _ => Err(FlowError::attribute(format!(
                    "Dial sipHeaders entry {} is not name=value",
                    h
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let confirm_key = instruction.attr("confirmKey").map(str::to_string);
        if let Some(key) = &confirm_key {
            if key.len() != 1 || !"1234567890*#".contains(key.as_str()) {
                return Err(FlowError::attribute(format!(
                    "Dial confirmKey {} must be one key",
                    key
                )));
            }
        }
        let dial_music = match instruction.attr("dialMusic") {
            None => None,
            Some("real") => Some("real".to_string()),
            Some(_) => instruction.url_attr("dialMusic")?,
        };
        Ok(DialContext {
            action: callback_attr(instruction, "action", "method")?,
            redirect: instruction.bool_attr("redirect", true)?,
            callback: callback_attr(instruction, "callbackUrl", "callbackMethod")?,
            hangup_on_star: instruction.bool_attr("hangupOnStar", false)?,
            time_limit: instruction.bounded_attr("timeLimit", 0, 0, i64::MAX)? as u64,
            timeout,
            caller_id: instruction.attr("callerId").map(str::to_string),
            caller_name: instruction.attr("callerName").map(str::to_string),
            confirm_sound: instruction.url_attr("confirmSound")?,
            confirm_key,
            dial_music,
            digits_match: instruction
                .list_attr("digitsMatch")
                .into_iter()
                .filter(|d| !d.is_empty())
                .collect(),
            sip_headers,
            numbers,
        })
    }

    /// Fetch a prompt document and flatten it into one playback string.
    async fn fetch_playback(
        &self,
        producer: &PlanProducer,
        session: &Session,
        url: &str,
    ) -> Result<Option<String>> {
        let method = producer.config().http.default_method.clone();
        let prompts = producer.fetch_prompts(session, url, &method).await?;
        let parts = prompt_parts(&prompts, &producer.config().call)?;
        Ok(if parts.is_empty() {
            None
        } else {
            Some(file_string(&parts))
        })
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty() && v != UNDEF)
}

async fn read_cause(session: &Session, name: &str) -> Option<String> {
    match session.get_var(name).await {
        Ok(value) => present(value),
        Err(e) => {
            warn!(session_id = %session.id(), "could not read {}: {}", name, e);
            None
        }
    }
}

/// Why the dial ended, tagged with the leg the cause belongs to.
///
/// The originate disposition on the terminal event wins unless it is the
/// generic `SUCCESS` and the session already knows a cause; then the
/// session's cause, then `bridge_hangup_cause` and `hangup_cause` read from
/// the switch, then `NORMAL_CLEARING`.
pub async fn resolve_hangup_cause(session: &Session, event: Option<&SwitchEvent>) -> String {
    let session_cause = session.hangup_cause();
    if let Some(disposition) = event.and_then(|e| e.variable("originate_disposition")) {
        if !(disposition == "SUCCESS" && session_cause.is_some()) {
            let leg = if disposition == "ORIGINATOR_CANCEL" {
                "A"
            } else {
                "B"
            };
            return format!("{} ({} leg)", disposition, leg);
        }
    }
    if let Some(cause) = present(session_cause) {
        return format!("{} (A leg)", cause);
    }
    if let Some(cause) = read_cause(session, "bridge_hangup_cause").await {
        return format!("{} (B leg)", cause);
    }
    if let Some(cause) = read_cause(session, "hangup_cause").await {
        return format!("{} (A leg)", cause);
    }
    "NORMAL_CLEARING (B leg)".to_string()
}

#[async_trait]
impl VerbHandler for DialVerb {
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
        let a_leg = session.id().to_string();

        let mut vars: Vec<(&str, String)> = vec![
            ("hangup_after_bridge", "false".to_string()),
            ("continue_on_fail", "true".to_string()),
        ];
        if ctx.hangup_on_star {
            vars.push(("bridge_terminate_key", "*".to_string()));
        }
        match ctx.dial_music.as_deref() {
            Some("real") => vars.push(("ringback", US_RINGBACK.to_string())),
            Some(url) => {
                if let Some(music) = self.fetch_playback(producer, session, url).await? {
                    vars.push(("instant_ringback", "true".to_string()));
                    vars.push(("ringback", music.clone()));
                    vars.push(("transfer_ringback", music));
                }
            }
            None => {}
        }
        let confirm_file = match &ctx.confirm_sound {
            Some(url) => self.fetch_playback(producer, session, url).await?,
            None => None,
        };
        futures::future::try_join_all(vars.iter().map(|(name, value)| session.set_var(name, value)))
            .await?;

        if ctx.time_limit > 0 {
            match producer
                .scheduler()
                .arm_hangup(&session.instance()?, &a_leg, ctx.time_limit, "ALLOTTED_TIMEOUT")
                .await
            {
                Ok(entry) => session.set_scheduled_hangup_id(Some(entry.id)),
                Err(e) => warn!(session_id = %a_leg, "time limit not armed: {}", e),
            }
        }

        if let Some(callback) = &ctx.callback {
            if !ctx.digits_match.is_empty() {
                bind_digit_callbacks(
                    session,
                    DIGIT_REALM,
                    &ctx.digits_match,
                    DigitBinding {
                        callback: callback.clone(),
                        digits_param: "DialDigitsMatch".to_string(),
                        params: BTreeMap::new(),
                    },
                )
                .await?;
            }
        }

        // completions from an earlier bridge must not end this one
        session.events().discard(|e| {
            e.is_execute_complete("bridge") || e.is(CHANNEL_BRIDGE) || e.is(CHANNEL_UNBRIDGE)
        });
        let dial_string = ctx.dial_string(&a_leg, confirm_file.as_deref());
        info!(session_id = %a_leg, dial_string = %dial_string, "dialing");
        session.execute("bridge", &dial_string).await?;

        let mut b_leg: Option<String> = None;
        let terminal = loop {
            let event = session
                .wait_for_event(None, true, |e| {
                    e.is(CHANNEL_BRIDGE)
                        || e.is(CHANNEL_UNBRIDGE)
                        || e.is_execute_complete("bridge")
                        || e.is(CHANNEL_HANGUP_COMPLETE)
                })
                .await;
            match event {
                Some(e) if e.is(CHANNEL_BRIDGE) => {
                    let other = e.other_leg().unwrap_or_default().to_string();
                    info!(session_id = %a_leg, b_leg = %other, "bridged");
                    if let Some(callback) = &ctx.callback {
                        producer.signals().dispatch(
                            Signal::DialBridge {
                                callback: callback.clone(),
                                a_leg: a_leg.clone(),
                                b_leg: other.clone(),
                            },
                            Some(session.as_ref()),
                        );
                    }
                    b_leg = Some(other);
                }
                None if !session.is_hung_up() => {
                    debug!(session_id = %a_leg, "bridge still up");
                }
                other => break other,
            }
        };

        clear_digit_callbacks(session, DIGIT_REALM).await?;

        let cause = resolve_hangup_cause(session, terminal.as_ref()).await;
        info!(session_id = %a_leg, cause = %cause, "dial finished");
        let b_leg_id = b_leg.clone().unwrap_or_default();
        if let (Some(callback), Some(b_leg)) = (&ctx.callback, &b_leg) {
            producer.signals().dispatch(
                Signal::DialHangup {
                    callback: callback.clone(),
                    a_leg: a_leg.clone(),
                    b_leg: b_leg.clone(),
                    cause: cause.clone(),
                },
                Some(session.as_ref()),
            );
        }

        let params = BTreeMap::from([
            (
                "DialRingStatus".to_string(),
                b_leg.is_some().to_string(),
            ),
            ("DialHangupCause".to_string(), cause),
            ("DialALegUUID".to_string(), a_leg),
            ("DialBLegUUID".to_string(), b_leg_id),
        ]);
        Ok(report(
            producer,
            session,
            ctx.action.as_ref(),
            ctx.redirect,
            params,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::parse_document;

    fn dial(xml: &str) -> DialContext {
        let plan = parse_document(xml).unwrap();
        DialVerb
            .fetch_context(&plan[0], &CallConfig::default())
            .unwrap()
    }

    #[test]
    fn test_attempt_count_is_sum_of_retries() {
        let ctx = dial(
            r#"<Response><Dial>
                <Number gateways="sofia/gateway/a/,sofia/gateway/b/" gatewayRetries="2,3">100</Number>
                <Number gateways="sofia/gateway/c/">200</Number>
                <Number gateways="sofia/gateway/d/,sofia/gateway/e/" gatewayRetries="1">300</Number>
            </Dial></Response>"#,
        );
        let dial_string = ctx.dial_string("leg-a", None);
        let legs = dial_string
            .split_once('>')
            .unwrap()
            .1
            .split(LEG_SEPARATOR)
            .collect::<Vec<_>>();
        assert_eq!(legs.len(), 3);
        let tuples = legs
            .iter()
            .flat_map(|l| l.split(FAILOVER_SEPARATOR))
            .collect::<Vec<_>>();
        assert_eq!(tuples.len(), 2 + 3 + 1 + 2);
        assert_eq!(
            tuples,
            vec![
                "sofia/gateway/a/100",
                "sofia/gateway/a/100",
                "sofia/gateway/b/100",
                "sofia/gateway/b/100",
                "sofia/gateway/b/100",
                "sofia/gateway/c/200",
                "sofia/gateway/d/300",
                "sofia/gateway/e/300",
            ]
        );
    }

    #[test]
    fn test_leg_options_and_globals() {
        let ctx = dial(
            r#"<Response><Dial callerId="5551000" timeout="20" sipHeaders="X-Tag=a">
                <Number gateways="sofia/gateway/a/" gatewayCodecs="PCMU:PCMA" gatewayTimeouts="15"
                        sendDigits="1w2">100</Number>
            </Dial></Response>"#,
        );
        assert_eq!(
            ctx.dial_string("leg-a", None),
            "<flowswitch_aleg_uuid=leg-a,origination_caller_id_number=5551000,call_timeout=20,sip_h_X-Tag=a>\
             [leg_timeout=15,absolute_codec_string=^^:PCMU:PCMA,execute_on_answer='send_dtmf 1w2']\
             sofia/gateway/a/100"
        );
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let config = CallConfig::default();
        for xml in [
            "<Response><Dial/></Response>",
            r#"<Response><Dial><Number>100</Number></Dial></Response>"#,
            r#"<Response><Dial><Number gateways="gw/" gatewayRetries="0">100</Number></Dial></Response>"#,
            r#"<Response><Dial timeout="0"><Number gateways="gw/">100</Number></Dial></Response>"#,
        ] {
            let plan = parse_document(xml).unwrap();
            assert!(DialVerb.fetch_context(&plan[0], &config).is_err(), "{}", xml);
        }
    }
}
