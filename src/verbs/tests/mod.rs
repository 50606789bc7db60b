//! Verbs driven end to end against a scripted switch.

use super::{handler, Outcome};
use crate::config::Config;
use crate::error::{flow_error, FlowError};
use crate::plan::{Instruction, VerbKind};
use crate::signal::WebhookRequest;
use crate::switch::event::{
    CHANNEL_BRIDGE, CHANNEL_HANGUP_COMPLETE, CHANNEL_PARK, CHANNEL_UNBRIDGE,
    CONFERENCE_MAINTENANCE, DETECTED_SPEECH,
};
use crate::switch::SwitchEvent;
use crate::testing::CallHarness;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

fn instruction(h: &CallHarness, xml: &str) -> Instruction {
    h.producer.build_plan(xml).unwrap().remove(0)
}

async fn run(h: &CallHarness, instruction: &Instruction) -> Result<Outcome> {
    handler(instruction.kind)
        .unwrap()
        .execute(&h.producer, &h.session, instruction)
        .await
}

fn redirect_of(outcome: Outcome) -> WebhookRequest {
    match outcome {
        Outcome::Redirect(request) => request,
        other => panic!("expected a redirect, got {:?}", other),
    }
}

/// Wait until the verb under test has executed `app` at least once.
async fn executed(h: &CallHarness, app: &str) {
    for _ in 0..200 {
        if !h.switch.executed_args(app).is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} was never executed", app);
}

fn ringing_harness() -> CallHarness {
    let origin = SwitchEvent::new(CHANNEL_PARK)
        .with_header("Unique-ID", "leg-a")
        .with_header("Caller-Destination-Number", "1000")
        .with_header("Caller-Caller-ID-Number", "2000")
        .with_header("Answer-State", "ringing");
    CallHarness::with_origin(Config::default(), origin)
}

#[tokio::test]
async fn test_dial_two_numbers_with_time_limit() {
    let h = CallHarness::new();
    let dial = instruction(
        &h,
        r#"<Response>
            <Dial timeLimit="30" action="http://app/dialed" callbackUrl="http://app/events">
                <Number gateways="sofia/gateway/gw1/">1001</Number>
                <Number gateways="sofia/gateway/gw2/">1002</Number>
            </Dial>
        </Response>"#,
    );

    let running = {
        let producer = h.producer.clone();
        let session = h.session.clone();
        let dial = dial.clone();
        tokio::spawn(async move {
            handler(dial.kind)
                .unwrap()
                .execute(&producer, &session, &dial)
                .await
        })
    };
    executed(&h, "bridge").await;
    h.deliver(
        SwitchEvent::new(CHANNEL_BRIDGE)
            .with_header("Unique-ID", "leg-a")
            .with_header("Other-Leg-Unique-ID", "leg-b"),
    );
    h.deliver(
        SwitchEvent::new(CHANNEL_UNBRIDGE)
            .with_header("Unique-ID", "leg-a")
            .with_variable("originate_disposition", "ORIGINATOR_CANCEL"),
    );
    let request = redirect_of(running.await.unwrap().unwrap());

    let dial_string = &h.switch.executed_args("bridge")[0];
    assert!(dial_string.starts_with("<flowswitch_aleg_uuid=leg-a"));
    assert!(dial_string.ends_with(">sofia/gateway/gw1/1001:_:sofia/gateway/gw2/1002"));

    let armed = h
        .switch
        .api_commands()
        .into_iter()
        .find(|c| c.ends_with("uuid_kill leg-a ALLOTTED_TIMEOUT"))
        .expect("time limit armed");
    let id = armed.split_whitespace().nth(2).unwrap();
    assert_eq!(h.instance.get_scheduled_hangup(id).unwrap().timeout, 30);

    assert_eq!(request.url, "http://app/dialed");
    assert_eq!(
        request.params.get("DialHangupCause").map(String::as_str),
        Some("ORIGINATOR_CANCEL (A leg)")
    );
    assert_eq!(request.params.get("DialRingStatus").map(String::as_str), Some("true"));
    assert_eq!(request.params.get("DialBLegUUID").map(String::as_str), Some("leg-b"));

    let events = h.transport.wait_for_requests(2).await;
    let mut actions = events
        .iter()
        .filter(|r| r.url == "http://app/events")
        .filter_map(|r| r.params.get("DialAction").cloned())
        .collect::<Vec<_>>();
    actions.sort();
    assert_eq!(actions, vec!["answer", "hangup"]);
}

#[tokio::test]
async fn test_dial_cause_read_from_switch() {
    let h = CallHarness::new();
    h.switch.set_var("bridge_hangup_cause", "NO_ANSWER");
    let dial = instruction(
        &h,
        r#"<Response><Dial action="http://app/dialed" redirect="false">
            <Number gateways="sofia/gateway/gw1/">1001</Number>
        </Dial></Response>"#,
    );
    // a completion left over from an earlier bridge must not end this dial
    h.complete("bridge");

    let running = {
        let producer = h.producer.clone();
        let session = h.session.clone();
        let dial = dial.clone();
        tokio::spawn(async move {
            handler(dial.kind)
                .unwrap()
                .execute(&producer, &session, &dial)
                .await
        })
    };
    executed(&h, "bridge").await;
    h.complete("bridge");
    assert_eq!(running.await.unwrap().unwrap(), Outcome::Continue);

    let notified = h.transport.wait_for_requests(1).await;
    assert_eq!(notified.len(), 1);
    assert_eq!(
        notified[0].params.get("DialHangupCause").map(String::as_str),
        Some("NO_ANSWER (B leg)")
    );
    assert_eq!(
        notified[0].params.get("DialRingStatus").map(String::as_str),
        Some("false")
    );
}

#[tokio::test]
async fn test_dial_digit_bindings_are_cleared() {
    let h = CallHarness::new();
    let dial = instruction(
        &h,
        r#"<Response><Dial callbackUrl="http://app/events" digitsMatch="*1">
            <Number gateways="sofia/gateway/gw1/">1001</Number>
        </Dial></Response>"#,
    );
    let running = {
        let producer = h.producer.clone();
        let session = h.session.clone();
        let dial = dial.clone();
        tokio::spawn(async move {
            handler(dial.kind)
                .unwrap()
                .execute(&producer, &session, &dial)
                .await
        })
    };
    executed(&h, "bridge").await;
    assert!(h.session.digit_callback("flowswitch_dial").is_some());
    h.complete("bridge");
    running.await.unwrap().unwrap();

    assert_eq!(
        h.switch.executed_args("bind_digit_action"),
        vec![
            "flowswitch_dial,*1,exec:event,^^;Event-Subclass=flowswitch::digits_match;\
             Digits-Realm=flowswitch_dial;Digits-Match=*1"
        ]
    );
    assert_eq!(h.switch.executed_args("clear_digit_action"), vec!["flowswitch_dial"]);
    assert!(h.session.digit_callback("flowswitch_dial").is_none());
}

#[tokio::test]
async fn test_get_digits_timeout_omits_digits() {
    let h = CallHarness::new();
    let verb = instruction(
        &h,
        r#"<Response><GetDigits action="http://app/menu" numDigits="4"/></Response>"#,
    );
    h.complete("play_and_get_digits");
    let request = redirect_of(run(&h, &verb).await.unwrap());
    assert_eq!(request.url, "http://app/menu");
    assert!(!request.params.contains_key("Digits"));
    assert_eq!(h.switch.executed_args("unset"), vec!["flowswitch_get_digits"]);
}

#[tokio::test]
async fn test_get_digits_reports_collected_digits() {
    let h = CallHarness::new();
    h.switch.set_var("flowswitch_get_digits", "1234");
    let verb = instruction(
        &h,
        r#"<Response><GetDigits action="http://app/menu">
            <Play>http://media/menu.wav</Play>
        </GetDigits></Response>"#,
    );
    h.complete("play_and_get_digits");
    let request = redirect_of(run(&h, &verb).await.unwrap());
    assert_eq!(request.params.get("Digits").map(String::as_str), Some("1234"));
    assert!(h.switch.executed_args("play_and_get_digits")[0]
        .contains("file_string://silence_stream://10!http_cache://http://media/menu.wav"));
}

#[tokio::test]
async fn test_get_digits_stops_on_hangup() {
    let h = CallHarness::new();
    let verb = instruction(&h, r#"<Response><GetDigits action="http://app/menu"/></Response>"#);
    h.session
        .mark_hung_up(SwitchEvent::new(CHANNEL_HANGUP_COMPLETE).with_header("Hangup-Cause", "NORMAL_CLEARING"));
    assert_eq!(run(&h, &verb).await.unwrap(), Outcome::Terminate);
}

#[tokio::test]
async fn test_conference_enter_precedes_floor() {
    let h = CallHarness::new();
    let verb = instruction(
        &h,
        r#"<Response><Conference callbackUrl="http://app/conf">sales</Conference></Response>"#,
    );
    h.deliver(
        SwitchEvent::custom(CONFERENCE_MAINTENANCE)
            .with_header("Unique-ID", "leg-a")
            .with_header("Action", "add-member")
            .with_header("Conference-Unique-ID", "conf-1")
            .with_header("Member-ID", "7")
            .with_header("Floor", "true")
            .with_header("Speak", "true")
            .with_header("Conference-Size", "1"),
    );
    h.deliver(
        SwitchEvent::custom(CONFERENCE_MAINTENANCE)
            .with_header("Unique-ID", "leg-a")
            .with_header("Action", "del-member")
            .with_header("Member-ID", "7"),
    );
    assert_eq!(run(&h, &verb).await.unwrap(), Outcome::Continue);

    assert_eq!(h.switch.executed_args("conference"), vec!["sales@default"]);
    assert!(h
        .switch
        .executed_args("set")
        .contains(&"conference_member_flags=moderator".to_string()));
    let conference = h.instance.get_conference("conf-1").unwrap();
    assert_eq!(conference.room(), "sales");
    assert_eq!(conference.member_count(), 0);

    let requests = h.transport.wait_for_requests(3).await;
    let actions = requests
        .iter()
        .filter_map(|r| r.params.get("ConferenceAction").map(String::as_str))
        .collect::<Vec<_>>();
    let enter = actions.iter().position(|a| *a == "enter").unwrap();
    let floor = actions.iter().position(|a| *a == "floor").unwrap();
    assert!(enter < floor);
    assert!(actions.contains(&"exit"));
    assert!(requests
        .iter()
        .all(|r| r.params.get("ConferenceMemberID").map(String::as_str) == Some("7")));
}

#[tokio::test]
async fn test_record_both_legs_reports_unknown_duration() {
    let h = CallHarness::new();
    let verb = instruction(
        &h,
        r#"<Response><Record bothLegs="true" action="http://app/recorded" maxLength="20"
                filePath="/rec" fileName="call"/></Response>"#,
    );
    let request = redirect_of(run(&h, &verb).await.unwrap());
    assert_eq!(request.params.get("RecordingDuration").map(String::as_str), Some("-1"));
    assert_eq!(request.params.get("RecordingDurationMs").map(String::as_str), Some("-1"));
    assert_eq!(request.params.get("Digits").map(String::as_str), Some(""));
    assert_eq!(request.params.get("RecordFile").map(String::as_str), Some("/rec/call.mp3"));

    let api = h.switch.api_commands();
    assert!(api.contains(&"uuid_record leg-a start /rec/call.mp3".to_string()));
    assert!(api.contains(&"sched_api +20 none uuid_record leg-a stop /rec/call.mp3".to_string()));
}

#[tokio::test]
async fn test_record_single_leg_reads_duration() {
    let h = CallHarness::new();
    h.switch.set_var("record_ms", "4200");
    h.switch.set_var("playback_terminator_used", "#");
    let verb = instruction(
        &h,
        r#"<Response><Record action="http://app/recorded" filePath="/rec" fileName="msg"
                fileFormat="wav" timeout="5"/></Response>"#,
    );
    h.complete("playback");
    h.complete("record");
    let request = redirect_of(run(&h, &verb).await.unwrap());
    assert_eq!(request.params.get("RecordingDuration").map(String::as_str), Some("4"));
    assert_eq!(request.params.get("RecordingDurationMs").map(String::as_str), Some("4200"));
    assert_eq!(request.params.get("Digits").map(String::as_str), Some("#"));
    assert_eq!(h.switch.executed_args("record"), vec!["/rec/msg.wav 60 500 5"]);
}

#[tokio::test]
async fn test_pre_answer_runs_children_and_restores_frame() {
    let h = ringing_harness();
    let plan = h
        .producer
        .build_plan(
            r#"<Response>
                <PreAnswer><Play>http://media/early.wav</Play></PreAnswer>
                <Hangup reason="busy"/>
            </Response>"#,
        )
        .unwrap();
    h.complete("playback");
    let outcome = h.producer.execute_sequence(&h.session, plan).await.unwrap();
    assert_eq!(outcome, Outcome::Terminate);

    let apps = h
        .switch
        .executed()
        .into_iter()
        .map(|(app, _)| app)
        .collect::<Vec<_>>();
    assert_eq!(apps, vec!["pre_answer", "playback", "hangup"]);
    assert_eq!(h.session.frame_depth(), 0);
    assert_eq!(h.session.current_verb(), None);
}

#[tokio::test]
async fn test_sip_transfer_deflects_answered_call() {
    let h = CallHarness::new();
    let verb = instruction(
        &h,
        "<Response><SIPTransfer>sip:bob@example.com,sip:carol@example.com</SIPTransfer></Response>",
    );
    assert_eq!(run(&h, &verb).await.unwrap(), Outcome::Terminate);
    assert_eq!(h.switch.executed_args("deflect"), vec!["sip:bob@example.com"]);
    assert!(h.switch.executed_args("redirect").is_empty());
}

#[tokio::test]
async fn test_sip_transfer_redirects_ringing_call() {
    let h = ringing_harness();
    let verb = instruction(
        &h,
        "<Response><SIPTransfer>sip:bob@example.com, sip:carol@example.com</SIPTransfer></Response>",
    );
    assert_eq!(run(&h, &verb).await.unwrap(), Outcome::Terminate);
    assert_eq!(
        h.switch.executed_args("redirect"),
        vec!["sip:bob@example.com,sip:carol@example.com"]
    );
}

#[tokio::test]
async fn test_scheduled_hangup_continues_plan() {
    let h = CallHarness::new();
    let verb = instruction(&h, r#"<Response><Hangup schedule="60" reason="busy"/></Response>"#);
    assert_eq!(run(&h, &verb).await.unwrap(), Outcome::Continue);
    assert_eq!(h.instance.scheduled_hangup_count(), 1);
    assert!(h
        .switch
        .api_commands()
        .iter()
        .any(|c| c.starts_with("sched_api +60 ") && c.ends_with("uuid_kill leg-a USER_BUSY")));
    assert!(h.switch.executed_args("hangup").is_empty());
}

#[tokio::test]
async fn test_immediate_hangup_keeps_reason() {
    let h = CallHarness::new();
    let verb = instruction(&h, r#"<Response><Hangup reason="rejected"/></Response>"#);
    assert_eq!(run(&h, &verb).await.unwrap(), Outcome::Terminate);
    assert_eq!(h.switch.executed_args("hangup"), vec!["CALL_REJECTED"]);
    assert_eq!(h.session.hangup_cause().as_deref(), Some("CALL_REJECTED"));
}

#[tokio::test]
async fn test_dial_outlives_event_timeout() {
    let mut config = Config::default();
    config.call.event_timeout_secs = 1;
    let h = CallHarness::with_config(config);
    let dial = instruction(
        &h,
        r#"<Response><Dial><Number gateways="sofia/gateway/gw1/">1001</Number></Dial></Response>"#,
    );
    let running = {
        let producer = h.producer.clone();
        let session = h.session.clone();
        let dial = dial.clone();
        tokio::spawn(async move {
            handler(dial.kind)
                .unwrap()
                .execute(&producer, &session, &dial)
                .await
        })
    };
    executed(&h, "bridge").await;
    h.deliver(
        SwitchEvent::new(CHANNEL_BRIDGE)
            .with_header("Unique-ID", "leg-a")
            .with_header("Other-Leg-Unique-ID", "leg-b"),
    );
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!running.is_finished(), "a quiet bridge must keep the dial running");

    h.switch.set_var("hangup_cause", "NORMAL_CLEARING");
    h.deliver(SwitchEvent::new(CHANNEL_UNBRIDGE).with_header("Unique-ID", "leg-a"));
    assert_eq!(running.await.unwrap().unwrap(), Outcome::Continue);
}

#[tokio::test]
async fn test_speak_waits_for_each_loop() {
    let h = CallHarness::new();
    let verb = instruction(&h, r#"<Response><Speak loop="3">hello</Speak></Response>"#);
    h.complete("speak");
    h.complete("speak");
    let running = {
        let producer = h.producer.clone();
        let session = h.session.clone();
        let verb = verb.clone();
        tokio::spawn(async move {
            handler(verb.kind)
                .unwrap()
                .execute(&producer, &session, &verb)
                .await
        })
    };
    for _ in 0..200 {
        if h.switch.executed_args("speak").len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.switch.executed_args("speak"), vec!["flite|slt|hello"; 3]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!running.is_finished());

    h.complete("speak");
    assert_eq!(running.await.unwrap().unwrap(), Outcome::Continue);
    assert_eq!(h.switch.executed_args("speak").len(), 3);
}

#[tokio::test]
async fn test_play_loop_zero_is_capped() {
    let mut config = Config::default();
    config.call.max_loop = 3;
    let h = CallHarness::with_config(config);
    let verb = instruction(&h, r#"<Response><Play loop="0">/sounds/hold.wav</Play></Response>"#);
    for _ in 0..5 {
        h.complete("playback");
    }
    assert_eq!(run(&h, &verb).await.unwrap(), Outcome::Continue);
    assert_eq!(h.switch.executed_args("playback"), vec!["/sounds/hold.wav"; 3]);
}

#[tokio::test]
async fn test_get_speech_redirects_with_result() {
    let h = CallHarness::new();
    let verb = instruction(
        &h,
        r#"<Response><GetSpeech action="http://app/speech" grammar="yesno" timeout="5"/></Response>"#,
    );
    h.deliver(
        SwitchEvent::new(DETECTED_SPEECH)
            .with_header("Unique-ID", "leg-a")
            .with_header("Speech-Type", "detected-speech")
            .with_body(
                r#"<result grammar="yesno"><interpretation grammar="yesno" confidence="91">
                    <input mode="speech">yes</input></interpretation></result>"#,
            ),
    );
    let request = redirect_of(run(&h, &verb).await.unwrap());

    assert_eq!(request.url, "http://app/speech");
    assert_eq!(request.params.get("Grammar").map(String::as_str), Some("yesno"));
    assert_eq!(request.params.get("Confidence").map(String::as_str), Some("91"));
    assert_eq!(request.params.get("Mode").map(String::as_str), Some("speech"));
    assert_eq!(request.params.get("SpeechResult").map(String::as_str), Some("yes"));
    assert_eq!(
        h.switch.executed_args("detect_speech"),
        vec!["pocketsphinx yesno yesno", "stop"]
    );
}

#[tokio::test]
async fn test_pre_answer_failure_restores_frame() {
    let h = ringing_harness();
    let pre_answer = Instruction::new(VerbKind::PreAnswer).with_child(
        Instruction::new(VerbKind::Play)
            .with_attr("loop", "many")
            .with_text("http://media/early.wav"),
    );
    let hangup = Instruction::new(VerbKind::Hangup);
    h.session
        .push_frame(Arc::new(vec![pre_answer.clone(), hangup]));
    h.session.next_instruction();
    h.session.set_current_verb(Some(VerbKind::PreAnswer));

    let err = run(&h, &pre_answer).await.unwrap_err();
    assert!(matches!(flow_error(&err), Some(FlowError::Attribute(_))));

    assert_eq!(h.session.frame_depth(), 1);
    assert_eq!(h.session.cursor(), Some(1));
    assert_eq!(h.session.current_verb(), Some(VerbKind::PreAnswer));
    assert_eq!(h.switch.executed_args("pre_answer").len(), 1);
    assert!(h.switch.executed_args("playback").is_empty());
}
