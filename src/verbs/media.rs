use super::{play::PlayVerb, speak::SpeakVerb, wait::WaitVerb};
use crate::config::CallConfig;
use crate::plan::{Instruction, VerbKind};
use anyhow::Result;

pub const BEEP: &str = "tone_stream://%(300,200,700)";
pub const DOUBLE_BEEP: &str = "tone_stream://L=2;%(300,200,700)";

pub fn silence(ms: u64) -> String {
    format!("silence_stream://{}", ms)
}

/// Remote media goes through the switch's http cache.
pub fn media_path(source: &str) -> String {
    if source.starts_with("http://") || source.starts_with("https://") {
        format!("http_cache://{}", source)
    } else {
        source.to_string()
    }
}

pub fn tts_path(engine: &str, voice: &str, text: &str) -> String {
    format!("tts://{}|{}|{}", engine, voice, text)
}

/// Join playback parts into one playable string.
pub fn file_string(parts: &[String]) -> String {
    match parts {
        [] => String::new(),
        [single] => single.clone(),
        many => format!("file_string://{}", many.join("!")),
    }
}

/// Flatten nested `Play`/`Speak`/`Wait` prompts into playback parts. A loop
/// of 0 inside a prompt plays once, larger loops are capped at `max_loop`.
pub fn prompt_parts(children: &[Instruction], config: &CallConfig) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    for child in children {
        let (path, times) = match child.kind {
            VerbKind::Play => {
                let ctx = PlayVerb.fetch_context(child, config)?;
                (media_path(&ctx.media), ctx.requested_loops)
            }
            VerbKind::Speak => {
                let ctx = SpeakVerb.fetch_context(child, config)?;
                (tts_path(&ctx.engine, &ctx.voice, &ctx.text), ctx.requested_loops)
            }
            VerbKind::Wait => {
                let ctx = WaitVerb.fetch_context(child, config)?;
                (silence(ctx.length * 1000), 1)
            }
            _ => continue,
        };
        for _ in 0..times.clamp(1, config.max_loop.max(1)) {
            parts.push(path.clone());
        }
    }
    Ok(parts)
}

/// The single playback string for a prompting verb: padded with a short
/// silence, optionally ending with a beep.
pub fn prompt_playback(
    children: &[Instruction],
    config: &CallConfig,
    beep: bool,
) -> Result<String> {
    let mut parts = vec![silence(10)];
    parts.extend(prompt_parts(children, config)?);
    if beep {
        parts.push(BEEP.to_string());
    }
    Ok(file_string(&parts))
}

/// Conference entry/exit sound attribute: `beep:1`, `beep:2` or media.
pub fn sound_path(value: &str) -> String {
    match value {
        "beep:1" => BEEP.to_string(),
        "beep:2" => DOUBLE_BEEP.to_string(),
        other => media_path(other),
    }
}
