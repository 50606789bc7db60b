use crate::error::FlowError;
use std::collections::BTreeMap;
use std::fmt;

/// Every instruction the call-flow language knows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VerbKind {
    Conference,
    Dial,
    Number,
    Dtmf,
    GetDigits,
    GetSpeech,
    Hangup,
    Play,
    PreAnswer,
    Record,
    Redirect,
    SipTransfer,
    Speak,
    Wait,
}

pub const ROOT_TAG: &str = "Response";

const PROMPTS: &[VerbKind] = &[VerbKind::Play, VerbKind::Speak, VerbKind::Wait];
const PRE_ANSWER: &[VerbKind] = &[
    VerbKind::Play,
    VerbKind::Speak,
    VerbKind::GetDigits,
    VerbKind::GetSpeech,
    VerbKind::Wait,
    VerbKind::Dtmf,
    VerbKind::Redirect,
    VerbKind::SipTransfer,
];

impl VerbKind {
    pub const ALL: [VerbKind; 14] = [
        VerbKind::Conference,
        VerbKind::Dial,
        VerbKind::Number,
        VerbKind::Dtmf,
        VerbKind::GetDigits,
        VerbKind::GetSpeech,
        VerbKind::Hangup,
        VerbKind::Play,
        VerbKind::PreAnswer,
        VerbKind::Record,
        VerbKind::Redirect,
        VerbKind::SipTransfer,
        VerbKind::Speak,
        VerbKind::Wait,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            VerbKind::Conference => "Conference",
            VerbKind::Dial => "Dial",
            VerbKind::Number => "Number",
            VerbKind::Dtmf => "DTMF",
            VerbKind::GetDigits => "GetDigits",
            VerbKind::GetSpeech => "GetSpeech",
            VerbKind::Hangup => "Hangup",
            VerbKind::Play => "Play",
            VerbKind::PreAnswer => "PreAnswer",
            VerbKind::Record => "Record",
            VerbKind::Redirect => "Redirect",
            VerbKind::SipTransfer => "SIPTransfer",
            VerbKind::Speak => "Speak",
            VerbKind::Wait => "Wait",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }

    /// Child verbs this verb may contain. Empty means no children at all.
    pub fn nestables(&self) -> &'static [VerbKind] {
        match self {
            VerbKind::Dial => &[VerbKind::Number],
            VerbKind::GetDigits | VerbKind::GetSpeech => PROMPTS,
            VerbKind::PreAnswer => PRE_ANSWER,
            _ => &[],
        }
    }

    /// Nouns only make sense inside their verb.
    pub fn is_top_level(&self) -> bool {
        !matches!(self, VerbKind::Number)
    }
}

impl fmt::Display for VerbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A parsed, structurally valid instruction. Attribute values are validated
/// by the verb handler's `fetch_context`.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub kind: VerbKind,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
    pub children: Vec<Instruction>,
}

impl Instruction {
    pub fn new(kind: VerbKind) -> Self {
        Self {
            kind,
            attrs: BTreeMap::new(),
            text: String::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn with_child(mut self, child: Instruction) -> Self {
        self.children.push(child);
        self
    }

    fn err(&self, name: &str, msg: impl fmt::Display) -> FlowError {
        FlowError::Attribute(format!("{} {}: {}", self.kind, name, msg))
    }

    /// Raw attribute, empty values count as absent.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn attr_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.attr(name).unwrap_or(default)
    }

    pub fn bool_attr(&self, name: &str, default: bool) -> Result<bool, FlowError> {
        match self.attr(name) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(self.err(name, format!("expected true or false, got {}", other))),
        }
    }

    pub fn int_attr(&self, name: &str, default: i64) -> Result<i64, FlowError> {
        match self.attr(name) {
            None => Ok(default),
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| self.err(name, format!("expected an integer, got {}", v))),
        }
    }

    /// Integer attribute constrained to `min..=max`.
    pub fn bounded_attr(
        &self,
        name: &str,
        default: i64,
        min: i64,
        max: i64,
    ) -> Result<i64, FlowError> {
        let value = self.int_attr(name, default)?;
        if value < min || value > max {
            return Err(self.err(name, format!("{} not in {}..={}", value, min, max)));
        }
        Ok(value)
    }

    pub fn url_attr(&self, name: &str) -> Result<Option<String>, FlowError> {
        match self.attr(name) {
            None => Ok(None),
            Some(v) => validate_url(v)
                .map(Some)
                .map_err(|msg| self.err(name, msg)),
        }
    }

    pub fn method_attr(&self, name: &str, default: &str) -> Result<String, FlowError> {
        let method = self.attr(name).unwrap_or(default).to_uppercase();
        match method.as_str() {
            "GET" | "POST" => Ok(method),
            _ => Err(self.err(name, format!("unsupported method {}", method))),
        }
    }

    /// Comma separated list, entries trimmed, empty entries kept so positions
    /// line up across parallel lists.
    pub fn list_attr(&self, name: &str) -> Vec<String> {
        self.attr(name)
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn text(&self) -> &str {
        self.text.trim()
    }
}

pub fn validate_url(value: &str) -> Result<String, String> {
    let parsed = url::Url::parse(value).map_err(|e| format!("invalid url {}: {}", value, e))?;
    match parsed.scheme() {
        "http" | "https" => Ok(value.to_string()),
        scheme => Err(format!("unsupported url scheme {}", scheme)),
    }
}
