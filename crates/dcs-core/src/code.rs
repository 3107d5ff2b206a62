//! Parsed G/M/T-codes, their routing channels, and interception filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

use crate::error::IpcError;

/// Named queue through which codes flow to the motion controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeChannel {
    HTTP,
    Telnet,
    File,
    USB,
    Aux,
    Trigger,
    CodeQueue,
    LCD,
    SBC,
    Daemon,
    Autopause,
}

impl CodeChannel {
    pub const ALL: [CodeChannel; 11] = [
        CodeChannel::HTTP,
        CodeChannel::Telnet,
        CodeChannel::File,
        CodeChannel::USB,
        CodeChannel::Aux,
        CodeChannel::Trigger,
        CodeChannel::CodeQueue,
        CodeChannel::LCD,
        CodeChannel::SBC,
        CodeChannel::Daemon,
        CodeChannel::Autopause,
    ];
}

impl Default for CodeChannel {
    fn default() -> Self {
        Self::SBC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeType {
    G,
    M,
    T,
    Comment,
    Keyword,
}

/// One `letter=value` pair of a code, e.g. the `X10.5` of `G1 X10.5`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeParameter {
    pub letter: String,
    pub value: Value,
}

/// A parsed code as it travels through the pipeline and over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Code {
    #[serde(default)]
    pub channel: CodeChannel,
    #[serde(rename = "type")]
    pub code_type: CodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major_number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor_number: Option<i8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<CodeParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Id of the IPC connection that submitted this code, if any. Codes are
    /// never offered back to the connection that submitted them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_connection: Option<u32>,
    /// Execution result, populated before the executed-stage interceptors
    /// run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Message>,
}

impl Code {
    pub fn parameter(&self, letter: &str) -> Option<&Value> {
        self.parameters
            .iter()
            .find(|p| p.letter.eq_ignore_ascii_case(letter))
            .map(|p| &p.value)
    }

    /// Parse a single line of G-code text, e.g. `G28 X Y` or `M104 S210`.
    ///
    /// Only the shape needed for routing is recovered: letter, major/minor
    /// number, letter-prefixed parameters and a trailing `;` comment. Full
    /// expression syntax belongs to the firmware, not this daemon.
    pub fn from_text(line: &str, channel: CodeChannel) -> Result<Self, IpcError> {
        let (content, comment) = match line.split_once(';') {
            Some((head, tail)) => (head.trim(), Some(tail.trim().to_string())),
            None => (line.trim(), None),
        };

        if content.is_empty() {
            return Ok(Self {
                channel,
                code_type: CodeType::Comment,
                major_number: None,
                minor_number: None,
                parameters: Vec::new(),
                comment,
                source_connection: None,
                result: None,
            });
        }

        let mut tokens = content.split_ascii_whitespace();
        let head = tokens.next().unwrap_or_default();
        let mut chars = head.chars();
        let letter = chars
            .next()
            .ok_or_else(|| IpcError::invalid_argument("empty code"))?;
        let code_type = match letter.to_ascii_uppercase() {
            'G' => CodeType::G,
            'M' => CodeType::M,
            'T' => CodeType::T,
            other => {
                return Err(IpcError::invalid_argument(format!(
                    "unsupported code letter {other:?} in {line:?}"
                )))
            }
        };

        let number = chars.as_str();
        let (major, minor) = match number.split_once('.') {
            Some((maj, min)) => (maj, Some(min)),
            None => (number, None),
        };
        let major_number = if major.is_empty() && code_type == CodeType::T {
            None
        } else {
            Some(major.parse::<i32>().map_err(|_| {
                IpcError::invalid_argument(format!("invalid code number in {line:?}"))
            })?)
        };
        let minor_number = match minor {
            Some(min) => Some(min.parse::<i8>().map_err(|_| {
                IpcError::invalid_argument(format!("invalid minor code number in {line:?}"))
            })?),
            None => None,
        };

        let mut parameters = Vec::new();
        for token in tokens {
            let mut chars = token.chars();
            let letter = chars
                .next()
                .ok_or_else(|| IpcError::invalid_argument("empty parameter"))?;
            if !letter.is_ascii_alphabetic() {
                return Err(IpcError::invalid_argument(format!(
                    "invalid parameter {token:?} in {line:?}"
                )));
            }
            parameters.push(CodeParameter {
                letter: letter.to_ascii_uppercase().to_string(),
                value: parse_parameter_value(chars.as_str()),
            });
        }

        Ok(Self {
            channel,
            code_type,
            major_number,
            minor_number,
            parameters,
            comment,
            source_connection: None,
            result: None,
        })
    }
}

fn parse_parameter_value(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = raw.parse::<f64>() {
        return Value::from(float);
    }
    Value::from(raw.trim_matches('"'))
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code_type {
            CodeType::Comment => return write!(f, ";{}", self.comment.as_deref().unwrap_or("")),
            CodeType::G => write!(f, "G")?,
            CodeType::M => write!(f, "M")?,
            CodeType::T => write!(f, "T")?,
            CodeType::Keyword => write!(f, "keyword")?,
        }
        if let Some(major) = self.major_number {
            write!(f, "{major}")?;
            if let Some(minor) = self.minor_number {
                write!(f, ".{minor}")?;
            }
        }
        for param in &self.parameters {
            match &param.value {
                Value::Null => write!(f, " {}", param.letter)?,
                Value::String(s) => write!(f, " {}{}", param.letter, s)?,
                other => write!(f, " {}{}", param.letter, other)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Success,
    Warning,
    Error,
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Success
    }
}

/// A generic firmware or daemon message; also the result type of an
/// executed code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
}

impl Message {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Success,
            content: content.into(),
            time: Utc::now(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Error,
            content: content.into(),
            time: Utc::now(),
        }
    }
}

/// Point in a code's lifecycle at which an interceptor hooks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterceptionStage {
    PreCode,
    PostCode,
    ExecutedCode,
}

impl InterceptionStage {
    pub const ALL: [InterceptionStage; 3] = [
        InterceptionStage::PreCode,
        InterceptionStage::PostCode,
        InterceptionStage::ExecutedCode,
    ];
}

/// Filter declared by an intercepting connection. Unset sets match
/// everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptOptions {
    #[serde(default = "default_stage")]
    pub stage: InterceptionStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<HashSet<CodeChannel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<HashSet<CodeType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m_codes: Option<HashSet<i32>>,
}

fn default_stage() -> InterceptionStage {
    InterceptionStage::PreCode
}

impl Default for InterceptOptions {
    fn default() -> Self {
        Self {
            stage: InterceptionStage::PreCode,
            channels: None,
            types: None,
            m_codes: None,
        }
    }
}

impl InterceptOptions {
    pub fn matches(&self, code: &Code) -> bool {
        if let Some(channels) = &self.channels {
            if !channels.contains(&code.channel) {
                return false;
            }
        }
        if let Some(types) = &self.types {
            if !types.contains(&code.code_type) {
                return false;
            }
        }
        if let Some(m_codes) = &self.m_codes {
            if code.code_type != CodeType::M {
                return false;
            }
            match code.major_number {
                Some(major) if m_codes.contains(&major) => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_gcode_text() {
        let code = Code::from_text("G28 X Y", CodeChannel::HTTP).expect("parse");
        assert_eq!(code.code_type, CodeType::G);
        assert_eq!(code.major_number, Some(28));
        assert_eq!(code.parameters.len(), 2);
        assert_eq!(code.parameters[0].letter, "X");
        assert_eq!(code.parameters[0].value, Value::Null);
        assert_eq!(code.to_string(), "G28 X Y");
    }

    #[test]
    fn parses_numeric_parameters_and_minor_numbers() {
        let code = Code::from_text("G54.1 P2", CodeChannel::SBC).expect("parse");
        assert_eq!(code.major_number, Some(54));
        assert_eq!(code.minor_number, Some(1));
        assert_eq!(code.parameter("p"), Some(&json!(2)));

        let heat = Code::from_text("M104 S210.5", CodeChannel::SBC).expect("parse");
        assert_eq!(heat.parameter("S"), Some(&json!(210.5)));
    }

    #[test]
    fn comment_only_lines_become_comment_codes() {
        let code = Code::from_text("; homing done", CodeChannel::File).expect("parse");
        assert_eq!(code.code_type, CodeType::Comment);
        assert_eq!(code.comment.as_deref(), Some("homing done"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Code::from_text("X12 G1", CodeChannel::SBC).is_err());
        assert!(Code::from_text("G twelve", CodeChannel::SBC).is_err());
    }

    #[test]
    fn code_wire_shape_matches_protocol() {
        let code = Code::from_text("G28", CodeChannel::HTTP).expect("parse");
        let value = serde_json::to_value(&code).expect("serialize");
        assert_eq!(
            value,
            json!({"channel": "HTTP", "type": "G", "majorNumber": 28})
        );
    }

    #[test]
    fn intercept_filter_matches_channel_type_and_mcode() {
        let filter = InterceptOptions {
            stage: InterceptionStage::PreCode,
            channels: Some([CodeChannel::HTTP].into_iter().collect()),
            types: Some([CodeType::M].into_iter().collect()),
            m_codes: Some([112].into_iter().collect()),
        };

        let matching = Code::from_text("M112", CodeChannel::HTTP).expect("parse");
        assert!(filter.matches(&matching));

        let wrong_channel = Code::from_text("M112", CodeChannel::Telnet).expect("parse");
        assert!(!filter.matches(&wrong_channel));

        let wrong_number = Code::from_text("M104 S0", CodeChannel::HTTP).expect("parse");
        assert!(!filter.matches(&wrong_number));

        assert!(InterceptOptions::default()
            .matches(&Code::from_text("G1 X0", CodeChannel::Daemon).expect("parse")));
    }
}
