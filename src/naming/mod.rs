//! Channel and key naming.
//!
//! Every store name the bus touches is derived here from a namespace plus a
//! session code or attachment id. Session-scoped names have the shape
//! `{namespace}:{kind}:{code}`; the global names have no trailing segment, so
//! the two families never collide. `parse` is the inverse for the
//! session-scoped kinds and returns `None` for anything else.

use std::fmt;

const INPUT: &str = "input";
const OUTPUT: &str = "output";
const SESSION: &str = "session";
const ATTACHMENT: &str = "attachment";

/// Session-scoped name kinds that carry a session code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
    Input,
    Output,
    Session,
}

impl NameKind {
    fn as_str(self) -> &'static str {
        match self {
            NameKind::Input => INPUT,
            NameKind::Output => OUTPUT,
            NameKind::Session => SESSION,
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            INPUT => Some(NameKind::Input),
            OUTPUT => Some(NameKind::Output),
            SESSION => Some(NameKind::Session),
            _ => None,
        }
    }
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of inverting a session-scoped name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedName<'a> {
    pub kind: NameKind,
    pub code: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Names {
    namespace: String,
}

impl Names {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn input(&self, code: &str) -> String {
        self.scoped(INPUT, code)
    }

    pub fn output(&self, code: &str) -> String {
        self.scoped(OUTPUT, code)
    }

    pub fn session(&self, code: &str) -> String {
        self.scoped(SESSION, code)
    }

    pub fn attachment(&self, id: &str) -> String {
        self.scoped(ATTACHMENT, id)
    }

    /// Name of the marker/channel for `kind`.
    pub fn of(&self, kind: NameKind, code: &str) -> String {
        self.scoped(kind.as_str(), code)
    }

    pub fn pending(&self) -> String {
        format!("{}:pending", self.namespace)
    }

    pub fn destroy_by_worker(&self) -> String {
        format!("{}:destroy:worker", self.namespace)
    }

    pub fn destroy_by_user(&self) -> String {
        format!("{}:destroy:user", self.namespace)
    }

    pub fn reboot(&self) -> String {
        format!("{}:reboot", self.namespace)
    }

    /// Glob matching every input channel. Glob metacharacters in the
    /// namespace are escaped, so they only ever match themselves.
    pub fn input_pattern(&self) -> String {
        format!("{}:{INPUT}:*", escape_glob(&self.namespace))
    }

    pub fn output_pattern(&self) -> String {
        format!("{}:{OUTPUT}:*", escape_glob(&self.namespace))
    }

    /// Inverse of the session-scoped derivations.
    pub fn parse<'a>(&self, name: &'a str) -> Option<ParsedName<'a>> {
        let rest = name
            .strip_prefix(self.namespace.as_str())?
            .strip_prefix(':')?;
        let (segment, code) = rest.split_once(':')?;
        let kind = NameKind::from_segment(segment)?;
        if code.is_empty() {
            return None;
        }
        Some(ParsedName { kind, code })
    }

    pub fn session_code<'a>(&self, name: &'a str) -> Option<&'a str> {
        self.parse(name).map(|parsed| parsed.code)
    }

    fn scoped(&self, kind: &str, id: &str) -> String {
        format!("{}:{}:{}", self.namespace, kind, id)
    }
}

fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
