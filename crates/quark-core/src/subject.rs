//! Dot-delimited event subjects (`service.health.changed`) and the wildcard
//! patterns consumers subscribe with.
//!
//! - `*` matches exactly one token: `service.*` matches `service.registered`
//!   but not `service.health.changed`.
//! - `>` matches one or more trailing tokens and must be last: `service.>`
//!   matches every service event but not `service` itself.

use std::fmt;

use crate::errors::SubjectError;

pub const SEPARATOR: char = '.';
pub const WILDCARD_SINGLE: &str = "*";
pub const WILDCARD_TAIL: &str = ">";
pub const MAX_TOKENS: usize = 16;
pub const MAX_TOKEN_LENGTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject(String);

impl Subject {
    pub fn new(name: impl Into<String>) -> Result<Self, SubjectError> {
        let name = name.into();
        validate_tokens(&name, false)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// Prepends `prefix` as the leading token(s).
    pub fn prefixed(&self, prefix: &str) -> Result<Self, SubjectError> {
        if prefix.is_empty() {
            return Ok(self.clone());
        }
        Self::new(format!("{prefix}{SEPARATOR}{}", self.0))
    }

    /// Removes a leading `prefix.` if present.
    pub fn strip_prefix(&self, prefix: &str) -> Self {
        if prefix.is_empty() {
            return self.clone();
        }
        match self.0.strip_prefix(prefix).and_then(|rest| rest.strip_prefix(SEPARATOR)) {
            Some(rest) if !rest.is_empty() => Self(rest.to_string()),
            _ => self.clone(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Single,
    Tail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPattern {
    tokens: Vec<Token>,
    original: String,
}

impl SubjectPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, SubjectError> {
        let original = pattern.into();
        validate_tokens(&original, true)?;

        let parts: Vec<&str> = original.split(SEPARATOR).collect();
        let mut tokens = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let token = match *part {
                WILDCARD_SINGLE => Token::Single,
                WILDCARD_TAIL if i + 1 == parts.len() => Token::Tail,
                WILDCARD_TAIL => {
                    return Err(SubjectError::InvalidPattern {
                        pattern: original.clone(),
                        reason: "'>' must be the last token".into(),
                    });
                }
                literal => Token::Literal(literal.to_string()),
            };
            tokens.push(token);
        }

        Ok(Self { tokens, original })
    }

    pub fn prefixed(&self, prefix: &str) -> Result<Self, SubjectError> {
        if prefix.is_empty() {
            return Ok(self.clone());
        }
        Self::new(format!("{prefix}{SEPARATOR}{}", self.original))
    }

    pub fn matches(&self, subject: &Subject) -> bool {
        let mut subject_tokens = subject.tokens();
        for (i, token) in self.tokens.iter().enumerate() {
            match token {
                Token::Tail => {
                    debug_assert_eq!(i + 1, self.tokens.len());
                    return subject_tokens.next().is_some();
                }
                Token::Single => {
                    if subject_tokens.next().is_none() {
                        return false;
                    }
                }
                Token::Literal(lit) => match subject_tokens.next() {
                    Some(t) if t == lit => {}
                    _ => return false,
                },
            }
        }
        subject_tokens.next().is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// Checks that `token` can stand alone as one subject token, so it can be
/// embedded in a subject or pattern without changing its shape.
pub fn validate_token(token: &str) -> Result<(), SubjectError> {
    if token.contains(SEPARATOR) {
        return Err(SubjectError::InvalidSubject {
            subject: token.to_string(),
            reason: format!("'{SEPARATOR}' is not allowed in a single token"),
        });
    }
    validate_tokens(token, false)
}

fn validate_tokens(name: &str, wildcards: bool) -> Result<(), SubjectError> {
    let invalid = |reason: String| {
        if wildcards {
            SubjectError::InvalidPattern {
                pattern: name.to_string(),
                reason,
            }
        } else {
            SubjectError::InvalidSubject {
                subject: name.to_string(),
                reason,
            }
        }
    };

    if name.is_empty() {
        return Err(invalid("empty".into()));
    }

    let count = name.split(SEPARATOR).count();
    if count > MAX_TOKENS {
        return Err(invalid(format!("{count} tokens, maximum is {MAX_TOKENS}")));
    }

    for (position, token) in name.split(SEPARATOR).enumerate() {
        if token.is_empty() {
            return Err(invalid(format!("empty token at position {position}")));
        }
        if token.len() > MAX_TOKEN_LENGTH {
            return Err(invalid(format!("token '{token}' is longer than {MAX_TOKEN_LENGTH}")));
        }
        if token == WILDCARD_SINGLE || token == WILDCARD_TAIL {
            if !wildcards {
                return Err(invalid(format!("wildcard '{token}' is not allowed in a subject")));
            }
            continue;
        }
        if let Some(ch) = token.chars().find(|c| c.is_whitespace() || *c == '*' || *c == '>') {
            return Err(invalid(format!("invalid character {ch:?} in token '{token}'")));
        }
    }

    Ok(())
}
