//! 🧩 `%{name}` templates -- parsed once, rendered a million times.
//!
//! 🎬 *[a config file says `%{ES_URL}`. an index says `logs-%{+%Y.%m.%d}`. a doc id says `%{request_id}`.]*
//! *[they are all the same syntax. they are resolved against different worlds.]*
//!
//! Two worlds, two policies for a name nobody knows:
//!
//! | where             | lookup source        | unknown name becomes |
//! |-------------------|----------------------|----------------------|
//! | config (startup)  | process environment  | left verbatim        |
//! | mapper (per event)| event fields         | empty string         |
//!
//! Rendering never fails. Parsing can: an unterminated `%{`, an empty `%{}` or a
//! strftime pattern chrono can't read is a configuration error, caught at startup.
//! Do not "fix" rendering into something stricter; missing fields are normal in logs.
//!
//! `%{+FORMAT}` renders the lookup's timestamp with a chrono strftime pattern.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::collections::HashMap;
use thiserror::Error;

/// 🔍 Something that can answer "what is `name`?"
pub trait Lookup {
    fn lookup(&self, name: &str) -> Option<Cow<'_, str>>;

    /// The instant `%{+FORMAT}` segments format. `None` means "no clock here".
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// 🌍 The process environment. Read at call time, nothing cached.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvLookup;

impl Lookup for EnvLookup {
    fn lookup(&self, name: &str) -> Option<Cow<'_, str>> {
        std::env::var(name).ok().map(Cow::Owned)
    }
}

impl Lookup for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<Cow<'_, str>> {
        self.get(name).map(|v| Cow::Borrowed(v.as_str()))
    }
}

/// What to do with a name the lookup has never heard of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    /// Put `%{name}` back exactly as written.
    Verbatim,
    /// Replace it with nothing.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unterminated placeholder starting at byte {at} in '{template}'")]
    Unterminated { template: String, at: usize },
    #[error("empty placeholder '%{{}}' at byte {at} in '{template}'")]
    EmptyName { template: String, at: usize },
    #[error("'{format}' is not a strftime pattern chrono understands (in '{template}')")]
    BadDateFormat { template: String, format: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
    Timestamp(String),
}

/// 📐 A parsed template. Cheap to clone, pure to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = raw;
        let mut offset = 0;

        while let Some(start) = rest.find("%{") {
            literal.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            let Some(close) = after_open.find('}') else {
                return Err(TemplateError::Unterminated {
                    template: raw.to_string(),
                    at: offset + start,
                });
            };
            let name = &after_open[..close];
            if name.is_empty() {
                return Err(TemplateError::EmptyName {
                    template: raw.to_string(),
                    at: offset + start,
                });
            }

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            match name.strip_prefix('+') {
                Some(format) => {
                    let unreadable = format.is_empty()
                        || StrftimeItems::new(format).any(|item| matches!(item, Item::Error));
                    if unreadable {
                        return Err(TemplateError::BadDateFormat {
                            template: raw.to_string(),
                            format: format.to_string(),
                        });
                    }
                    segments.push(Segment::Timestamp(format.to_string()));
                }
                None => segments.push(Segment::Field(name.to_string())),
            }

            let consumed = start + 2 + close + 1;
            offset += consumed;
            rest = &rest[consumed..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when there is nothing to substitute. Static templates render to themselves.
    pub fn is_static(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn render(&self, lookup: &dyn Lookup, missing: Missing) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => match lookup.lookup(name) {
                    Some(value) => out.push_str(&value),
                    None if missing == Missing::Verbatim => {
                        out.push_str("%{");
                        out.push_str(name);
                        out.push('}');
                    }
                    None => {}
                },
                Segment::Timestamp(format) => match lookup.timestamp() {
                    // -- pattern was vetted in parse(), so Display won't trip over an Item::Error
                    Some(ts) => out.push_str(&ts.format(format).to_string()),
                    None if missing == Missing::Verbatim => {
                        out.push_str("%{+");
                        out.push_str(format);
                        out.push('}');
                    }
                    None => {}
                },
            }
        }
        out
    }
}

/// 🧼 The never-fails convenience: parse and render in one go.
///
/// A malformed template is rendered as-is, which is what `Missing::Verbatim` would have done
/// with it anyway. Use [`Template::parse`] where you want the error.
pub fn substitute(template: &str, lookup: &dyn Lookup, missing: Missing) -> String {
    match Template::parse(template) {
        Ok(parsed) => parsed.render(lookup, missing),
        Err(_) => template.to_string(),
    }
}
