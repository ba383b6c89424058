//! 🗺️ Document Mapper -- where an Event learns its address.
//!
//! 🎬 *[an Event stands at the post office counter. the clerk asks for an index.
//! the Event says "gogstash-index-test". the clerk asks for an id. the Event says "%{fieldstring}".
//! the clerk sighs and looks it up.]*
//!
//! Templates render against the event's own fields, falling through to the built-ins
//! `@timestamp` and `message`. A field that isn't there renders as nothing. That is normal
//! for logs and not an error.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::borrow::Cow;
use thiserror::Error;

use crate::common::{Event, EventId};
use crate::resolver::ResolvedOutputConfig;
use crate::templating::{Lookup, Missing, Template};

/// 📄 One event, ready for the bulk body. Lives exactly as long as its batch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MappedDocument {
    pub(crate) event_id: EventId,
    pub(crate) index: String,
    /// `None` when the type template rendered empty.
    pub(crate) doc_type: Option<String>,
    /// `None` when the id template rendered empty. The cluster picks one.
    pub(crate) doc_id: Option<String>,
    /// The serialized payload line, already JSON.
    pub(crate) source_buf: String,
}

/// 🚫 An event we refuse to send. Reported upstream as `Rejected` with status 0.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub(crate) struct MapError {
    pub(crate) index: String,
    pub(crate) doc_id: Option<String>,
    pub(crate) reason: String,
}

#[derive(Debug, Clone)]
pub(crate) struct DocumentMapper {
    index: Template,
    doc_type: Template,
    doc_id: Template,
}

impl DocumentMapper {
    pub(crate) fn new(config: &ResolvedOutputConfig) -> Self {
        Self {
            index: config.index.clone(),
            doc_type: config.document_type.clone(),
            doc_id: config.document_id.clone(),
        }
    }

    pub(crate) fn map(&self, event_id: EventId, event: &Event) -> Result<MappedDocument, MapError> {
        let fields = EventFields(event);
        let index = self.index.render(&fields, Missing::Empty);
        let doc_type = non_empty(self.doc_type.render(&fields, Missing::Empty));
        let doc_id = non_empty(self.doc_id.render(&fields, Missing::Empty));

        if index.is_empty() {
            return Err(MapError {
                index,
                doc_id,
                reason: format!("empty index: template '{}' rendered to nothing", self.index.as_str()),
            });
        }

        let source_buf = serde_json::to_string(&document_source(event)).map_err(|e| MapError {
            index: index.clone(),
            doc_id: doc_id.clone(),
            reason: format!("event could not be serialized: {e}"),
        })?;

        Ok(MappedDocument {
            event_id,
            index,
            doc_type,
            doc_id,
            source_buf,
        })
    }
}

/// 📦 The payload: extras flattened at the top, then the reserved fields on top of those.
pub(crate) fn document_source(event: &Event) -> Value {
    let mut source: Map<String, Value> = event.extra.clone();
    source.insert("@timestamp".to_string(), Value::String(format_timestamp(&event.timestamp)));
    source.insert("message".to_string(), Value::String(event.message.clone()));
    Value::Object(source)
}

/// ⏰ RFC3339, always nine fractional digits, always `Z`.
pub(crate) fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn non_empty(rendered: String) -> Option<String> {
    if rendered.is_empty() { None } else { Some(rendered) }
}

/// 🔍 The event as a template lookup.
struct EventFields<'a>(&'a Event);

impl Lookup for EventFields<'_> {
    fn lookup(&self, name: &str) -> Option<Cow<'_, str>> {
        match name {
            "@timestamp" | "timestamp" => Some(Cow::Owned(format_timestamp(&self.0.timestamp))),
            "message" => Some(Cow::Borrowed(self.0.message.as_str())),
            _ => self.0.field(name).map(value_as_text),
        }
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        Some(self.0.timestamp)
    }
}

fn value_as_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        Value::Null => Cow::Borrowed(""),
        other => Cow::Owned(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::OutputConfig;
    use serde_json::json;
    use std::collections::HashMap;

    fn mapper(index: &str, doc_type: &str, doc_id: &str) -> DocumentMapper {
        let config = OutputConfig {
            url: vec!["http://127.0.0.1:9200".into()],
            index: index.into(),
            document_type: doc_type.into(),
            document_id: doc_id.into(),
            ..OutputConfig::default()
        }
        .resolve(&HashMap::<String, String>::new())
        .expect("💀 test config resolves");
        DocumentMapper::new(&config)
    }

    fn the_classic_event() -> Event {
        let ts = DateTime::parse_from_rfc3339("2017-04-18T19:53:01.000000002Z")
            .expect("valid timestamp")
            .with_timezone(&Utc);
        Event::new(ts, "output elastic test message")
            .with_field("fieldstring", "ABC")
            .with_field("fieldnumber", 123)
    }

    #[test]
    fn the_one_where_the_classic_event_maps_to_the_classic_document() {
        let doc = mapper("gogstash-index-test", "testtype", "%{fieldstring}")
            .map(EventId(1), &the_classic_event())
            .expect("maps");

        assert_eq!(doc.index, "gogstash-index-test");
        assert_eq!(doc.doc_type.as_deref(), Some("testtype"));
        assert_eq!(doc.doc_id.as_deref(), Some("ABC"));
        assert_eq!(
            doc.source_buf,
            r#"{"@timestamp":"2017-04-18T19:53:01.000000002Z","fieldnumber":123,"fieldstring":"ABC","message":"output elastic test message"}"#
        );
    }

    #[test]
    fn the_one_where_missing_fields_render_as_nothing_and_keys_disappear() {
        let doc = mapper("logs", "", "%{request_id}")
            .map(EventId(2), &the_classic_event())
            .expect("maps");
        assert_eq!(doc.doc_id, None, "empty id means the cluster picks one");
        assert_eq!(doc.doc_type, None);
    }

    #[test]
    fn the_one_where_the_index_follows_the_event_clock_not_the_wall_clock() {
        let doc = mapper("logs-%{+%Y.%m.%d}", "", "")
            .map(EventId(3), &the_classic_event())
            .expect("maps");
        assert_eq!(doc.index, "logs-2017.04.18");
    }

    #[test]
    fn the_one_where_non_strings_are_rendered_as_json_text() {
        let event = the_classic_event()
            .with_field("flag", true)
            .with_field("nothing", Value::Null)
            .with_field("http", json!({"status": 404}));
        let doc = mapper("idx-%{http.status}", "", "%{fieldnumber}-%{flag}-%{nothing}")
            .map(EventId(4), &event)
            .expect("maps");
        assert_eq!(doc.index, "idx-404");
        assert_eq!(doc.doc_id.as_deref(), Some("123-true-"));
    }

    #[test]
    fn the_one_where_reserved_fields_win_the_name_fight() {
        let event = the_classic_event().with_field("message", "impostor");
        let source: Value = serde_json::from_str(
            &mapper("logs", "", "").map(EventId(5), &event).expect("maps").source_buf,
        )
        .expect("json");
        assert_eq!(source["message"], "output elastic test message");
    }

    #[test]
    fn the_one_where_an_empty_index_is_refused_before_it_leaves_the_building() {
        let err = mapper("%{tenant}", "", "%{fieldstring}")
            .map(EventId(6), &the_classic_event())
            .expect_err("💀 nowhere to put it");
        assert_eq!(err.index, "");
        assert_eq!(err.doc_id.as_deref(), Some("ABC"));
        assert!(err.reason.contains("empty index"));
    }
}
