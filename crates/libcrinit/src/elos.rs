//! External event integration.
//!
//! Tasks can gate on events that originate outside the init process: an elos
//! event manager publishes JSON-encoded events over TCP, and `FILTER_DEFINE`
//! directives describe which of those events a task cares about. A matching
//! event is converted into a synthetic bus event in the `@elos` namespace so
//! that `DEPENDS`/`TRIGGER` entries like `@elos:ssh-up` wake the dispatcher
//! like any task event would.
//!
//! A dedicated thread polls the server on the `ELOS_EVENT_POLL_INTERVAL`
//! cadence; the dispatcher itself never blocks on the network.

use std::collections::HashMap;
use std::io::BufRead;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{trace, warn};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::lock_ext::MutexExt;
use crate::task::DepRef;

/// Dependency names beginning with this prefix are routed to the external
/// adapter instead of the task database.
pub const ELOS_DEP_NAMESPACE: &str = "@elos";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Lt,
}

/// One `.field OP value` predicate of a filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterPredicate {
    /// Dotted path into the event object, without the leading dot.
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// A named filter over external-event fields, from `FILTER_DEFINE`.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
    pub name: String,
    pub predicates: Vec<FilterPredicate>,
}

impl EventFilter {
    /// Parse a `FILTER_DEFINE` value: `NAME={.field=value,.field2>value2}`.
    ///
    /// Values are double-quoted strings or integers; operators are `=`, `!=`,
    /// `>`, `<`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (name, rule) = text.split_once('=').ok_or_else(|| {
            Error::InvalidInput(format!("filter definition is not NAME={{...}}: {text}"))
        })?;
        let name = name.trim();
        if name.is_empty() || name.starts_with('.') {
            return Err(Error::InvalidInput(format!(
                "filter name missing in definition: {text}"
            )));
        }
        let rule = rule.trim();
        let inner = rule
            .strip_prefix('{')
            .and_then(|r| r.strip_suffix('}'))
            .ok_or_else(|| {
                Error::InvalidInput(format!("filter rule must be brace-enclosed: {rule}"))
            })?;

        let mut predicates = Vec::new();
        for part in split_top_level_commas(inner) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            predicates.push(parse_predicate(part)?);
        }
        if predicates.is_empty() {
            return Err(Error::InvalidInput(format!(
                "filter {name} has no predicates"
            )));
        }
        Ok(Self {
            name: name.to_owned(),
            predicates,
        })
    }

    /// Evaluate this filter against one event object.
    pub fn matches(&self, event: &serde_json::Map<String, Value>) -> bool {
        self.predicates.iter().all(|p| {
            let Some(actual) = lookup_field(event, &p.field) else {
                return false;
            };
            match p.op {
                FilterOp::Eq => actual == &p.value,
                FilterOp::Ne => actual != &p.value,
                FilterOp::Gt => cmp_numbers(actual, &p.value).map(|o| o.is_gt()).unwrap_or(false),
                FilterOp::Lt => cmp_numbers(actual, &p.value).map(|o| o.is_lt()).unwrap_or(false),
            }
        })
    }
}

/// Split on commas that are not inside a quoted string.
fn split_top_level_commas(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            '\\' if in_quotes => escaped = !escaped,
            '"' if !escaped => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_predicate(part: &str) -> Result<FilterPredicate> {
    let field_rest = part.strip_prefix('.').ok_or_else(|| {
        Error::InvalidInput(format!("filter predicate field must start with '.': {part}"))
    })?;

    // Find the operator: the first of !=, =, >, < after the field path.
    let op_pos = field_rest
        .find(|c| c == '=' || c == '!' || c == '>' || c == '<')
        .ok_or_else(|| Error::InvalidInput(format!("filter predicate has no operator: {part}")))?;
    let field = field_rest[..op_pos].trim();
    if field.is_empty() {
        return Err(Error::InvalidInput(format!(
            "filter predicate has empty field: {part}"
        )));
    }
    let rest = &field_rest[op_pos..];
    let (op, value_text) = if let Some(v) = rest.strip_prefix("!=") {
        (FilterOp::Ne, v)
    } else if let Some(v) = rest.strip_prefix('=') {
        (FilterOp::Eq, v)
    } else if let Some(v) = rest.strip_prefix('>') {
        (FilterOp::Gt, v)
    } else if let Some(v) = rest.strip_prefix('<') {
        (FilterOp::Lt, v)
    } else {
        return Err(Error::InvalidInput(format!(
            "unknown operator in filter predicate: {part}"
        )));
    };

    let value_text = value_text.trim();
    let value = if let Some(stripped) = value_text
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    {
        Value::String(stripped.to_owned())
    } else {
        let n: i64 = value_text.parse().map_err(|_| {
            Error::InvalidInput(format!(
                "filter value must be a quoted string or integer: {value_text}"
            ))
        })?;
        Value::from(n)
    };

    Ok(FilterPredicate {
        field: field.to_owned(),
        op,
        value,
    })
}

fn lookup_field<'a>(event: &'a serde_json::Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = event.get(first)?;
    for seg in segments {
        current = current.as_object()?.get(seg)?;
    }
    Some(current)
}

fn cmp_numbers(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let a = a.as_f64()?;
    let b = b.as_f64()?;
    a.partial_cmp(&b)
}

/// Latest matching event per filter name. The dispatcher's ready predicate
/// consults this snapshot; the poller thread fills it.
#[derive(Default)]
pub struct ExternalEventState {
    latest: Mutex<HashMap<String, serde_json::Map<String, Value>>>,
}

impl ExternalEventState {
    pub fn record(&self, filter_name: &str, event: serde_json::Map<String, Value>) {
        self.latest
            .lock_poisoned()
            .insert(filter_name.to_owned(), event);
    }

    /// Whether a matching event has been seen for `filter` since startup.
    pub fn satisfied(&self, filter: &EventFilter) -> bool {
        self.latest
            .lock_poisoned()
            .get(&filter.name)
            .map(|ev| filter.matches(ev))
            .unwrap_or(false)
    }
}

/// Configuration for the polling thread, resolved from global options.
#[derive(Debug, Clone)]
pub struct ElosConfig {
    pub server: String,
    pub port: u16,
    pub poll_interval: Duration,
}

/// Poll the external event server until shutdown is latched.
///
/// Events arrive one JSON object per line. Every event is evaluated against
/// `filters`; each match updates the snapshot and publishes
/// `(@elos, filter-name)` on the bus.
pub fn poll_external_events(
    conf: &ElosConfig,
    filters: &[EventFilter],
    bus: &EventBus,
    state: &Arc<ExternalEventState>,
) {
    loop {
        if bus.shutdown_requested().is_some() {
            trace!("External event poller observed shutdown latch, exiting");
            return;
        }
        match TcpStream::connect((conf.server.as_str(), conf.port)) {
            Ok(stream) => {
                if let Err(e) = stream.set_read_timeout(Some(conf.poll_interval)) {
                    warn!("Could not set read timeout on event connection: {e}");
                }
                read_event_stream(stream, conf, filters, bus, state);
            }
            Err(e) => {
                trace!(
                    "Could not connect to event server {}:{}: {e}",
                    conf.server, conf.port
                );
                std::thread::sleep(conf.poll_interval);
            }
        }
    }
}

fn read_event_stream(
    stream: TcpStream,
    conf: &ElosConfig,
    filters: &[EventFilter],
    bus: &EventBus,
    state: &Arc<ExternalEventState>,
) {
    let mut reader = std::io::BufReader::new(stream);
    let mut line = String::new();
    loop {
        if bus.shutdown_requested().is_some() {
            return;
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                // Peer closed the connection; reconnect after one interval.
                std::thread::sleep(conf.poll_interval);
                return;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(Value::Object(event)) => {
                        dispatch_event(&event, filters, bus, state);
                    }
                    Ok(other) => {
                        warn!("Ignoring non-object external event: {other}");
                    }
                    Err(e) => {
                        warn!("Could not decode external event: {e}");
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Poll deadline; loop to re-check the shutdown latch.
                continue;
            }
            Err(e) => {
                warn!("External event connection failed: {e}");
                return;
            }
        }
    }
}

fn dispatch_event(
    event: &serde_json::Map<String, Value>,
    filters: &[EventFilter],
    bus: &EventBus,
    state: &Arc<ExternalEventState>,
) {
    for filter in filters {
        if filter.matches(event) {
            trace!("External event matched filter {}", filter.name);
            state.record(&filter.name, event.clone());
            bus.publish(DepRef {
                task: ELOS_DEP_NAMESPACE.to_owned(),
                event: filter.name.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(json: &str) -> serde_json::Map<String, Value> {
        match serde_json::from_str(json).unwrap() {
            Value::Object(m) => m,
            _ => panic!("test event must be an object"),
        }
    }

    #[test]
    fn parse_single_string_predicate() {
        let f = EventFilter::parse("SRC={.appName=\"net\"}").unwrap();
        assert_eq!(f.name, "SRC");
        assert_eq!(f.predicates.len(), 1);
        assert_eq!(f.predicates[0].field, "appName");
        assert_eq!(f.predicates[0].op, FilterOp::Eq);
        assert_eq!(f.predicates[0].value, Value::String("net".into()));
    }

    #[test]
    fn parse_multiple_predicates_with_ops() {
        let f = EventFilter::parse("SEV={.severity>2,.source.appName!=\"kernel\"}").unwrap();
        assert_eq!(f.predicates.len(), 2);
        assert_eq!(f.predicates[0].op, FilterOp::Gt);
        assert_eq!(f.predicates[1].op, FilterOp::Ne);
        assert_eq!(f.predicates[1].field, "source.appName");
    }

    #[test]
    fn parse_rejects_malformed_rules() {
        assert!(EventFilter::parse("NOBRACES=.appName=\"x\"").is_err());
        assert!(EventFilter::parse("={.appName=\"x\"}").is_err());
        assert!(EventFilter::parse("EMPTY={}").is_err());
        assert!(EventFilter::parse("BADFIELD={appName=\"x\"}").is_err());
    }

    #[test]
    fn matches_string_and_number_fields() {
        let f = EventFilter::parse("M={.appName=\"net\",.severity>2}").unwrap();
        assert!(f.matches(&event(r#"{"appName":"net","severity":3}"#)));
        assert!(!f.matches(&event(r#"{"appName":"net","severity":2}"#)));
        assert!(!f.matches(&event(r#"{"appName":"disk","severity":5}"#)));
        assert!(!f.matches(&event(r#"{"severity":5}"#)));
    }

    #[test]
    fn matches_nested_fields() {
        let f = EventFilter::parse("M={.source.appName=\"sshd\"}").unwrap();
        assert!(f.matches(&event(r#"{"source":{"appName":"sshd"}}"#)));
        assert!(!f.matches(&event(r#"{"source":{"appName":"cron"}}"#)));
    }

    #[test]
    fn quoted_comma_does_not_split_predicates() {
        let f = EventFilter::parse("M={.msg=\"a,b\"}").unwrap();
        assert_eq!(f.predicates.len(), 1);
        assert_eq!(f.predicates[0].value, Value::String("a,b".into()));
    }

    #[test]
    fn snapshot_satisfaction() {
        let state = ExternalEventState::default();
        let f = EventFilter::parse("SRC={.appName=\"net\"}").unwrap();
        assert!(!state.satisfied(&f));
        state.record("SRC", event(r#"{"appName":"net"}"#));
        assert!(state.satisfied(&f));
    }
}
