//! Event vocabulary exchanged between a test-execution worker and the IDE
//!
//! On the wire every event is an [`EventRecord`]: an event name plus an
//! ordered list of arguments, encoded as the JSON array
//! `["start_test", ["T1", {"longname": "S1.T1"}]]`. The emitter never
//! validates argument shapes; the receiver turns records into typed
//! [`RunnerEvent`]s and rejects records whose shape does not match.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Attribute or message mapping attached to an event
pub type Attributes = serde_json::Map<String, Value>;

/// Closed set of event names understood by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    StartSuite,
    EndSuite,
    StartTest,
    EndTest,
    StartKeyword,
    EndKeyword,
    Message,
    LogMessage,
    LogFile,
    OutputFile,
    ReportFile,
    SummaryFile,
    DebugFile,
    Pid,
    Port,
    Close,
}

impl EventName {
    /// Every event name, in declaration order
    pub const ALL: [EventName; 16] = [
        EventName::StartSuite,
        EventName::EndSuite,
        EventName::StartTest,
        EventName::EndTest,
        EventName::StartKeyword,
        EventName::EndKeyword,
        EventName::Message,
        EventName::LogMessage,
        EventName::LogFile,
        EventName::OutputFile,
        EventName::ReportFile,
        EventName::SummaryFile,
        EventName::DebugFile,
        EventName::Pid,
        EventName::Port,
        EventName::Close,
    ];

    /// Wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::StartSuite => "start_suite",
            EventName::EndSuite => "end_suite",
            EventName::StartTest => "start_test",
            EventName::EndTest => "end_test",
            EventName::StartKeyword => "start_keyword",
            EventName::EndKeyword => "end_keyword",
            EventName::Message => "message",
            EventName::LogMessage => "log_message",
            EventName::LogFile => "log_file",
            EventName::OutputFile => "output_file",
            EventName::ReportFile => "report_file",
            EventName::SummaryFile => "summary_file",
            EventName::DebugFile => "debug_file",
            EventName::Pid => "pid",
            EventName::Port => "port",
            EventName::Close => "close",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        EventName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| RelayError::Protocol(format!("Unknown event name: {}", s)))
    }
}

/// One record on the event stream
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub name: EventName,
    pub args: Vec<Value>,
}

impl EventRecord {
    pub fn new(name: EventName, args: Vec<Value>) -> Self {
        Self { name, args }
    }
}

impl Serialize for EventRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (&self.name, &self.args).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EventRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (name, args) = <(EventName, Vec<Value>)>::deserialize(deserializer)?;
        Ok(Self { name, args })
    }
}

/// Typed view of an [`EventRecord`], as seen by the receiver
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    StartSuite { name: String, attributes: Attributes },
    EndSuite { name: String, attributes: Attributes },
    StartTest { name: String, attributes: Attributes },
    EndTest { name: String, attributes: Attributes },
    StartKeyword { name: String, attributes: Attributes },
    EndKeyword { name: String, attributes: Attributes },
    Message(Attributes),
    LogMessage(Attributes),
    LogFile(String),
    OutputFile(String),
    ReportFile(String),
    SummaryFile(String),
    DebugFile(String),
    /// Process id of the worker
    Pid(u32),
    /// Control port of the worker's stop endpoint
    Port(u16),
    Close,
}

impl RunnerEvent {
    pub fn name(&self) -> EventName {
        match self {
            RunnerEvent::StartSuite { .. } => EventName::StartSuite,
            RunnerEvent::EndSuite { .. } => EventName::EndSuite,
            RunnerEvent::StartTest { .. } => EventName::StartTest,
            RunnerEvent::EndTest { .. } => EventName::EndTest,
            RunnerEvent::StartKeyword { .. } => EventName::StartKeyword,
            RunnerEvent::EndKeyword { .. } => EventName::EndKeyword,
            RunnerEvent::Message(_) => EventName::Message,
            RunnerEvent::LogMessage(_) => EventName::LogMessage,
            RunnerEvent::LogFile(_) => EventName::LogFile,
            RunnerEvent::OutputFile(_) => EventName::OutputFile,
            RunnerEvent::ReportFile(_) => EventName::ReportFile,
            RunnerEvent::SummaryFile(_) => EventName::SummaryFile,
            RunnerEvent::DebugFile(_) => EventName::DebugFile,
            RunnerEvent::Pid(_) => EventName::Pid,
            RunnerEvent::Port(_) => EventName::Port,
            RunnerEvent::Close => EventName::Close,
        }
    }
}

impl TryFrom<EventRecord> for RunnerEvent {
    type Error = RelayError;

    fn try_from(record: EventRecord) -> Result<Self> {
        let name = record.name;
        let mut args = ArgReader::new(name, record.args);

        let event = match name {
            EventName::StartSuite => RunnerEvent::StartSuite {
                name: args.string()?,
                attributes: args.mapping()?,
            },
            EventName::EndSuite => RunnerEvent::EndSuite {
                name: args.string()?,
                attributes: args.mapping()?,
            },
            EventName::StartTest => RunnerEvent::StartTest {
                name: args.string()?,
                attributes: args.mapping()?,
            },
            EventName::EndTest => RunnerEvent::EndTest {
                name: args.string()?,
                attributes: args.mapping()?,
            },
            EventName::StartKeyword => RunnerEvent::StartKeyword {
                name: args.string()?,
                attributes: args.mapping()?,
            },
            EventName::EndKeyword => RunnerEvent::EndKeyword {
                name: args.string()?,
                attributes: args.mapping()?,
            },
            EventName::Message => RunnerEvent::Message(args.mapping()?),
            EventName::LogMessage => RunnerEvent::LogMessage(args.mapping()?),
            EventName::LogFile => RunnerEvent::LogFile(args.string()?),
            EventName::OutputFile => RunnerEvent::OutputFile(args.string()?),
            EventName::ReportFile => RunnerEvent::ReportFile(args.string()?),
            EventName::SummaryFile => RunnerEvent::SummaryFile(args.string()?),
            EventName::DebugFile => RunnerEvent::DebugFile(args.string()?),
            EventName::Pid => RunnerEvent::Pid(args.integer()?),
            EventName::Port => RunnerEvent::Port(args.integer()?),
            EventName::Close => RunnerEvent::Close,
        };

        args.finish()?;
        Ok(event)
    }
}

impl From<RunnerEvent> for EventRecord {
    fn from(event: RunnerEvent) -> Self {
        let name = event.name();
        let args = match event {
            RunnerEvent::StartSuite { name, attributes }
            | RunnerEvent::EndSuite { name, attributes }
            | RunnerEvent::StartTest { name, attributes }
            | RunnerEvent::EndTest { name, attributes }
            | RunnerEvent::StartKeyword { name, attributes }
            | RunnerEvent::EndKeyword { name, attributes } => {
                vec![Value::String(name), Value::Object(attributes)]
            }
            RunnerEvent::Message(message) | RunnerEvent::LogMessage(message) => {
                vec![Value::Object(message)]
            }
            RunnerEvent::LogFile(path)
            | RunnerEvent::OutputFile(path)
            | RunnerEvent::ReportFile(path)
            | RunnerEvent::SummaryFile(path)
            | RunnerEvent::DebugFile(path) => vec![Value::String(path)],
            RunnerEvent::Pid(pid) => vec![Value::from(pid)],
            RunnerEvent::Port(port) => vec![Value::from(port)],
            RunnerEvent::Close => Vec::new(),
        };
        EventRecord::new(name, args)
    }
}

/// Positional argument cursor used while validating a record
struct ArgReader {
    event: EventName,
    values: std::vec::IntoIter<Value>,
    position: usize,
}

impl ArgReader {
    fn new(event: EventName, values: Vec<Value>) -> Self {
        Self {
            event,
            values: values.into_iter(),
            position: 0,
        }
    }

    fn next(&mut self) -> Result<Value> {
        let value = self.values.next().ok_or_else(|| {
            RelayError::Protocol(format!(
                "{} is missing argument {}",
                self.event, self.position
            ))
        })?;
        self.position += 1;
        Ok(value)
    }

    fn mismatch(&self, expected: &str, got: &Value) -> RelayError {
        RelayError::Protocol(format!(
            "{} argument {} should be {}, got {}",
            self.event,
            self.position - 1,
            expected,
            got
        ))
    }

    fn string(&mut self) -> Result<String> {
        match self.next()? {
            Value::String(s) => Ok(s),
            other => Err(self.mismatch("a string", &other)),
        }
    }

    fn mapping(&mut self) -> Result<Attributes> {
        match self.next()? {
            Value::Object(map) => Ok(map),
            other => Err(self.mismatch("a mapping", &other)),
        }
    }

    fn integer<T: TryFrom<u64>>(&mut self) -> Result<T> {
        let value = self.next()?;
        value
            .as_u64()
            .and_then(|n| T::try_from(n).ok())
            .ok_or_else(|| self.mismatch("an unsigned integer in range", &value))
    }

    fn finish(mut self) -> Result<()> {
        let extra = self.values.by_ref().count();
        if extra > 0 {
            return Err(RelayError::Protocol(format!(
                "{} has {} unexpected trailing argument(s)",
                self.event, extra
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_event_names_round_trip_through_strings() {
        for name in EventName::ALL {
            assert_eq!(name.as_str().parse::<EventName>().unwrap(), name);
            let json = serde_json::to_string(&name).unwrap();
            assert_eq!(json, format!("\"{}\"", name.as_str()));
        }
        assert!("stop".parse::<EventName>().is_err());
    }

    #[test]
    fn test_record_wire_shape() {
        let record = EventRecord::new(
            EventName::EndTest,
            vec![json!("T1"), json!({"status": "PASS", "tags": ["smoke"]})],
        );
        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(
            encoded,
            json!(["end_test", ["T1", {"status": "PASS", "tags": ["smoke"]}]])
        );

        let close = serde_json::to_string(&EventRecord::new(EventName::Close, vec![])).unwrap();
        assert_eq!(close, r#"["close",[]]"#);
    }

    #[test]
    fn test_record_rejects_unknown_name() {
        let result = serde_json::from_str::<EventRecord>(r#"["explode", []]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_typed_event_from_record() {
        let record = EventRecord::new(
            EventName::StartSuite,
            vec![json!("S1"), json!({"source": "/tmp/s1.robot"})],
        );
        let event = RunnerEvent::try_from(record).unwrap();
        assert_eq!(
            event,
            RunnerEvent::StartSuite {
                name: "S1".to_string(),
                attributes: attrs(json!({"source": "/tmp/s1.robot"})),
            }
        );

        let port = RunnerEvent::try_from(EventRecord::new(EventName::Port, vec![json!(40211)]));
        assert_eq!(port.unwrap(), RunnerEvent::Port(40211));
    }

    #[test]
    fn test_typed_event_shape_errors() {
        let missing = EventRecord::new(EventName::StartTest, vec![json!("T1")]);
        assert!(matches!(
            RunnerEvent::try_from(missing),
            Err(RelayError::Protocol(_))
        ));

        let wrong_type = EventRecord::new(EventName::LogFile, vec![json!(12)]);
        assert!(matches!(
            RunnerEvent::try_from(wrong_type),
            Err(RelayError::Protocol(_))
        ));

        let out_of_range = EventRecord::new(EventName::Port, vec![json!(70000)]);
        assert!(matches!(
            RunnerEvent::try_from(out_of_range),
            Err(RelayError::Protocol(_))
        ));

        let trailing = EventRecord::new(EventName::Close, vec![json!(1)]);
        assert!(matches!(
            RunnerEvent::try_from(trailing),
            Err(RelayError::Protocol(_))
        ));
    }

    #[test]
    fn test_record_from_typed_event() {
        let record: EventRecord = RunnerEvent::Message(attrs(json!({"level": "WARN"}))).into();
        assert_eq!(record.name, EventName::Message);
        assert_eq!(record.args, vec![json!({"level": "WARN"})]);

        let record: EventRecord = RunnerEvent::Close.into();
        assert!(record.args.is_empty());
    }
}
