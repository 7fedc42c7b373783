//! Trace sources
//!
//! A [`TraceSource`] yields the definitions block followed by a stream of
//! events. Any error from the source aborts construction; there is no
//! partial engine built from a half-read trace.
//!
//! The JSON-lines format holds one record per line. A record is either a
//! definitions object or an event:
//!
//! ```text
//! {"definitions": {"operations": {"1": "main", "2": "MPI_Send"}}}
//! {"rank": 0, "timestamp": 0, "kind": "enter", "operation": 1}
//! {"rank": 0, "timestamp": 4, "kind": "send", "operation": 2, "communicator": 0, "tag": 5, "peer": 1, "payload_bytes": 100}
//! ```
//!
//! Definitions records must come before the first event. Blank lines and
//! lines starting with `#` are skipped.

use crate::error::TraceSourceError;
use crate::event::{Event, RankId, TraceDefinitions};
use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Producer of trace definitions and events
pub trait TraceSource {
    /// Definitions block; called once, before the first event
    fn definitions(&mut self) -> Result<TraceDefinitions, TraceSourceError>;

    /// Next event in arrival order, `None` at the end of the trace
    fn next_event(&mut self) -> Option<Result<Event, TraceSourceError>>;
}

/// A fully read trace, events grouped per rank in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceInput {
    pub definitions: TraceDefinitions,
    pub ranks: BTreeMap<RankId, Vec<Event>>,
}

impl TraceInput {
    pub fn new(definitions: TraceDefinitions) -> Self {
        Self {
            definitions,
            ranks: BTreeMap::new(),
        }
    }

    /// Group already decoded events by rank
    pub fn from_events<I: IntoIterator<Item = Event>>(
        definitions: TraceDefinitions,
        events: I,
    ) -> Self {
        let mut input = Self::new(definitions);
        for event in events {
            input.push(event);
        }
        input
    }

    /// Drain a source completely
    ///
    /// # Errors
    ///
    /// The first error the source reports, or invalid definitions.
    pub fn read<S: TraceSource + ?Sized>(source: &mut S) -> Result<Self, TraceSourceError> {
        let definitions = source.definitions()?;
        definitions.validate()?;
        let mut input = Self::new(definitions);
        while let Some(event) = source.next_event() {
            input.push(event?);
        }
        tracing::debug!(
            ranks = input.ranks.len(),
            events = input.event_count(),
            "trace read"
        );
        Ok(input)
    }

    pub fn push(&mut self, event: Event) {
        self.ranks.entry(event.rank).or_default().push(event);
    }

    pub fn event_count(&self) -> usize {
        self.ranks.values().map(Vec::len).sum()
    }
}

/// In-memory source, mainly for tests and embedders
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    definitions: TraceDefinitions,
    events: VecDeque<Event>,
}

impl MemorySource {
    pub fn new(definitions: TraceDefinitions, events: Vec<Event>) -> Self {
        Self {
            definitions,
            events: events.into(),
        }
    }
}

impl TraceSource for MemorySource {
    fn definitions(&mut self) -> Result<TraceDefinitions, TraceSourceError> {
        Ok(self.definitions.clone())
    }

    fn next_event(&mut self) -> Option<Result<Event, TraceSourceError>> {
        self.events.pop_front().map(Ok)
    }
}

/// JSON-lines source over any buffered reader
pub struct JsonLinesSource<R> {
    reader: R,
    line: usize,
    buffer: String,
    pending: Option<Event>,
    started: bool,
}

impl JsonLinesSource<BufReader<File>> {
    /// Open a JSON-lines trace file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TraceSourceError> {
        let file = File::open(path.as_ref())?;
        Ok(Self::new(BufReader::new(file)))
    }
}

enum Record {
    Definitions(TraceDefinitions),
    Event(Event),
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buffer: String::new(),
            pending: None,
            started: false,
        }
    }

    fn decode_error(&self, message: impl Into<String>) -> TraceSourceError {
        TraceSourceError::Decode {
            line: self.line,
            message: message.into(),
        }
    }

    /// Next non-blank, non-comment record
    fn next_record(&mut self) -> Result<Option<Record>, TraceSourceError> {
        loop {
            self.buffer.clear();
            if self.reader.read_line(&mut self.buffer)? == 0 {
                return Ok(None);
            }
            self.line += 1;
            let text = self.buffer.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }

            let value: serde_json::Value =
                serde_json::from_str(text).map_err(|e| self.decode_error(e.to_string()))?;
            let record = match value {
                serde_json::Value::Object(mut map) if map.contains_key("definitions") => {
                    let definitions = map.remove("definitions").unwrap_or_default();
                    Record::Definitions(
                        serde_json::from_value(definitions)
                            .map_err(|e| self.decode_error(format!("definitions: {}", e)))?,
                    )
                }
                other => Record::Event(
                    serde_json::from_value(other)
                        .map_err(|e| self.decode_error(format!("event: {}", e)))?,
                ),
            };
            return Ok(Some(record));
        }
    }
}

impl<R: BufRead> TraceSource for JsonLinesSource<R> {
    fn definitions(&mut self) -> Result<TraceDefinitions, TraceSourceError> {
        let mut definitions = TraceDefinitions::default();
        while let Some(record) = self.next_record()? {
            match record {
                Record::Definitions(more) => {
                    definitions.operations.extend(more.operations);
                    definitions.communicators.extend(more.communicators);
                    definitions.localities.extend(more.localities);
                }
                Record::Event(event) => {
                    self.pending = Some(event);
                    break;
                }
            }
        }
        self.started = true;
        Ok(definitions)
    }

    fn next_event(&mut self) -> Option<Result<Event, TraceSourceError>> {
        if !self.started {
            self.started = true;
            // Callers that skip definitions still get every event
            if let Err(e) = self.definitions() {
                return Some(Err(e));
            }
        }
        if let Some(event) = self.pending.take() {
            return Some(Ok(event));
        }
        match self.next_record() {
            Ok(Some(Record::Event(event))) => Some(Ok(event)),
            Ok(Some(Record::Definitions(_))) => Some(Err(
                self.decode_error("definitions record after the first event")
            )),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
