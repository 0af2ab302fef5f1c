//! Incremental decoder for the streaming batch-response format.
//!
//! The wire shape is a JSON object split across lines so it can be consumed
//! before the response finishes:
//!
//! ```text
//! {
//! "0":{...}
//! ,"2":{...}
//! ,"1":{...}
//! }
//! ```
//!
//! Each line after the first carries one index-keyed result, in arrival
//! order (not index order). If the first line is not literally `{`, some
//! intermediary buffered and reformatted the response; the whole body is
//! then treated as one JSON document and delivered as a single
//! [`StreamEvent::Aggregate`].

use std::collections::VecDeque;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::TransportError;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// One decoded line: the batch index it belongs to and its value.
    Item { index: usize, value: Value },
    /// Full-document fallback for non-streamed bodies.
    Aggregate(Value),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    /// Waiting for the first full line to decide between modes.
    Detecting,
    /// Streaming line-per-item format.
    Lines,
    /// Buffering the whole body for one aggregate parse.
    Fallback,
    /// Saw the closing `}`; everything further is ignored.
    Done,
}

/// Push chunks in, get decoded events out. Chunk boundaries are arbitrary;
/// events are emitted as soon as their line is complete.
#[derive(Debug)]
pub struct JsonStreamParser {
    buffer: String,
    mode: Mode,
}

impl Default for JsonStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonStreamParser {
    pub fn new() -> Self {
        JsonStreamParser {
            buffer: String::new(),
            mode: Mode::Detecting,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, TransportError> {
        let text = std::str::from_utf8(chunk)
            .map_err(|_| TransportError::Codec("response is not valid UTF-8".into()))?;
        self.buffer.push_str(text);

        let mut events = Vec::new();
        loop {
            match self.mode {
                Mode::Detecting => {
                    let Some(newline) = self.buffer.find('\n') else {
                        break;
                    };
                    if self.buffer[..newline].trim_end_matches('\r') == "{" {
                        self.buffer.drain(..=newline);
                        self.mode = Mode::Lines;
                    } else {
                        // Keep the first line: the whole body is one document.
                        self.mode = Mode::Fallback;
                    }
                }
                Mode::Lines => {
                    let Some(newline) = self.buffer.find('\n') else {
                        break;
                    };
                    let line: String = self.buffer.drain(..=newline).collect();
                    if let Some(event) = self.parse_line(line.trim_end_matches(['\n', '\r']))? {
                        events.push(event);
                    }
                }
                Mode::Fallback | Mode::Done => break,
            }
        }
        Ok(events)
    }

    /// Flush at end of stream. Yields the aggregate document when the body
    /// never followed the line format, or a final unterminated line's item.
    pub fn finish(mut self) -> Result<Option<StreamEvent>, TransportError> {
        match self.mode {
            Mode::Done => Ok(None),
            Mode::Lines => {
                let line = std::mem::take(&mut self.buffer);
                self.parse_line(line.trim_end_matches(['\n', '\r']))
            }
            Mode::Detecting | Mode::Fallback => {
                let body = self.buffer.trim();
                if body.is_empty() {
                    return Ok(None);
                }
                let value: Value = serde_json::from_str(body).map_err(|e| {
                    TransportError::Codec(format!("aggregate response parse failed: {}", e))
                })?;
                Ok(Some(StreamEvent::Aggregate(value)))
            }
        }
    }

    fn parse_line(&mut self, line: &str) -> Result<Option<StreamEvent>, TransportError> {
        // Lines after the first item start with a comma.
        let line = line.strip_prefix(',').unwrap_or(line);
        if line.is_empty() {
            return Ok(None);
        }
        if line == "}" {
            self.mode = Mode::Done;
            return Ok(None);
        }

        let rest = line
            .strip_prefix('"')
            .ok_or_else(|| TransportError::Codec(format!("malformed stream line: {line}")))?;
        let quote = rest
            .find('"')
            .ok_or_else(|| TransportError::Codec(format!("malformed stream line: {line}")))?;
        let index: usize = rest[..quote]
            .parse()
            .map_err(|_| TransportError::Codec(format!("invalid stream index: {line}")))?;
        let payload = rest[quote + 1..]
            .strip_prefix(':')
            .ok_or_else(|| TransportError::Codec(format!("malformed stream line: {line}")))?;
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| TransportError::Codec(format!("stream item parse failed: {}", e)))?;
        Ok(Some(StreamEvent::Item { index, value }))
    }
}

/// Pull-based wrapper over a byte stream. One event per call; no chunk is
/// decoded before the previous event was consumed.
pub struct JsonStreamReader<S> {
    stream: S,
    parser: Option<JsonStreamParser>,
    queued: VecDeque<StreamEvent>,
}

impl<S> std::fmt::Debug for JsonStreamReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonStreamReader")
    }
}

impl<S> JsonStreamReader<S>
where
    S: Stream<Item = Result<Bytes, TransportError>> + Unpin,
{
    pub fn new(stream: S) -> Self {
        JsonStreamReader {
            stream,
            parser: Some(JsonStreamParser::new()),
            queued: VecDeque::new(),
        }
    }

    /// `Ok(None)` means the stream is exhausted.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>, TransportError> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Ok(Some(event));
            }
            let Some(parser) = self.parser.as_mut() else {
                return Ok(None);
            };
            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    self.queued.extend(parser.feed(&chunk)?);
                }
                Some(Err(e)) => {
                    self.parser = None;
                    return Err(e);
                }
                None => {
                    let parser = self.parser.take().unwrap_or_default();
                    if let Some(event) = parser.finish()? {
                        self.queued.push_back(event);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed_all(parser: &mut JsonStreamParser, text: &str) -> Vec<StreamEvent> {
        parser.feed(text.as_bytes()).unwrap()
    }

    #[test]
    fn parses_items_in_arrival_order() {
        let mut parser = JsonStreamParser::new();
        let events = feed_all(
            &mut parser,
            "{\n\"0\":{\"a\":1}\n,\"2\":{\"c\":3}\n,\"1\":{\"b\":2}\n}",
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Item {
                    index: 0,
                    value: json!({"a": 1})
                },
                StreamEvent::Item {
                    index: 2,
                    value: json!({"c": 3})
                },
                StreamEvent::Item {
                    index: 1,
                    value: json!({"b": 2})
                },
            ]
        );
        // Terminator consumed; nothing more at finish.
        assert_eq!(parser.finish().unwrap(), None);
    }

    #[test]
    fn delivers_partial_lines_as_soon_as_complete() {
        let mut parser = JsonStreamParser::new();
        assert!(feed_all(&mut parser, "{\n\"0\":{\"a\"").is_empty());
        let events = feed_all(&mut parser, ":1}\n,\"1\"");
        assert_eq!(
            events,
            vec![StreamEvent::Item {
                index: 0,
                value: json!({"a": 1})
            }]
        );
        let events = feed_all(&mut parser, ":2\n}\n");
        assert_eq!(
            events,
            vec![StreamEvent::Item {
                index: 1,
                value: json!(2)
            }]
        );
    }

    #[test]
    fn falls_back_to_aggregate_document() {
        let mut parser = JsonStreamParser::new();
        let events = feed_all(&mut parser, "[{\"result\":{\"data\":1}},\n {\"result\"");
        assert!(events.is_empty());
        parser.feed(b":{\"data\":2}}]").unwrap();
        assert_eq!(
            parser.finish().unwrap(),
            Some(StreamEvent::Aggregate(json!([
                {"result": {"data": 1}},
                {"result": {"data": 2}}
            ])))
        );
    }

    #[test]
    fn single_line_body_without_newline_is_aggregate() {
        let mut parser = JsonStreamParser::new();
        assert!(parser.feed(b"{\"result\":{\"data\":5}}").unwrap().is_empty());
        assert_eq!(
            parser.finish().unwrap(),
            Some(StreamEvent::Aggregate(json!({"result": {"data": 5}})))
        );
    }

    #[test]
    fn malformed_line_is_a_codec_error() {
        let mut parser = JsonStreamParser::new();
        feed_all(&mut parser, "{\n");
        assert!(parser.feed(b"0:{}\n").is_err());
    }

    #[test]
    fn ignores_blank_lines_and_crlf() {
        let mut parser = JsonStreamParser::new();
        let events = feed_all(&mut parser, "{\r\n\"3\":true\r\n\r\n}\r\n");
        assert_eq!(
            events,
            vec![StreamEvent::Item {
                index: 3,
                value: json!(true)
            }]
        );
    }

    #[tokio::test]
    async fn reader_pulls_one_event_at_a_time() {
        let chunks: Vec<Result<Bytes, TransportError>> = vec![
            Ok(Bytes::from_static(b"{\n\"0\":1\n")),
            Ok(Bytes::from_static(b",\"1\":2\n}")),
        ];
        let stream = futures::stream::iter(chunks);
        let mut reader = JsonStreamReader::new(stream);

        assert_eq!(
            reader.next_event().await.unwrap(),
            Some(StreamEvent::Item {
                index: 0,
                value: json!(1)
            })
        );
        assert_eq!(
            reader.next_event().await.unwrap(),
            Some(StreamEvent::Item {
                index: 1,
                value: json!(2)
            })
        );
        assert_eq!(reader.next_event().await.unwrap(), None);
    }

    proptest::proptest! {
        /// Chunk boundaries must never change what gets decoded.
        #[test]
        fn chunking_is_transparent(split in 1usize..40) {
            let body = "{\n\"0\":{\"a\":1}\n,\"2\":{\"c\":3}\n,\"1\":{\"b\":2}\n}";
            let mut parser = JsonStreamParser::new();
            let mut events = Vec::new();
            for chunk in body.as_bytes().chunks(split) {
                events.extend(parser.feed(chunk).unwrap());
            }
            if let Some(event) = parser.finish().unwrap() {
                events.push(event);
            }
            proptest::prop_assert_eq!(events.len(), 3);
            proptest::prop_assert_eq!(
                events.iter().map(|e| match e {
                    StreamEvent::Item { index, .. } => *index,
                    StreamEvent::Aggregate(_) => usize::MAX,
                }).collect::<Vec<_>>(),
                vec![0, 2, 1]
            );
        }
    }
}
