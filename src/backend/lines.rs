//! Incremental line framing for streamed HTTP bodies.
//!
//! Both NDJSON (Ollama) and SSE (OpenAI) arrive as arbitrary byte chunks, so
//! a line or even a UTF-8 sequence can be split across two chunks.

use crate::error::BackendError;
use futures::stream::{Stream, StreamExt};

/// Buffers bytes until complete `\n`-terminated lines are available.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    /// Feed a chunk and return every line it completed, without terminators.
    /// Blank lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(line) = decode(&raw[..raw.len() - 1]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Return whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        decode(&rest)
    }
}

/// What a single decoded line means to the stream.
#[derive(Debug, PartialEq)]
pub enum LineEvent<T> {
    /// A value to hand to the consumer.
    Item(T),
    /// Keep-alives, comments and empty deltas.
    Skip,
    /// The server signalled the end, possibly with one last value.
    Done(Option<T>),
}

/// Turn a chunked HTTP body into a stream of decoded values.
///
/// The stream stops at the first error or at [`LineEvent::Done`]. When
/// `require_done` is set, a body that closes without the terminator yields a
/// decode error instead of ending silently.
pub fn decode_lines<S, B, T, F>(
    backend: &'static str,
    body: S,
    require_done: bool,
    mut parse: F,
) -> impl Stream<Item = Result<T, BackendError>> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    T: Send + 'static,
    F: FnMut(&str) -> Result<LineEvent<T>, BackendError> + Send + 'static,
{
    async_stream::stream! {
        let mut body = Box::pin(body);
        let mut splitter = LineSplitter::default();

        loop {
            let (batch, closed) = match body.next().await {
                Some(Ok(chunk)) => (splitter.push(chunk.as_ref()), false),
                Some(Err(source)) => {
                    yield Err(BackendError::Connection { backend, source });
                    return;
                }
                None => (splitter.finish().into_iter().collect::<Vec<_>>(), true),
            };

            for line in batch {
                match parse(&line) {
                    Ok(LineEvent::Item(item)) => {
                        yield Ok(item);
                    }
                    Ok(LineEvent::Skip) => {}
                    Ok(LineEvent::Done(last)) => {
                        if let Some(item) = last {
                            yield Ok(item);
                        }
                        return;
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }

            if closed {
                break;
            }
        }

        if require_done {
            yield Err(BackendError::decode(backend, "stream closed before completion"));
        }
    }
}

fn decode(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches('\r');
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_lines() {
        let mut splitter = LineSplitter::default();
        let lines = splitter.push(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert!(splitter.finish().is_none());
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"data: hel").is_empty());
        assert_eq!(splitter.push(b"lo\r\n\r\ndata: x"), vec!["data: hello"]);
        assert_eq!(splitter.finish().as_deref(), Some("data: x"));
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let bytes = "héllo\n".as_bytes();
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(&bytes[..2]).is_empty());
        assert_eq!(splitter.push(&bytes[2..]), vec!["héllo"]);
    }

    fn body(chunks: &[&'static str]) -> impl Stream<Item = Result<&'static [u8], reqwest::Error>> {
        futures::stream::iter(chunks.iter().map(|c| Ok::<_, reqwest::Error>(c.as_bytes())).collect::<Vec<_>>())
    }

    fn parse_numbers(line: &str) -> Result<LineEvent<u32>, BackendError> {
        match line {
            "end" => Ok(LineEvent::Done(None)),
            "skip" => Ok(LineEvent::Skip),
            other => other
                .parse()
                .map(LineEvent::Item)
                .map_err(|_| BackendError::decode("test", other)),
        }
    }

    #[tokio::test]
    async fn test_decode_lines_stops_at_done() {
        let stream = decode_lines("test", body(&["1\n2", "\nskip\nend\n3\n"]), true, parse_numbers);
        let items: Vec<_> = stream.collect().await;
        let values: Vec<u32> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_decode_lines_requires_terminator() {
        let stream = decode_lines("test", body(&["1\n2"]), true, parse_numbers);
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(*items[1].as_ref().unwrap(), 2);
        assert!(matches!(items[2], Err(BackendError::Decode { .. })));
    }

    #[tokio::test]
    async fn test_decode_lines_without_terminator_ends_quietly() {
        let stream = decode_lines("test", body(&["7\n"]), false, parse_numbers);
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_decode_lines_stops_at_parse_error() {
        let stream = decode_lines("test", body(&["1\nx\n2\nend\n"]), true, parse_numbers);
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }
}
