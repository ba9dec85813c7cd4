//! Server-Sent Events frame parser for streamed chat completions.
//!
//! The transport hands over bytes in arbitrary slices. The parser keeps a
//! carry-over buffer, splits on `\n`, and re-buffers the trailing partial
//! line. Buffering happens on raw bytes, so a multi-byte UTF-8 character
//! split across two reads is reassembled before it is decoded.
//!
//! ```text
//!   read 1: b"data: {\"id\":\"a\"}\ndata: {\"i"
//!   read 2: b"d\":\"b\"}\ndata: [DONE]\n"
//!
//!   frames: Data({"id":"a"}), Data({"id":"b"}), Done
//! ```
//!
//! Only lines starting with `data: ` are frames. Blank lines, comments and
//! `event:`/`id:` fields are skipped. `[DONE]` ends the sequence and anything
//! after it is discarded. A final `data:` line with no trailing newline is
//! still emitted when the input ends.

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::error::InferenceError;
use super::types::{ChatCompletionChunk, ChunkStream};

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// One complete SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    Done,
}

/// Incremental line-oriented SSE parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    done: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `[DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed the next slice of bytes and return every frame it completes.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        if self.done {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(frame) = self.parse_line(&line[..newline]) {
                frames.push(frame);
                if self.done {
                    self.buffer.clear();
                    break;
                }
            }
        }
        frames
    }

    /// Flush the buffer at end of input.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.done || self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        self.parse_line(&line)
    }

    fn parse_line(&mut self, line: &[u8]) -> Option<SseFrame> {
        let line = String::from_utf8_lossy(line);
        let payload = line.trim().strip_prefix(DATA_PREFIX)?;
        if payload == DONE_SENTINEL {
            self.done = true;
            return Some(SseFrame::Done);
        }
        Some(SseFrame::Data(payload.to_string()))
    }
}

/// Decode one `data:` payload as a completion chunk.
pub fn decode_chunk(payload: &str) -> Result<ChatCompletionChunk, InferenceError> {
    serde_json::from_str(payload).map_err(|e| {
        InferenceError::transport_failed(format!("Malformed stream chunk: {}", e)).with_cause(e)
    })
}

/// Turn a response byte stream into a chunk stream.
///
/// Cancelling `cancel` ends the stream with an `aborted` item. A read error
/// or malformed payload ends it with `transport-failed`.
pub fn parse_sse_stream<S, B, E>(bytes: S, cancel: CancellationToken) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    Box::pin(async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut parser = SseParser::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = bytes.next() => Some(next),
            };
            let Some(next) = next else {
                tracing::debug!("SSE: stream cancelled by caller");
                yield Err(InferenceError::aborted("Stream aborted"));
                return;
            };

            match next {
                Some(Ok(slice)) => {
                    for frame in parser.push(slice.as_ref()) {
                        match frame {
                            SseFrame::Data(payload) => {
                                let chunk = decode_chunk(&payload);
                                let failed = chunk.is_err();
                                yield chunk;
                                if failed {
                                    return;
                                }
                            }
                            SseFrame::Done => return,
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("SSE: stream read failed: {}", e);
                    yield Err(InferenceError::transport_failed(format!("Stream read failed: {}", e)).with_cause(e));
                    return;
                }
                None => break,
            }
        }

        if let Some(SseFrame::Data(payload)) = parser.finish() {
            yield decode_chunk(&payload);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::error::ErrorCode;
    use crate::orchestrator::types::FinishReason;

    fn chunk_line(id: &str, text: &str) -> String {
        format!(
            "data: {{\"id\":\"{}\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{}\"}},\"finish_reason\":null}}]}}\n",
            id, text
        )
    }

    fn byte_stream(
        parts: Vec<Vec<u8>>,
    ) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
        futures::stream::iter(parts.into_iter().map(Ok))
    }

    async fn collect(stream: ChunkStream) -> Vec<Result<ChatCompletionChunk, InferenceError>> {
        stream.collect().await
    }

    #[test]
    fn test_split_line_reassembled() {
        let line = chunk_line("a", "hello");
        let bytes = line.as_bytes();
        for offset in 1..bytes.len() {
            let mut parser = SseParser::new();
            let mut frames = parser.push(&bytes[..offset]);
            frames.extend(parser.push(&bytes[offset..]));
            assert_eq!(frames.len(), 1, "split at {}", offset);
            assert!(matches!(&frames[0], SseFrame::Data(p) if p.contains("hello")));
        }
    }

    #[test]
    fn test_multibyte_character_split() {
        let line = chunk_line("a", "héllo");
        let bytes = line.as_bytes();
        let split = line.find('é').unwrap() + 1;

        let mut parser = SseParser::new();
        assert!(parser.push(&bytes[..split]).is_empty());
        let frames = parser.push(&bytes[split..]);
        let SseFrame::Data(payload) = &frames[0] else {
            panic!("expected data frame");
        };
        assert_eq!(decode_chunk(payload).unwrap().delta_content(), "héllo");
    }

    #[test]
    fn test_non_data_lines_ignored() {
        let mut parser = SseParser::new();
        let frames = parser.push(b": keep-alive\n\nevent: message\nid: 4\ndata:nospace\n  data: x  \r\n");
        assert_eq!(frames, vec![SseFrame::Data("x".into())]);
    }

    #[test]
    fn test_done_discards_rest() {
        let mut parser = SseParser::new();
        let frames = parser.push(b"data: [DONE]\ndata: {\"late\":true}\n");
        assert_eq!(frames, vec![SseFrame::Done]);
        assert!(parser.is_done());
        assert!(parser.push(b"data: more\n").is_empty());
        assert!(parser.finish().is_none());
    }

    #[tokio::test]
    async fn test_stream_without_trailing_newline() {
        let body = format!("{}{}", chunk_line("a", "one"), chunk_line("b", "two"));
        let body = body.trim_end().as_bytes().to_vec();
        let chunks = collect(parse_sse_stream(byte_stream(vec![body]), CancellationToken::new())).await;

        let texts: Vec<_> = chunks
            .iter()
            .map(|c| c.as_ref().unwrap().delta_content().to_string())
            .collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_stream_stops_at_done() {
        let body = format!(
            "{}data: [DONE]\n{}",
            chunk_line("a", "kept"),
            chunk_line("b", "dropped")
        );
        let parts = body
            .as_bytes()
            .chunks(7)
            .map(|c| c.to_vec())
            .collect::<Vec<_>>();
        let chunks = collect(parse_sse_stream(byte_stream(parts), CancellationToken::new())).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_vendor_finish_reason_keeps_stream_open() {
        let vendor = "data: {\"id\":\"v\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":null},\"finish_reason\":\"function_call\"}]}\n";
        let parts = vec![chunk_line("a", "call").into_bytes(), vendor.as_bytes().to_vec()];
        let chunks = collect(parse_sse_stream(byte_stream(parts), CancellationToken::new())).await;

        assert_eq!(chunks.len(), 2);
        let last = chunks[1].as_ref().unwrap();
        assert_eq!(last.choices[0].finish_reason, Some(FinishReason::Other));
        assert_eq!(last.delta_content(), "");
    }

    #[tokio::test]
    async fn test_malformed_payload_is_transport_failure() {
        let parts = vec![b"data: {not json}\n".to_vec(), chunk_line("b", "x").into_bytes()];
        let chunks = collect(parse_sse_stream(byte_stream(parts), CancellationToken::new())).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].as_ref().unwrap_err().code(),
            ErrorCode::TransportFailed
        );
    }

    #[tokio::test]
    async fn test_cancelled_stream_yields_aborted() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pending = futures::stream::pending::<Result<Vec<u8>, std::io::Error>>();
        let chunks = collect(parse_sse_stream(pending, cancel)).await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].as_ref().unwrap_err().is_cancellation());
    }
}
