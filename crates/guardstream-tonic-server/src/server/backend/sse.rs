//! Server-sent events decoding for streaming backend responses.
//!
//! Both TGI and OpenAI-compatible servers frame their streams as SSE blocks
//! separated by a blank line, carrying one JSON document per block and ending
//! with `data: [DONE]` (TGI simply closes the connection instead). A document
//! spread over several `data:` lines is rejoined with newlines.

use bytes::Bytes;
use core::fmt::Display;
use futures::{Stream, StreamExt, stream};
use guardstream_tonic_core::guardstream::{Error, Result};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;

const DONE: &str = "[DONE]";

/// Splits a byte stream into the payloads of its `data:` lines.
///
/// Bytes are buffered until a full block is available, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` terminator has been seen.
    pub const fn is_done(&self) -> bool {
        self.done
    }

    /// Appends `chunk` and returns the payloads of every completed block.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.pending
            .extend(chunk.iter().copied().filter(|&byte| byte != b'\r'));

        let mut payloads = Vec::new();
        while let Some(pos) = find_block_end(&self.pending) {
            let block: Vec<u8> = self.pending.drain(..pos + 2).collect();
            self.collect(&block[..pos], &mut payloads);
            if self.done {
                self.pending.clear();
                break;
            }
        }
        payloads
    }

    /// Flushes a trailing block that was not terminated by a blank line.
    pub fn finish(&mut self) -> Vec<String> {
        let block = core::mem::take(&mut self.pending);
        let mut payloads = Vec::new();
        if !self.done {
            self.collect(&block, &mut payloads);
        }
        payloads
    }

    /// Joins the `data:` lines of one block into a single payload.
    fn collect(&mut self, block: &[u8], out: &mut Vec<String>) {
        let text = String::from_utf8_lossy(block);
        let lines: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.strip_prefix(' ').unwrap_or(data))
            .collect();
        if lines.is_empty() {
            return;
        }

        let data = lines.join("\n");
        let data = data.trim();
        if data == DONE {
            self.done = true;
        } else if !data.is_empty() {
            out.push(data.to_owned());
        }
    }
}

fn find_block_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

struct State<S> {
    body: S,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    finished: bool,
}

/// Turns an HTTP body stream into a stream of SSE `data:` payloads.
///
/// Transport failures end the stream with an [`Error::Backend`].
pub fn data_payloads<S, E>(body: S) -> impl Stream<Item = Result<String>> + Send + 'static
where
    S: Stream<Item = core::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display + 'static,
{
    let state = State {
        body,
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(data) = st.ready.pop_front() {
                return Some((Ok(data), st));
            }
            if st.finished || st.decoder.is_done() {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => st.ready.extend(st.decoder.push(&chunk)),
                Some(Err(e)) => {
                    st.finished = true;
                    let err = Error::Backend {
                        context: format!("stream interrupted: {e}"),
                    };
                    return Some((Err(err), st));
                }
                None => {
                    st.finished = true;
                    st.ready.extend(st.decoder.finish());
                }
            }
        }
    })
}

/// Parses one payload, surfacing in-band backend errors.
///
/// TGI reports failures mid-stream as `{"error": "...", "error_type": "..."}`;
/// those become [`Error::Backend`]. Payloads of any other unexpected shape are
/// [`Error::Cast`].
pub fn parse_payload<T: DeserializeOwned>(data: &str) -> Result<T> {
    let value: serde_json::Value = serde_json::from_str(data).map_err(|e| Error::Cast {
        reason: format!("invalid JSON in stream ({e}): {data}"),
    })?;

    if let Some(error) = value.get("error") {
        let message = error
            .as_str()
            .map(str::to_owned)
            .or_else(|| {
                error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| error.to_string());
        return Err(Error::Backend {
            context: format!("backend reported: {message}"),
        });
    }

    serde_json::from_value(value).map_err(|e| Error::Cast {
        reason: format!("{e}: {data}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::backend::types::ChatCompletionChunk;

    #[test]
    fn splits_blocks_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        assert_eq!(decoder.push(b"1}\n\ndata: {\"a\":2}\n"), vec!["{\"a\":1}"]);
        assert_eq!(decoder.push(b"\n"), vec!["{\"a\":2}"]);
    }

    #[test]
    fn crlf_framing_and_comments() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b": keep-alive\r\n\r\nevent: message\r\ndata: x\r\n\r\n");
        assert_eq!(payloads, vec!["x"]);
    }

    #[test]
    fn data_lines_of_one_block_are_joined() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b"data: {\"a\":\ndata: 1}\n\ndata: 2\n\n");
        assert_eq!(payloads, vec!["{\"a\":\n1}", "2"]);
        assert_eq!(parse_payload::<serde_json::Value>(&payloads[0]).unwrap()["a"], 1);
    }

    #[test]
    fn stops_at_done() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b"data: 1\n\ndata: [DONE]\n\ndata: 2\n\n");
        assert_eq!(payloads, vec!["1"]);
        assert!(decoder.is_done());
        assert!(decoder.push(b"data: 3\n\n").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn multibyte_characters_split_across_chunks() {
        let encoded = "data: héllo\n\n".as_bytes();
        let split = encoded.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&encoded[..split]).is_empty());
        assert_eq!(decoder.push(&encoded[split..]), vec!["héllo"]);
    }

    #[test]
    fn trailing_block_is_flushed() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: last").is_empty());
        assert_eq!(decoder.finish(), vec!["last"]);
    }

    #[tokio::test]
    async fn payload_stream_ends_on_transport_error() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"data: 1\n\n")),
            Err("connection reset"),
            Ok(Bytes::from_static(b"data: 2\n\n")),
        ]);
        let items: Vec<_> = data_payloads(body).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().unwrap(), "1");
        assert!(matches!(items[1], Err(Error::Backend { .. })));
    }

    #[test]
    fn in_band_errors_are_backend_errors() {
        let err = parse_payload::<ChatCompletionChunk>(
            r#"{"error":"Input validation error","error_type":"validation"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Backend { ref context } if context.contains("Input validation")));

        let err = parse_payload::<ChatCompletionChunk>(r#"{"error":{"message":"overloaded"}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Backend { ref context } if context.contains("overloaded")));
    }

    #[test]
    fn malformed_payloads_are_cast_errors() {
        assert!(matches!(
            parse_payload::<ChatCompletionChunk>("not json"),
            Err(Error::Cast { .. })
        ));
        assert!(matches!(
            parse_payload::<ChatCompletionChunk>(r#"{"choices": 3}"#),
            Err(Error::Cast { .. })
        ));
    }
}
