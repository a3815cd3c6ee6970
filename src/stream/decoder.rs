use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::Result;
use crate::stream::events::Envelope;

const LOG_PREVIEW_CHARS: usize = 120;

/// Splits a byte stream into lines, buffering the incomplete tail between reads.
///
/// Bytes are buffered rather than decoded chunk by chunk, so a multi-byte
/// character split across two reads is reassembled before UTF-8 decoding.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete[..last_newline]
            .split(|b| *b == b'\n')
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Take whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

fn preview(line: &str) -> String {
    let mut out: String = line.chars().take(LOG_PREVIEW_CHARS).collect();
    if out.len() < line.len() {
        out.push('…');
    }
    out
}

/// Decode a line, logging and dropping it when it can't be understood.
fn decode_or_skip(line: &str) -> Option<Envelope> {
    match Envelope::decode_line(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("⚠️  Skipping unreadable frame: {} | {}", e, preview(line));
            None
        }
    }
}

/// Turn a byte stream into envelopes.
///
/// Malformed lines are skipped. The stream ends after a `Done` envelope, at
/// end of input, or right after yielding the first I/O error.
pub fn decode_envelopes<S>(bytes: S) -> impl Stream<Item = Result<Envelope>>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    async_stream::stream! {
        let mut bytes = bytes;
        let mut lines = LineDecoder::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            for line in lines.push(&chunk) {
                if let Some(envelope) = decode_or_skip(&line) {
                    let terminal = envelope.is_terminal();
                    yield Ok(envelope);
                    if terminal {
                        return;
                    }
                }
            }
        }

        if let Some(line) = lines.finish() {
            if let Some(envelope) = decode_or_skip(&line) {
                yield Ok(envelope);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use futures::stream;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes>> + Unpin {
        let owned: Vec<Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        stream::iter(owned)
    }

    async fn collect(parts: &[&str]) -> Vec<Result<Envelope>> {
        decode_envelopes(chunks(parts)).collect().await
    }

    #[test]
    fn test_line_decoder_buffers_partial_lines() {
        let mut lines = LineDecoder::new();
        assert!(lines.push(b"{\"type\":").is_empty());
        assert_eq!(lines.pending_len(), 8);
        assert_eq!(lines.push(b"\"connected\"}\n\n{\"ty"), vec![
            "{\"type\":\"connected\"}".to_string(),
            String::new(),
        ]);
        assert_eq!(lines.finish().as_deref(), Some("{\"ty"));
        assert_eq!(lines.finish(), None);
    }

    #[test]
    fn test_line_decoder_reassembles_split_utf8() {
        let text = "data: {\"delta\":[[0,\"é\"],9,9]}\n";
        let bytes = text.as_bytes();
        let split = text.find('é').unwrap() + 1;
        let mut lines = LineDecoder::new();
        assert!(lines.push(&bytes[..split]).is_empty());
        let out = lines.push(&bytes[split..]);
        assert_eq!(out, vec![text.trim_end().to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_line_between_patches_is_skipped() {
        let out = collect(&[
            "data: {\"delta\":{\"_t\":\"a\",\"0\":[[0,[\"a\"]]]}}\n",
            "data: {\"delta\": [[0,\n",
            "data: {\"delta\":[[0,1,0,\"b\"],9,9]}\n",
        ])
        .await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|e| matches!(e, Ok(Envelope::Patch(_)))));
    }

    #[tokio::test]
    async fn test_done_sentinel_ends_stream() {
        let out = collect(&[
            "{\"type\":\"connected\"}\ndata: [DONE]\n",
            "data: {\"delta\":[[0,1,0,\"late\"],9,9]}\n",
        ])
        .await;
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Ok(Envelope::Connected)));
        assert!(matches!(out[1], Ok(Envelope::Done)));
    }

    #[tokio::test]
    async fn test_trailing_fragment_decoded_at_end() {
        let out = collect(&["{\"type\":\"connected\"}\n{\"type\":\"done\"}"]).await;
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Ok(Envelope::Done)));
    }

    #[tokio::test]
    async fn test_io_error_is_yielded_and_ends_stream() {
        let items: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"{\"type\":\"connected\"}\n")),
            Err(RelayError::stream("connection reset")),
            Ok(Bytes::from_static(b"{\"type\":\"done\"}\n")),
        ];
        let out: Vec<_> = decode_envelopes(stream::iter(items)).collect().await;
        assert_eq!(out.len(), 2);
        assert!(out[1].is_err());
    }
}
