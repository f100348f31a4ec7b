use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ClientError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(String),
    Done,
    Aborted,
}

/// Incremental UTF-8 decoder. A character split across two reads is
/// emitted once its remaining bytes arrive.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // incomplete sequence at the end, wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

enum Read {
    Cancelled,
    Next(Option<Result<Vec<u8>, ClientError>>),
}

/// Once it reports `Done`, `Aborted` or an error, every later call returns `Done`.
pub struct TextStream {
    inner: Option<ByteStream>,
    decoder: Utf8Decoder,
}

impl TextStream {
    pub fn new(inner: ByteStream) -> Self {
        Self { inner: Some(inner), decoder: Utf8Decoder::default() }
    }

    pub async fn next_chunk(&mut self, cancel: &CancellationToken) -> Result<StreamEvent, ClientError> {
        loop {
            let Some(inner) = self.inner.as_mut() else { return Ok(StreamEvent::Done) };
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => Read::Cancelled,
                next = inner.next() => Read::Next(next),
            };
            match read {
                Read::Cancelled => {
                    self.inner = None;
                    return Ok(StreamEvent::Aborted);
                }
                Read::Next(Some(Ok(bytes))) => {
                    let text = self.decoder.decode(&bytes);
                    if !text.is_empty() {
                        return Ok(StreamEvent::Chunk(text));
                    }
                }
                Read::Next(Some(Err(e))) => {
                    self.inner = None;
                    return Err(e);
                }
                Read::Next(None) => {
                    self.inner = None;
                    let tail = self.decoder.finish();
                    if !tail.is_empty() {
                        return Ok(StreamEvent::Chunk(tail));
                    }
                    return Ok(StreamEvent::Done);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn byte_stream(parts: Vec<&[u8]>) -> ByteStream {
        let owned: Vec<Result<Vec<u8>, ClientError>> = parts.into_iter().map(|p| Ok(p.to_vec())).collect();
        stream::iter(owned).boxed()
    }

    async fn drain(mut reader: TextStream) -> Vec<String> {
        let token = CancellationToken::new();
        let mut chunks = Vec::new();
        while let StreamEvent::Chunk(c) = reader.next_chunk(&token).await.unwrap() {
            chunks.push(c);
        }
        chunks
    }

    #[tokio::test]
    async fn chunks_arrive_in_order_then_done() {
        let reader = TextStream::new(byte_stream(vec!["Mining ".as_bytes(), "lease ".as_bytes(), "renewal".as_bytes()]));
        assert_eq!(drain(reader).await, vec!["Mining ", "lease ", "renewal"]);
    }

    #[tokio::test]
    async fn chunk_boundaries_do_not_change_the_text() {
        let text = "Khanan — खनन safety rules ✓ apply.";
        let bytes = text.as_bytes();
        for size in 1..=bytes.len() {
            let parts: Vec<&[u8]> = bytes.chunks(size).collect();
            let joined: String = drain(TextStream::new(byte_stream(parts))).await.concat();
            assert_eq!(joined, text, "chunk size {size}");
        }
    }

    #[test]
    fn decoder_replaces_invalid_and_dangling_bytes() {
        let mut d = Utf8Decoder::default();
        assert_eq!(d.decode(b"ok\xFFgo"), "ok\u{FFFD}go");
        assert_eq!(d.decode(&"é".as_bytes()[..1]), "");
        assert_eq!(d.finish(), "\u{FFFD}");
        assert_eq!(d.finish(), "");
    }

    #[tokio::test]
    async fn cancelled_token_aborts_pending_read() {
        let mut reader = TextStream::new(stream::pending().boxed());
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(reader.next_chunk(&token).await.unwrap(), StreamEvent::Aborted);
        assert_eq!(reader.next_chunk(&CancellationToken::new()).await.unwrap(), StreamEvent::Done);
    }

    #[tokio::test]
    async fn cancel_while_waiting_wakes_reader() {
        let mut reader = TextStream::new(stream::iter(vec![Ok(b"partial".to_vec())]).chain(stream::pending()).boxed());
        let token = CancellationToken::new();
        assert_eq!(reader.next_chunk(&token).await.unwrap(), StreamEvent::Chunk("partial".into()));
        let canceller = token.clone();
        tokio::spawn(async move { canceller.cancel() });
        assert_eq!(reader.next_chunk(&token).await.unwrap(), StreamEvent::Aborted);
    }

    #[tokio::test]
    async fn error_is_reported_once_then_fused() {
        let items: Vec<Result<Vec<u8>, ClientError>> = vec![
            Ok(b"first".to_vec()),
            Err(ClientError::Stream("connection reset".into())),
            Ok(b"never".to_vec()),
        ];
        let mut reader = TextStream::new(stream::iter(items).boxed());
        let token = CancellationToken::new();
        assert_eq!(reader.next_chunk(&token).await.unwrap(), StreamEvent::Chunk("first".into()));
        assert!(matches!(reader.next_chunk(&token).await, Err(ClientError::Stream(_))));
        assert_eq!(reader.next_chunk(&token).await.unwrap(), StreamEvent::Done);
    }
}
