//! First-write fragmentation.
//!
//! [`FragmentedStream`] wraps a connected stream and intercepts the first
//! thing written to it. When that write carries a TLS ClientHello, the record
//! is padded (optionally), cut into chunks around the SNI extension and
//! flushed chunk by chunk with randomized pauses in between, so no single
//! segment on the wire contains the full server name. Everything written
//! afterwards passes straight through.
//!
//! The chunk sizes come from three inclusive ranges, one per region
//! (before-SNI, SNI, after-SNI); the final chunk of a region is simply the
//! remainder when it is smaller than the range minimum.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};
use tracing::trace;

use crate::protocols::tls;

/// How long an incomplete first record may sit in the buffer before it is
/// sealed as-is.
const FIRST_WRITE_WINDOW: Duration = Duration::from_millis(10);

/// Inclusive `[lo, hi]` chunk-size and delay ranges for one connection.
#[derive(Debug, Clone)]
pub struct FragmentPlan {
    pub tls_header_length: usize,
    pub before_sni: (usize, usize),
    pub sni: (usize, usize),
    pub after_sni: (usize, usize),
    /// Milliseconds slept between consecutive chunk flushes.
    pub delay: (u64, u64),
    /// Padding-extension content size, when padding is enabled.
    pub padding: Option<(usize, usize)>,
}

enum State {
    Buffering {
        buf: BytesMut,
        window: Option<Pin<Box<Sleep>>>,
    },
    Writing {
        chunks: VecDeque<Bytes>,
        pos: usize,
        delay: Option<Pin<Box<Sleep>>>,
    },
    Passthrough,
}

pub struct FragmentedStream<S> {
    inner: S,
    plan: FragmentPlan,
    state: State,
}

impl<S> FragmentedStream<S> {
    /// Wrap `inner`, fragmenting its first outbound record.
    pub fn new(inner: S, plan: FragmentPlan) -> Self {
        Self {
            inner,
            plan,
            state: State::Buffering {
                buf: BytesMut::new(),
                window: None,
            },
        }
    }

    /// Wrap `inner` without intercepting anything.
    pub fn passthrough(inner: S, plan: FragmentPlan) -> Self {
        Self {
            inner,
            plan,
            state: State::Passthrough,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn seal_buffer(&mut self) {
        let State::Buffering { buf, .. } = &mut self.state else {
            return;
        };
        let data = std::mem::take(buf);
        let chunks = build_chunks(&data, &self.plan);
        self.state = State::Writing {
            chunks,
            pos: 0,
            delay: None,
        };
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FragmentedStream<S> {
    /// Push queued chunks (and their pauses) into `inner`. Ready once the
    /// stream has become passthrough.
    fn drive(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Self { inner, plan, state } = self;
        loop {
            let State::Writing { chunks, pos, delay } = state else {
                return Poll::Ready(Ok(()));
            };
            if let Some(pause) = delay {
                ready!(pause.as_mut().poll(cx));
                *delay = None;
            }
            match chunks.front() {
                None => {
                    ready!(Pin::new(&mut *inner).poll_flush(cx))?;
                    *state = State::Passthrough;
                    return Poll::Ready(Ok(()));
                }
                Some(chunk) if *pos < chunk.len() => {
                    let n = ready!(Pin::new(&mut *inner).poll_write(cx, &chunk[*pos..]))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                    }
                    *pos += n;
                }
                Some(_) => {
                    // Chunk fully handed over; force it onto the wire before
                    // pausing so the kernel cannot merge it with the next one.
                    ready!(Pin::new(&mut *inner).poll_flush(cx))?;
                    chunks.pop_front();
                    *pos = 0;
                    if !chunks.is_empty() && plan.delay.1 > 0 {
                        let (lo, hi) = plan.delay;
                        let ms = if lo >= hi { hi } else { rand::thread_rng().gen_range(lo..=hi) };
                        *delay = Some(Box::pin(sleep(Duration::from_millis(ms))));
                    }
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for FragmentedStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Passthrough => return Pin::new(&mut this.inner).poll_write(cx, data),
                State::Writing { .. } => {
                    ready!(this.drive(cx))?;
                }
                State::Buffering { buf, window } => {
                    if data.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    buf.extend_from_slice(data);
                    if window.is_none() {
                        *window = Some(Box::pin(sleep(FIRST_WRITE_WINDOW)));
                    }
                    let seal = if buf.len() >= this.plan.tls_header_length {
                        match announced_len(buf) {
                            // Header complete but the record is still arriving;
                            // give it the rest of the window.
                            Some(announced) if buf.len() < announced => false,
                            _ => true,
                        }
                    } else {
                        false
                    };
                    if seal {
                        this.seal_buffer();
                    }
                    return Poll::Ready(Ok(data.len()));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Passthrough => return Pin::new(&mut this.inner).poll_flush(cx),
                State::Writing { .. } => {
                    ready!(this.drive(cx))?;
                }
                State::Buffering { buf, window } => {
                    if buf.is_empty() {
                        return Pin::new(&mut this.inner).poll_flush(cx);
                    }
                    match window {
                        Some(pause) => {
                            ready!(pause.as_mut().poll(cx));
                            this.seal_buffer();
                        }
                        None => this.seal_buffer(),
                    }
                }
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if matches!(this.state, State::Buffering { .. }) {
            this.seal_buffer();
        }
        ready!(this.drive(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentedStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

/// Full record length announced by a buffered standard TLS header.
fn announced_len(buf: &[u8]) -> Option<usize> {
    if buf.len() >= tls::RECORD_HEADER_LEN && buf[0] == 0x16 {
        Some(tls::RECORD_HEADER_LEN + u16::from_be_bytes([buf[3], buf[4]]) as usize)
    } else {
        None
    }
}

/// Turn the sealed first write into the chunk sequence to emit.
fn build_chunks(data: &[u8], plan: &FragmentPlan) -> VecDeque<Bytes> {
    let mut chunks = VecDeque::new();
    if data.is_empty() {
        return chunks;
    }
    if data.len() < plan.tls_header_length || data[0] != 0x16 {
        chunks.push_back(Bytes::copy_from_slice(data));
        return chunks;
    }

    let mut record = data.to_vec();
    if let Some((lo, hi)) = plan.padding {
        let pad = if lo >= hi { hi } else { rand::thread_rng().gen_range(lo..=hi) };
        if tls::splice_padding(&mut record, pad) {
            trace!(pad, "padding extension spliced into client hello");
        }
    }
    split_record(&record, plan)
}

fn split_record(record: &[u8], plan: &FragmentPlan) -> VecDeque<Bytes> {
    let mut rng = rand::thread_rng();
    let header_len = plan.tls_header_length.min(record.len());
    let body = &record[header_len..];
    let mut chunks = VecDeque::new();

    match tls::locate_sni(record) {
        Some(span) if span.start >= header_len && span.end <= record.len() => {
            let sni_start = span.start - header_len;
            let sni_end = span.end - header_len;
            push_region(&mut chunks, &body[..sni_start], plan.before_sni, &mut rng);
            push_region(&mut chunks, &body[sni_start..sni_end], plan.sni, &mut rng);
            push_region(&mut chunks, &body[sni_end..], plan.after_sni, &mut rng);
        }
        _ => {
            // No SNI to straddle: cut the whole span, alternating draws from
            // the two flanking ranges.
            let mut offset = 0;
            let mut use_after = false;
            while offset < body.len() {
                let range = if use_after { plan.after_sni } else { plan.before_sni };
                let n = draw(range, &mut rng).min(body.len() - offset);
                chunks.push_back(Bytes::copy_from_slice(&body[offset..offset + n]));
                offset += n;
                use_after = !use_after;
            }
        }
    }

    // The record header rides on the first chunk, unmodified.
    let mut first = BytesMut::with_capacity(header_len + chunks.front().map_or(0, Bytes::len));
    first.extend_from_slice(&record[..header_len]);
    if let Some(chunk) = chunks.pop_front() {
        first.extend_from_slice(&chunk);
    }
    chunks.push_front(first.freeze());
    chunks
}

fn push_region(chunks: &mut VecDeque<Bytes>, region: &[u8], range: (usize, usize), rng: &mut impl Rng) {
    let mut offset = 0;
    while offset < region.len() {
        let n = draw(range, rng).min(region.len() - offset);
        chunks.push_back(Bytes::copy_from_slice(&region[offset..offset + n]));
        offset += n;
    }
}

fn draw(range: (usize, usize), rng: &mut impl Rng) -> usize {
    let (lo, hi) = range;
    let hi = hi.max(1);
    let lo = lo.clamp(1, hi);
    if lo == hi {
        lo
    } else {
        rng.gen_range(lo..=hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncWriteExt;

    /// AsyncWrite sink that records the byte span of every poll_write call.
    #[derive(Clone, Default)]
    struct Recorder {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Recorder {
        fn writes(&self) -> Vec<Vec<u8>> {
            self.writes.lock().unwrap().clone()
        }

        fn concatenated(&self) -> Vec<u8> {
            self.writes().concat()
        }
    }

    impl AsyncWrite for Recorder {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
            self.writes.lock().unwrap().push(data.to_vec());
            Poll::Ready(Ok(data.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncRead for Recorder {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    fn plan(before: (usize, usize), sni: (usize, usize), after: (usize, usize)) -> FragmentPlan {
        FragmentPlan {
            tls_header_length: 5,
            before_sni: before,
            sni,
            after_sni: after,
            delay: (0, 0),
            padding: None,
        }
    }

    /// Assemble a valid ClientHello with `host` in the SNI and a filler
    /// extension before it, so the SNI sits away from the record start.
    fn build_hello(host: &str, filler_len: usize) -> Vec<u8> {
        let sni_content_len = host.len() + 5;
        let extensions_len = (4 + filler_len) + (4 + sni_content_len);
        let tail_len = 2 + 32 + 1 + 4 + 2 + 2 + extensions_len;
        let handshake_len = tail_len;
        let record_len = 4 + handshake_len;

        let mut hello = vec![0x16, 0x03, 0x01];
        hello.extend_from_slice(&(record_len as u16).to_be_bytes());
        hello.push(0x01);
        hello.extend_from_slice(&(handshake_len as u32).to_be_bytes()[1..]);
        hello.extend_from_slice(&[0x03, 0x03]);
        hello.extend_from_slice(&[0xab; 32]);
        hello.push(0x00); // session id
        hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher suites
        hello.extend_from_slice(&[0x01, 0x00]); // compression
        hello.extend_from_slice(&(extensions_len as u16).to_be_bytes());
        // filler extension
        hello.extend_from_slice(&[0x00, 0x33]);
        hello.extend_from_slice(&(filler_len as u16).to_be_bytes());
        hello.extend(std::iter::repeat(0x44).take(filler_len));
        // SNI
        hello.extend_from_slice(&[0x00, 0x00]);
        hello.extend_from_slice(&((sni_content_len) as u16).to_be_bytes());
        hello.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
        hello.push(0x00);
        hello.extend_from_slice(&(host.len() as u16).to_be_bytes());
        hello.extend_from_slice(host.as_bytes());
        hello
    }

    #[tokio::test]
    async fn chunks_reassemble_to_the_original_record() {
        let hello = build_hello("blocked.example.com", 80);
        let recorder = Recorder::default();
        let mut stream = FragmentedStream::new(recorder.clone(), plan((1, 3), (1, 1), (10, 20)));

        stream.write_all(&hello).await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(recorder.concatenated(), hello);
        assert!(recorder.writes().len() > 3, "expected many chunks, got {}", recorder.writes().len());
    }

    #[tokio::test]
    async fn sni_region_is_cut_to_single_bytes() {
        let hello = build_hello("blocked.example.com", 80);
        let span = tls::locate_sni(&hello).unwrap();
        let recorder = Recorder::default();
        let mut stream = FragmentedStream::new(recorder.clone(), plan((1, 3), (1, 1), (10, 20)));

        stream.write_all(&hello).await.unwrap();
        stream.flush().await.unwrap();

        let mut offset = 0;
        for write in recorder.writes() {
            let start = offset;
            let end = offset + write.len();
            if start >= span.start && end <= span.end {
                assert_eq!(write.len(), 1, "sni chunk at {start} is {} bytes", write.len());
            }
            offset = end;
        }
        // The whole SNI region was covered by single-byte chunks.
        assert_eq!(span.end - span.start, 19 + 9);
    }

    #[tokio::test]
    async fn record_without_sni_is_still_fragmented() {
        let mut hello = build_hello("x.y", 16);
        let span = tls::locate_sni(&hello).unwrap();
        hello[span.start] = 0x00;
        hello[span.start + 1] = 0x2a; // no longer the SNI type
        assert!(tls::locate_sni(&hello).is_none());

        let recorder = Recorder::default();
        let mut stream = FragmentedStream::new(recorder.clone(), plan((2, 4), (1, 1), (6, 8)));
        stream.write_all(&hello).await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(recorder.concatenated(), hello);
        assert!(recorder.writes().len() >= 2);
    }

    #[tokio::test]
    async fn non_tls_first_write_passes_through_whole() {
        let recorder = Recorder::default();
        let mut stream = FragmentedStream::new(recorder.clone(), plan((1, 3), (1, 1), (10, 20)));

        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(recorder.writes().len(), 1);
        assert_eq!(recorder.concatenated(), b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn short_first_write_flushes_after_the_window() {
        let recorder = Recorder::default();
        let mut stream = FragmentedStream::new(recorder.clone(), plan((1, 3), (1, 1), (10, 20)));

        stream.write_all(b"ab").await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(recorder.writes(), vec![b"ab".to_vec()]);
    }

    #[tokio::test]
    async fn later_writes_bypass_fragmentation() {
        let hello = build_hello("h.example", 8);
        let recorder = Recorder::default();
        let mut stream = FragmentedStream::new(recorder.clone(), plan((1, 2), (1, 1), (2, 3)));

        stream.write_all(&hello).await.unwrap();
        stream.flush().await.unwrap();
        let fragmented_writes = recorder.writes().len();

        stream.write_all(&[0x17; 600]).await.unwrap();
        stream.flush().await.unwrap();

        let writes = recorder.writes();
        assert_eq!(writes.len(), fragmented_writes + 1);
        assert_eq!(writes.last().unwrap().len(), 600);
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_between_chunks_respect_the_range() {
        let hello = build_hello("timed.example", 24);
        let recorder = Recorder::default();
        let mut timed_plan = plan((4, 4), (4, 4), (4, 4));
        timed_plan.delay = (5, 5);
        let mut stream = FragmentedStream::new(recorder.clone(), timed_plan);

        let started = tokio::time::Instant::now();
        stream.write_all(&hello).await.unwrap();
        stream.flush().await.unwrap();

        let chunks = recorder.writes().len();
        let elapsed = started.elapsed();
        assert_eq!(elapsed, Duration::from_millis(5 * (chunks as u64 - 1)));
    }

    #[tokio::test]
    async fn padding_grows_the_record_before_fragmentation() {
        let hello = build_hello("padded.example", 16);
        let recorder = Recorder::default();
        let mut padded_plan = plan((3, 6), (1, 2), (6, 10));
        padded_plan.padding = Some((32, 32));
        let mut stream = FragmentedStream::new(recorder.clone(), padded_plan);

        stream.write_all(&hello).await.unwrap();
        stream.flush().await.unwrap();

        let sent = recorder.concatenated();
        assert_eq!(sent.len(), hello.len() + 4 + 32);
        assert_eq!(tls::sni_hostname(&sent).as_deref(), Some("padded.example"));
        let record_len = u16::from_be_bytes([sent[3], sent[4]]) as usize;
        assert_eq!(record_len + 5, sent.len());
    }
}
