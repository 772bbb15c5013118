//! Reframes a child log stream as Server-Sent Events and folds it into a
//! transcript.

use std::convert::Infallible;
use std::time::Instant;

use axum::http::header::{HeaderName, CACHE_CONTROL};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::events::TurnEvent;
use crate::sandbox::{LogChunk, LogReceiver};
use crate::transcript::{TranscriptFolder, TranscriptPart};

const SSE_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Fold recognised events into transcript parts.
    pub fold_transcript: bool,
    /// Bytes of stderr retained; older output is dropped first.
    pub stderr_limit: usize,
    /// A stdout line longer than this is emitted as-is without waiting for
    /// its newline.
    pub max_line_bytes: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            fold_transcript: true,
            stderr_limit: 64 * 1024,
            max_line_bytes: 1024 * 1024,
        }
    }
}

/// What one bridged stream produced, handed to the completion hook before the
/// terminal SSE frame is sent.
#[derive(Debug, Clone, Default)]
pub struct BridgeOutcome {
    pub parts: Vec<TranscriptPart>,
    pub stderr: String,
    pub fatal: Option<String>,
    pub lines: u64,
}

pub type CompletionHook = Box<dyn FnOnce(BridgeOutcome) -> BoxFuture<'static, ()> + Send>;

/// Splits stdout chunks into trimmed, non-empty lines. A bare `\r` counts as
/// a line break since an SSE data field cannot carry one.
#[derive(Debug)]
struct LineBuffer {
    pending: String,
    max_line_bytes: usize,
}

impl LineBuffer {
    fn new(max_line_bytes: usize) -> Self {
        Self {
            pending: String::new(),
            max_line_bytes,
        }
    }

    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(index) = self.pending.find(['\n', '\r']) {
            let line: String = self.pending.drain(..=index).collect();
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        if self.pending.len() > self.max_line_bytes {
            let line = std::mem::take(&mut self.pending);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    fn finish(self) -> Option<String> {
        let rest = self.pending.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// Keeps the last `limit` bytes of stderr.
#[derive(Debug)]
struct TailBuffer {
    text: String,
    limit: usize,
}

impl TailBuffer {
    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > self.limit {
            let mut cut = self.text.len() - self.limit;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }
}

struct Pump {
    options: BridgeOptions,
    folder: TranscriptFolder,
    sse: mpsc::Sender<Event>,
    client_gone: bool,
    lines: u64,
}

impl Pump {
    async fn emit(&mut self, event: Event) {
        if self.client_gone {
            return;
        }
        if self.sse.send(event).await.is_err() {
            // The turn keeps running so its transcript is still persisted.
            tracing::debug!("sse client disconnected; continuing turn");
            self.client_gone = true;
        }
    }

    async fn line(&mut self, line: String) {
        self.lines += 1;
        if self.options.fold_transcript {
            if let Some(event) = TurnEvent::parse_line(&line) {
                self.folder.apply(&event);
            }
        }
        self.emit(Event::default().data(line)).await;
    }
}

/// Starts pumping `logs` and returns the SSE frames for the client.
///
/// Frames: `start`, one `data` frame per stdout line, an optional `stderr`
/// frame, then `end` or `error`. `on_complete` runs before the terminal frame,
/// whether or not the client is still connected.
pub fn bridge(
    mut logs: LogReceiver,
    options: BridgeOptions,
    on_complete: CompletionHook,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (sse, frames) = mpsc::channel(SSE_BUFFER);
    tokio::spawn(async move {
        let started = Instant::now();
        let mut stdout = LineBuffer::new(options.max_line_bytes);
        let mut stderr = TailBuffer {
            text: String::new(),
            limit: options.stderr_limit,
        };
        let mut pump = Pump {
            options,
            folder: TranscriptFolder::new(),
            sse,
            client_gone: false,
            lines: 0,
        };
        let mut fatal = None;

        pump.emit(Event::default().event("start").data("ok")).await;
        while let Some(chunk) = logs.recv().await {
            match chunk {
                LogChunk::Stdout(text) => {
                    for line in stdout.push(&text) {
                        pump.line(line).await;
                    }
                }
                LogChunk::Stderr(text) => stderr.push(&text),
                LogChunk::Fatal(message) => {
                    fatal = Some(message);
                    break;
                }
            }
        }
        if let Some(rest) = stdout.finish() {
            pump.line(rest).await;
        }

        if !stderr.text.is_empty() {
            let payload = serde_json::Value::String(stderr.text.clone()).to_string();
            pump.emit(Event::default().event("stderr").data(payload)).await;
        }

        let Pump { folder, lines, .. } = &mut pump;
        let outcome = BridgeOutcome {
            parts: std::mem::take(folder).finish(),
            stderr: stderr.text,
            fatal: fatal.clone(),
            lines: *lines,
        };
        tracing::info!(
            lines = outcome.lines,
            parts = outcome.parts.len(),
            stderr_bytes = outcome.stderr.len(),
            failed = outcome.fatal.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn stream finished"
        );
        on_complete(outcome).await;

        let terminal = match fatal {
            Some(message) => Event::default()
                .event("error")
                .data(serde_json::Value::String(message).to_string()),
            None => Event::default().event("end").data("done"),
        };
        pump.emit(terminal).await;
    });

    ReceiverStream::new(frames).map(Ok::<Event, Infallible>)
}

/// Wraps a frame stream in an SSE response with proxy buffering disabled.
pub fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    (
        [
            (CACHE_CONTROL, "no-cache, no-transform"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    async fn run(
        chunks: Vec<LogChunk>,
        options: BridgeOptions,
    ) -> (Vec<String>, Option<BridgeOutcome>) {
        let (tx, rx) = mpsc::channel(4);
        let captured: Arc<Mutex<Option<BridgeOutcome>>> = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        let hook: CompletionHook = Box::new(move |outcome| {
            Box::pin(async move {
                *sink.lock().expect("lock") = Some(outcome);
            })
        });
        let stream = bridge(rx, options, hook);
        tokio::spawn(async move {
            for chunk in chunks {
                tx.send(chunk).await.expect("send");
            }
        });
        let frames: Vec<String> = stream
            .map(|event| format!("{:?}", event.expect("infallible")))
            .collect()
            .await;
        let outcome = captured.lock().expect("lock").take();
        (frames, outcome)
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_reassembled_and_folded() {
        let (frames, outcome) = run(
            vec![
                LogChunk::Stdout("{\"type\":\"reasoning_start\"}\n{\"type\":\"reasoning_de".into()),
                LogChunk::Stdout("lta\",\"text\":\"a\"}\n{\"type\":\"reasoning_end\"}\n".into()),
                LogChunk::Stderr("warn: slow\n".into()),
                LogChunk::Stdout("not json\n{\"type\":\"delta\",\"text\":\"b\"}".into()),
            ],
            BridgeOptions::default(),
        )
        .await;

        // start + 5 data lines + stderr + end
        assert_eq!(frames.len(), 8, "{frames:#?}");
        assert!(frames[0].contains("start"));
        assert!(frames[6].contains("stderr"));
        assert!(frames[7].contains("end"));

        let outcome = outcome.expect("completion hook ran");
        assert_eq!(outcome.lines, 5);
        assert_eq!(outcome.stderr, "warn: slow\n");
        assert_eq!(
            outcome.parts,
            vec![
                TranscriptPart::Reasoning {
                    content: "a".into(),
                    state: crate::transcript::ReasoningState::Done,
                },
                TranscriptPart::Text { text: "b".into() },
            ]
        );
    }

    #[tokio::test]
    async fn fatal_chunk_ends_with_error_frame() {
        let (frames, outcome) = run(
            vec![
                LogChunk::Stdout("{\"type\":\"delta\",\"text\":\"partial\"}\n".into()),
                LogChunk::Fatal("provider returned 500".into()),
            ],
            BridgeOptions::default(),
        )
        .await;
        let last = frames.last().expect("frames");
        assert!(last.contains("error") && last.contains("provider returned 500"), "{last}");
        let outcome = outcome.expect("completion hook ran");
        assert_eq!(outcome.fatal.as_deref(), Some("provider returned 500"));
        assert_eq!(outcome.parts, vec![TranscriptPart::Text { text: "partial".into() }]);
    }

    #[tokio::test]
    async fn folding_can_be_disabled() {
        let options = BridgeOptions {
            fold_transcript: false,
            ..BridgeOptions::default()
        };
        let (_, outcome) = run(
            vec![LogChunk::Stdout("{\"type\":\"delta\",\"text\":\"x\"}\n".into())],
            options,
        )
        .await;
        assert!(outcome.expect("completion hook ran").parts.is_empty());
    }

    #[tokio::test]
    async fn carriage_returns_split_lines_instead_of_breaking_the_stream() {
        let (frames, outcome) = run(
            vec![
                LogChunk::Stdout("{\"type\":\"delta\",\"text\":\"a\"}\rstray\r\n".into()),
                LogChunk::Stdout("{\"type\":\"delta\",\"text\":\"b\"}\r\n".into()),
            ],
            BridgeOptions::default(),
        )
        .await;

        // start + 3 data lines + end
        assert_eq!(frames.len(), 5, "{frames:#?}");
        assert!(frames[4].contains("end"));
        let outcome = outcome.expect("completion hook ran");
        assert_eq!(outcome.lines, 3);
        assert_eq!(outcome.parts, vec![TranscriptPart::Text { text: "ab".into() }]);
    }

    #[test]
    fn oversized_lines_are_flushed_and_stderr_keeps_tail() {
        let mut lines = LineBuffer::new(4);
        assert_eq!(lines.push("abcdef"), vec!["abcdef".to_string()]);
        assert_eq!(lines.finish(), None);

        let mut tail = TailBuffer {
            text: String::new(),
            limit: 5,
        };
        tail.push("0123");
        tail.push("456789");
        assert_eq!(tail.text, "56789");
    }
}
