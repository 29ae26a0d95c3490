// Server-sent events binding: one `data:` event per wire record line, so a
// browser EventSource (or any SSE client) observes record boundaries
// directly.

use futures::stream::{self, BoxStream, StreamExt};
use jsonweft_core::LineAssembler;
use std::collections::VecDeque;

/// Render wire fragments as SSE event text, one event per record line.
pub fn to_events(fragments: BoxStream<'static, String>) -> BoxStream<'static, String> {
    struct State {
        source: BoxStream<'static, String>,
        assembler: LineAssembler,
        queue: VecDeque<String>,
        done: bool,
    }

    let state = State {
        source: fragments,
        assembler: LineAssembler::new(),
        queue: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some((event, state));
            }
            if state.done {
                return None;
            }
            match state.source.next().await {
                Some(fragment) => {
                    for line in state.assembler.push(&fragment) {
                        state.queue.push_back(format!("data: {}\n\n", line));
                    }
                }
                None => {
                    state.done = true;
                    // the closing bracket carries no newline
                    if let Some(rest) = state.assembler.flush() {
                        state.queue.push_back(format!("data: {}\n\n", rest));
                    }
                }
            }
        }
    })
    .boxed()
}

/// Incremental SSE parser recovering wire fragments from event text.
/// Comment lines and foreign fields are skipped; multi-line data payloads
/// rejoin with the newlines SSE semantics prescribe.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buffer: String,
    data: Vec<String>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume raw SSE text, returning one wire fragment per completed
    /// event. Feed the results to a demultiplexer in order.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut fragments = Vec::new();
        while let Some(end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=end).collect();
            let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
            if line.is_empty() {
                // blank line terminates the event
                if !self.data.is_empty() {
                    let mut fragment = self.data.join("\n");
                    fragment.push('\n');
                    self.data.clear();
                    fragments.push(fragment);
                }
            } else if let Some(payload) = line.strip_prefix("data:") {
                self.data
                    .push(payload.strip_prefix(' ').unwrap_or(payload).to_string());
            }
            // "event:", "id:", "retry:" and ":" comments are irrelevant here
        }
        fragments
    }
}
