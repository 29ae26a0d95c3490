// Wire framing: one serialized call becomes a stream of text fragments
// that concatenate to a single valid JSON document,
//
//   [ {"json": <shape>, "nonce": <token>},
//     [ <chunk>,
//       <chunk>,
//       ... ] ]
//
// with exactly one header or chunk per line. A consumer may process it
// line by line as fragments arrive, or parse the whole document at once.

use crate::inline::envelope;
use crate::multiplex::Multiplexed;
use futures::stream::{self, BoxStream, StreamExt};

/// Render a multiplexed call as wire text fragments. Fragment boundaries
/// are an artifact of production; consumers must not rely on them.
pub fn frame(call: Multiplexed) -> BoxStream<'static, String> {
    let nonce = call.nonce;
    let header = envelope(&nonce, call.header);
    let open = stream::iter([
        "[\n".to_string(),
        format!("{}\n", header),
        ",[\n".to_string(),
    ]);
    let body = call.chunks.enumerate().map(move |(index, chunk)| {
        let record = chunk.to_json(&nonce);
        if index == 0 {
            format!("{}\n", record)
        } else {
            format!(",{}\n", record)
        }
    });
    let close = stream::iter(["]\n".to_string(), "]".to_string()]);
    open.chain(body).chain(close).boxed()
}

/// Rebuilds lines from arbitrarily split text fragments. The framing puts
/// one record per line, so this is the only reassembly the consumer needs.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: String,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and drain every line it completed.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);
        let mut lines = Vec::new();
        while let Some(end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=end).collect();
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Drain whatever remains after the final fragment. The last line of a
    /// document carries no newline.
    pub fn flush(&mut self) -> Option<String> {
        let rest = self.buffer.trim().to_string();
        self.buffer.clear();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}
