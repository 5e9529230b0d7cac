/// One server-sent event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental parser for SSE text streams.
///
/// Chunks may split frames (or UTF-8 sequences) anywhere; complete frames are
/// drained as soon as their blank-line terminator arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    buffer: String,
}

impl SseDecoder {
    /// Feed arbitrary bytes into the decoder and drain complete frames.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(bytes);
        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(error) if error.error_len().is_none() => error.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let complete: Vec<u8> = self.pending.drain(..valid_up_to).collect();
        self.buffer.push_str(&String::from_utf8_lossy(&complete));
        if self.buffer.contains("\r\n") {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut frames = Vec::new();
        while let Some(split) = self.buffer.find("\n\n") {
            let frame = self.buffer[..split].to_string();
            self.buffer.drain(..split + 2);
            if let Some(frame) = parse_frame(&frame) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flushes a trailing frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let rest = std::mem::take(&mut self.buffer);
        parse_frame(rest.trim_end_matches('\n'))
            .into_iter()
            .collect()
    }

    /// Text buffered but not yet recognised as a frame.
    pub fn remainder(&self) -> &str {
        &self.buffer
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.trim().is_empty() && self.pending.is_empty()
    }
}

fn parse_frame(frame: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines = Vec::new();
    for line in frame.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        } else if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        }
    }

    let data = data_lines.join("\n");
    if data.trim().is_empty() || data.trim() == "[DONE]" {
        return None;
    }
    Some(SseFrame { event, data })
}
