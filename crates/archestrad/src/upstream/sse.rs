//! Incremental decoder for server-sent event streams.
//!
//! Feeds on raw body chunks and yields complete events; a chunk boundary can
//! fall anywhere, including inside a UTF-8 sequence, so the decoder buffers
//! bytes and only splits on complete blank-line separators.

/// One decoded SSE event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, when present.
    pub event: Option<String>,
    /// Concatenated `data:` lines, newline-joined.
    pub data: String,
}

#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(boundary) = find_event_boundary(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..boundary.end).collect();
            let block = String::from_utf8_lossy(&raw[..boundary.start]);
            if let Some(event) = parse_event_block(&block) {
                events.push(event);
            }
        }
        events
    }
}

struct Boundary {
    /// End of the event block (exclusive).
    start: usize,
    /// End of the separator (exclusive).
    end: usize,
}

fn find_event_boundary(buffer: &[u8]) -> Option<Boundary> {
    // Events are separated by a blank line: \n\n or \r\n\r\n.
    let mut i = 0;
    while i + 1 < buffer.len() {
        if buffer[i] == b'\n' && buffer[i + 1] == b'\n' {
            return Some(Boundary {
                start: i,
                end: i + 2,
            });
        }
        if i + 3 < buffer.len() && &buffer[i..i + 4] == b"\r\n\r\n" {
            return Some(Boundary {
                start: i,
                end: i + 4,
            });
        }
        i += 1;
    }
    None
}

fn parse_event_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = field_value(line, "event") {
            event = Some(value.to_string());
        } else if let Some(value) = field_value(line, "data") {
            data_lines.push(value);
        }
        // id: and retry: fields are irrelevant to this proxy.
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
