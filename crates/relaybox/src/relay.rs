//! Line-oriented decoding of a child's output streams
//!
//! Each line is either plain program output or a prompt frame written by the
//! harness input routine:
//!
//! ```text
//! {"action":"output","data":"Enter a number: ","prompt":true}
//! ```
//!
//! Prompt frames are unwrapped to their `data`. Every other line, including
//! malformed JSON, is passed on verbatim. A line that stays unterminated is
//! flushed as soon as the program stops writing, so prompts printed without a
//! newline reach the client.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use futures::Stream;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};

/// Lines longer than this are split into several frames
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    Stdout,
    Stderr,
}

impl StreamOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamOrigin::Stdout => "stdout",
            StreamOrigin::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Ordinary program output
    Output,
    /// The program is waiting for a line of input
    Prompt,
}

/// One decoded unit of program output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub data: String,
    pub kind: FrameKind,
    pub origin: StreamOrigin,
}

impl OutputFrame {
    pub fn is_prompt(&self) -> bool {
        self.kind == FrameKind::Prompt
    }
}

#[derive(Deserialize)]
struct PromptFrame {
    action: String,
    #[serde(default)]
    data: serde_json::Value,
    prompt: serde_json::Value,
}

impl PromptFrame {
    fn into_prompt(self) -> Option<String> {
        let flagged = match self.prompt {
            serde_json::Value::Bool(flag) => flag,
            serde_json::Value::String(flag) => flag == "true",
            _ => false,
        };
        if self.action != "output" || !flagged {
            return None;
        }
        match self.data {
            serde_json::Value::String(data) => Some(data),
            serde_json::Value::Null => Some(String::new()),
            other => Some(other.to_string()),
        }
    }
}

/// Start of a prompt object that trails partial output on the same line
const PROMPT_OPENER: &str = "{\"action\"";

/// How long a partial line may sit unterminated before it is flushed
pub const PARTIAL_LINE_WAIT: Duration = Duration::from_millis(50);

fn parse_prompt(text: &str) -> Option<String> {
    serde_json::from_str::<PromptFrame>(text)
        .ok()
        .and_then(PromptFrame::into_prompt)
}

/// Split a line into leading text and the prompt object that ends it
fn trailing_prompt(line: &str) -> Option<(&str, String)> {
    if !line.ends_with('}') {
        return None;
    }
    line.match_indices(PROMPT_OPENER)
        .find_map(|(start, _)| parse_prompt(&line[start..]).map(|data| (&line[..start], data)))
}

/// Classify one raw line (including its newline, if any).
///
/// Output written without a newline right before a prompt shares its line
/// with the prompt object; it comes back as a separate output frame ahead of
/// the prompt.
pub fn decode_line(line: &[u8], origin: StreamOrigin) -> Vec<OutputFrame> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim_end_matches(['\n', '\r']);

    let split = trailing_prompt(trimmed).map(|(leading, data)| (leading.to_string(), data));
    let Some((leading, data)) = split else {
        return vec![OutputFrame {
            data: text.into_owned(),
            kind: FrameKind::Output,
            origin,
        }];
    };

    let mut frames = Vec::with_capacity(2);
    if !leading.is_empty() {
        frames.push(OutputFrame {
            data: leading,
            kind: FrameKind::Output,
            origin,
        });
    }
    frames.push(OutputFrame {
        data,
        kind: FrameKind::Prompt,
        origin,
    });
    frames
}

/// Read up to and including the next newline, at most [`MAX_LINE_BYTES`].
///
/// A partial line is returned early once no more data arrives within
/// [`PARTIAL_LINE_WAIT`]. Returns false at end of data with nothing read.
async fn next_line<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool> {
    buf.clear();
    loop {
        let (consumed, done) = {
            let available = if buf.is_empty() {
                reader.fill_buf().await?
            } else {
                match tokio::time::timeout(PARTIAL_LINE_WAIT, reader.fill_buf()).await {
                    Ok(filled) => filled?,
                    Err(_) => return Ok(true),
                }
            };
            if available.is_empty() {
                return Ok(!buf.is_empty());
            }
            let room = MAX_LINE_BYTES - buf.len();
            let window = &available[..available.len().min(room)];
            match window.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    buf.extend_from_slice(&window[..=pos]);
                    (pos + 1, true)
                }
                None => {
                    buf.extend_from_slice(window);
                    (window.len(), buf.len() >= MAX_LINE_BYTES)
                }
            }
        };
        reader.consume(consumed);
        if done {
            return Ok(true);
        }
    }
}

/// Decode a stream into frames.
///
/// The stream ends at end of data. A read error is yielded once and ends the
/// stream.
pub fn relay<R>(reader: R, origin: StreamOrigin) -> impl Stream<Item = io::Result<OutputFrame>>
where
    R: AsyncRead + Unpin,
{
    let state = Some((BufReader::new(reader), Vec::new(), VecDeque::new()));
    futures::stream::unfold(state, move |state| async move {
        let (mut reader, mut buf, mut pending) = state?;
        loop {
            if let Some(frame) = pending.pop_front() {
                return Some((Ok(frame), Some((reader, buf, pending))));
            }
            match next_line(&mut reader, &mut buf).await {
                Ok(true) => pending.extend(decode_line(&buf, origin)),
                Ok(false) => return None,
                Err(e) => return Some((Err(e), None)),
            }
        }
    })
}
