use crate::event::ProgressEvent;
use crate::runner::notify::EventSink;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Read `reader` line by line until EOF, forwarding every line to `sink` as
/// an `output` event as soon as it arrives. Everything read is appended to
/// `buffer`, so a caller that stops waiting early keeps the partial output.
///
/// Invalid UTF-8 is replaced rather than aborting the stream; agent and
/// verifier output is only ever shown or pattern-matched.
pub async fn pump_lines<R>(reader: Option<R>, sink: &dyn EventSink, buffer: &mut String)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "output stream read failed");
                break;
            }
        }
        let text = String::from_utf8_lossy(&line);
        buffer.push_str(&text);
        if !text.ends_with('\n') {
            buffer.push('\n');
        }
        let trimmed = text.trim_end_matches(['\n', '\r']);
        sink.emit(ProgressEvent::output(trimmed));
    }
}
