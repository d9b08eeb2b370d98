//! Outbound command line protocol

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::Result;

/// Prefix of every service message exchanged with the runner
pub const COMMAND_TAG: &str = "##dotMemory";

/// Encode a command as one protocol line, without the trailing newline.
///
/// `disconnect` with no arguments becomes `##dotMemory["disconnect"]`;
/// arguments are appended as `{key:"value"}`, with `None` written as `null`.
/// The protocol has no escapes, so `"` inside values is replaced by a backtick.
pub fn encode_command(name: &str, args: &[(&str, Option<&str>)]) -> String {
    let mut line = format!("{COMMAND_TAG}[\"{name}\"");

    if !args.is_empty() {
        let fields = args
            .iter()
            .map(|(key, value)| match value {
                Some(value) => format!("{key}:\"{}\"", value.replace('"', "`")),
                None => format!("{key}:null"),
            })
            .collect::<Vec<_>>()
            .join(",");
        line.push_str(",{");
        line.push_str(&fields);
        line.push('}');
    }

    line.push(']');
    line
}

/// Writes encoded commands to the runner's standard input
pub struct CommandChannel<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> CommandChannel<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Send one command; does not wait for any acknowledgement
    pub async fn send(&mut self, name: &str, args: &[(&str, Option<&str>)]) -> Result<()> {
        let mut line = encode_command(name, args);
        debug!("stdin: {}", line);
        line.push('\n');

        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
