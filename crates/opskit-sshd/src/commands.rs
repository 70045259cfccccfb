//! Fixed command table served over `exec` and `shell`

/// Output of one command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Bytes written to the channel's stdout
    pub output: String,
    /// Exit status, sent when the command ends the channel
    pub status: u32,
    /// Whether the channel should close after this reply
    pub closes_channel: bool,
}

/// Run one command line against the table
///
/// `ping` answers `pong`, `exit` says goodbye and ends the session,
/// anything else is reported as unknown with status 1.
#[must_use]
pub fn dispatch(line: &str) -> Reply {
    match line.trim() {
        "ping" => Reply {
            output: "pong\n".to_string(),
            status: 0,
            closes_channel: false,
        },
        "exit" => Reply {
            output: "bye\n".to_string(),
            status: 0,
            closes_channel: true,
        },
        other => Reply {
            output: format!("unknown command: {other}\n"),
            status: 1,
            closes_channel: false,
        },
    }
}
