//! Inline progress markers printed by the client.

use std::io::{self, Write};

const BLUE: &str = "\x1b[94m";
const GREEN: &str = "\x1b[92m";
const RED: &str = "\x1b[91m";
const ENDC: &str = "\x1b[0m";
const MARK: &str = "■";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMarker {
    Sent,
    Success,
    Late,
    Timeout,
}

impl ProgressMarker {
    pub fn render(&self) -> String {
        match self {
            ProgressMarker::Sent => format!("{}{}{}", BLUE, MARK, ENDC),
            ProgressMarker::Success => format!("{}{}{}", GREEN, MARK, ENDC),
            ProgressMarker::Late => MARK.to_string(),
            ProgressMarker::Timeout => format!("{}{}{}", RED, MARK, ENDC),
        }
    }
}

/// Writes markers to stdout when enabled.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    enabled: bool,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn mark(&self, marker: ProgressMarker) {
        if !self.enabled {
            return;
        }
        let mut out = io::stdout().lock();
        let _ = out.write_all(marker.render().as_bytes());
        let _ = out.flush();
    }
}
