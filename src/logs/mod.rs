// Logs module - Capture of managed process output

mod writer;

pub use writer::{forward_lines, LogSinks, LogWriter, SharedLogWriter};
