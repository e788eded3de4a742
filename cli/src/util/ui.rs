use std::io::Write;

use color_eyre::Report;

const ANSI_RESET: &str = "\x1b[0m";
const ANSI_BOLD_BLUE: &str = "\x1b[1;34m";
const ANSI_BOLD_GREEN: &str = "\x1b[1;32m";
const ANSI_BOLD_RED: &str = "\x1b[1;31m";

/// Writes status messages for long-running commands, with optional color
/// and a level of indentation for nested steps.
///
/// Progress messages go to `out`, errors to `err`. `log` lines are debug
/// output and are dropped entirely when the UI was built with
/// `debug: false` (the `--quiet` flag).
pub struct UI<'a> {
    out: &'a mut dyn Write,
    err: &'a mut dyn Write,
    color: bool,
    debug: bool,
    indentation: usize,
}

impl<'a> UI<'a> {
    pub fn new(
        out: &'a mut impl Write,
        err: &'a mut impl Write,
        color: bool,
        debug: bool,
    ) -> Self {
        Self {
            out,
            err,
            color,
            debug,
            indentation: 0,
        }
    }

    /// Indent all subsequent messages one level deeper.
    pub fn indent(&mut self) {
        self.indentation += 1;
    }

    /// Drop one level of indentation.
    pub fn outdent(&mut self) {
        self.indentation = self.indentation.saturating_sub(1);
    }

    /// Print an informational message, e.g. that a command was started.
    pub fn info(&mut self, message: &str) {
        let message = self.indented(message);
        let line = self.colored(&message, ANSI_BOLD_BLUE);
        let _ = writeln!(self.out, "{line}");
    }

    /// Print a success message, e.g. that a command completed.
    pub fn success(&mut self, message: &str) {
        let message = self.indented(message);
        let line = self.colored(&message, ANSI_BOLD_GREEN);
        let _ = writeln!(self.out, "{line}");
    }

    /// Print an error message along with the error chain it carries.
    pub fn error(&mut self, message: &str, error: &Report) {
        let message = self.indented(message);
        let line = self.colored(&message, ANSI_BOLD_RED);
        let _ = writeln!(self.err, "{line}");
        let _ = writeln!(self.err, "{error:?}");
    }

    /// Print a debug message; dropped when the UI is quiet.
    pub fn log(&mut self, message: &str) {
        if self.debug {
            let message = self.indented(message);
            let _ = writeln!(self.out, "{message}");
        }
    }

    fn indented(&self, message: &str) -> String {
        format!("{}{}", "  ".repeat(self.indentation), message)
    }

    fn colored(&self, message: &str, color: &str) -> String {
        if self.color {
            format!("{color}{message}{ANSI_RESET}")
        } else {
            message.to_string()
        }
    }
}
