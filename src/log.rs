use dialoguer::console::{style, Term};

/// Colored stderr logger handed to every component that reports progress.
#[derive(Debug, Clone)]
pub struct Log {
    term: Term,
    quiet: bool,
    debug: bool,
}

impl Log {
    pub fn new(quiet: bool, debug: bool) -> Self {
        Self {
            term: Term::stderr(),
            quiet,
            debug,
        }
    }

    pub fn silent() -> Self {
        Self::new(true, false)
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        if !self.quiet {
            self.emit(style(msg.as_ref()).green().to_string());
        }
    }

    pub fn warning(&self, msg: impl AsRef<str>) {
        if !self.quiet {
            self.emit(style(msg.as_ref()).yellow().to_string());
        }
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        if self.debug && !self.quiet {
            self.emit(style(msg.as_ref()).dim().to_string());
        }
    }

    /// Errors are shown even in quiet mode.
    pub fn error(&self, msg: impl AsRef<str>) {
        self.emit(style(msg.as_ref()).red().to_string());
    }

    fn emit(&self, line: String) {
        let _ = self.term.write_line(&line);
    }
}
