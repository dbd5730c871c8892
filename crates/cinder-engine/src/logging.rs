/// Leveled run log with section nesting. The driver supplies the concrete
/// renderer; the engine only ever talks to this trait.
pub trait RunLog {
    fn section_start(&mut self, title: &str);
    fn section_end(&mut self, title: &str);
    fn line(&mut self, level: LogLevel, text: &str);

    fn error(&mut self, text: &str) {
        self.line(LogLevel::Error, text);
    }

    fn info(&mut self, text: &str) {
        self.line(LogLevel::Info, text);
    }

    fn debug(&mut self, text: &str) {
        self.line(LogLevel::Debug, text);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

/// Discards everything. Used where no renderer is attached.
#[derive(Debug, Default)]
pub struct NullLog;

impl RunLog for NullLog {
    fn section_start(&mut self, _title: &str) {}
    fn section_end(&mut self, _title: &str) {}
    fn line(&mut self, _level: LogLevel, _text: &str) {}
}

/// Accumulates lines in memory; the test double for log assertions.
#[derive(Debug, Default)]
pub struct MemoryLog {
    pub entries: Vec<(LogLevel, String)>,
    pub sections: Vec<String>,
}

impl RunLog for MemoryLog {
    fn section_start(&mut self, title: &str) {
        self.sections.push(format!("+{title}"));
    }

    fn section_end(&mut self, title: &str) {
        self.sections.push(format!("-{title}"));
    }

    fn line(&mut self, level: LogLevel, text: &str) {
        self.entries.push((level, text.to_string()));
    }
}
