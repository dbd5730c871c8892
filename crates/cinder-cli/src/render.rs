use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anstyle::{AnsiColor, Effects, Style};
use cinder_core::{BundleItem, ResultCode, Verdict};
use cinder_engine::{
    LogLevel, ProgressObserver, ProgressState, RunLog, SourceResolution, SourceResolver,
    PROGRESS_MAX,
};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OutputStyle {
    Plain,
    Rich,
}

pub fn current_output_style(force_plain: bool) -> OutputStyle {
    if force_plain || !std::io::stderr().is_terminal() {
        OutputStyle::Plain
    } else {
        OutputStyle::Rich
    }
}

fn error_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightRed.into()))
        .effects(Effects::BOLD)
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn detail_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightCyan.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub fn render_status_line(style: OutputStyle, level: LogLevel, text: &str) -> String {
    match style {
        OutputStyle::Plain => format!("{}: {}", level.as_str(), text),
        OutputStyle::Rich => match level {
            LogLevel::Error => format!("{} {}", colorize(error_style(), "error:"), text),
            LogLevel::Info => text.to_string(),
            LogLevel::Debug => colorize(detail_style(), text),
        },
    }
}

pub fn render_section_header(style: OutputStyle, title: &str) -> String {
    match style {
        OutputStyle::Plain => format!("-- {title}"),
        OutputStyle::Rich => colorize(section_style(), &format!("== {title} ==")),
    }
}

/// Console implementation of the engine's run log.
pub struct ConsoleLog {
    style: OutputStyle,
    depth: usize,
}

impl ConsoleLog {
    pub fn new(style: OutputStyle) -> Self {
        Self { style, depth: 0 }
    }
}

impl RunLog for ConsoleLog {
    fn section_start(&mut self, title: &str) {
        if self.depth == 0 {
            eprintln!("{}", render_section_header(self.style, title));
        }
        self.depth += 1;
    }

    fn section_end(&mut self, _title: &str) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn line(&mut self, level: LogLevel, text: &str) {
        if level == LogLevel::Debug && self.style == OutputStyle::Plain {
            return;
        }
        eprintln!("{}", render_status_line(self.style, level, text));
    }
}

/// Console implementation of the progress observer: an indicatif bar over
/// the engine's 0–255 scale, plus a final result line.
pub struct ConsoleObserver {
    style: OutputStyle,
    label: String,
    progress_bar: Option<ProgressBar>,
}

impl ConsoleObserver {
    pub fn new(style: OutputStyle, label: &str) -> Self {
        Self {
            style,
            label: label.to_string(),
            progress_bar: None,
        }
    }

    fn bar(&mut self) -> Option<&ProgressBar> {
        if self.style == OutputStyle::Plain {
            return None;
        }
        if self.progress_bar.is_none() {
            let progress_bar = ProgressBar::new(u64::from(PROGRESS_MAX));
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<12} [{bar:24.cyan/blue}] {percent:>3}%",
            ) {
                progress_bar.set_style(style.progress_chars("=>-"));
            }
            progress_bar.set_message(self.label.clone());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            self.progress_bar = Some(progress_bar);
        }
        self.progress_bar.as_ref()
    }
}

impl ProgressObserver for ConsoleObserver {
    fn on_progress(&mut self, position: u8) -> Verdict {
        if let Some(bar) = self.bar() {
            bar.set_position(u64::from(position));
        }
        Verdict::Continue
    }

    fn on_state_change_detail(&mut self, state: ProgressState, detail: &str) {
        if let Some(bar) = self.bar() {
            bar.set_message(format!("{} {detail}", state.as_str()));
        }
    }

    fn on_reboot_pending(&mut self) {
        let line = render_status_line(
            self.style,
            LogLevel::Info,
            "a reboot is required to finish this operation",
        );
        match &self.progress_bar {
            Some(bar) => bar.println(line),
            None => eprintln!("{line}"),
        }
    }

    fn finished(&mut self, result: ResultCode) {
        if let Some(bar) = self.progress_bar.take() {
            bar.finish_and_clear();
        }
        let line = if result.is_success() {
            format!("{} finished", self.label)
        } else {
            format!("{} failed with code {}", self.label, result)
        };
        let level = if result.is_success() {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        eprintln!("{}", render_status_line(self.style, level, &line));
    }
}

/// Interactive source resolution: ask for a replacement path on stdin.
/// Unattended sessions should use the engine's `NoSourceResolver` instead.
#[derive(Debug, Default)]
pub struct PromptSourceResolver;

impl SourceResolver for PromptSourceResolver {
    fn resolve_source(&mut self, item: &BundleItem) -> SourceResolution {
        eprintln!(
            "payload for '{}' was not found; enter a path to it, an empty line to skip, or 'cancel' to stop:",
            item.display_name
        );

        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return SourceResolution::Skip;
        }

        let trimmed = answer.trim();
        if trimmed.is_empty() {
            return SourceResolution::Skip;
        }
        if trimmed.eq_ignore_ascii_case("cancel") {
            return SourceResolution::Cancel;
        }
        SourceResolution::Retry(PathBuf::from(trimmed))
    }
}
