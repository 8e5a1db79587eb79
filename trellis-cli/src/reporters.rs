//! Terminal reporters

use colored::Colorize;
use std::io::{self, Write};
use tracing::warn;
use trellis_core::{TaskKind, TaskResult, TaskState, UpdateKind};
use trellis_execution::{Reporter, ReporterEvent, RunSummary, TaskInfo};
use trellis_ipc::ConsoleStream;

/// Coloured human-readable output
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    pub fn new() -> Self {
        Self
    }

    fn task_line(filepath: &str, task: &TaskInfo, result: &TaskResult) -> String {
        let symbol = result.state.symbol();
        let symbol = match result.state {
            TaskState::Passed => symbol.green(),
            TaskState::Failed => symbol.red(),
            TaskState::Skipped | TaskState::Todo => symbol.yellow(),
            _ => symbol.normal(),
        };
        let mut line = format!(" {} {} {} {}", symbol, filepath.dimmed(), ">".dimmed(), task.name);
        if let Some(duration) = result.duration {
            line.push_str(&format!(" {}", format!("{}ms", duration.as_millis()).dimmed()));
        }
        if result.retry_count > 0 {
            line.push_str(&format!(" {}", format!("(retried {}x)", result.retry_count).yellow()));
        }
        for error in &result.errors {
            line.push_str(&format!("\n     {}", error.to_string().red()));
            if let Some(diff) = &error.diff {
                line.push_str(&format!(
                    "\n       {} {}\n       {} {}",
                    "- expected".green(),
                    diff.expected,
                    "+ actual".red(),
                    diff.actual
                ));
            }
        }
        line
    }

    fn summary_lines(summary: &RunSummary) -> Vec<String> {
        let counts = &summary.counts;
        let mut parts = Vec::new();
        if counts.failed > 0 {
            parts.push(format!("{} failed", counts.failed).red().bold().to_string());
        }
        if counts.passed > 0 {
            parts.push(format!("{} passed", counts.passed).green().bold().to_string());
        }
        if counts.skipped > 0 {
            parts.push(format!("{} skipped", counts.skipped).yellow().to_string());
        }
        if counts.todo > 0 {
            parts.push(format!("{} todo", counts.todo).yellow().to_string());
        }
        if counts.pending > 0 {
            parts.push(format!("{} unfinished", counts.pending).red().to_string());
        }

        let failed_files = summary.failed_files();
        let mut lines = vec![
            String::new(),
            format!(
                " {} {} ({})",
                "Files".dimmed(),
                if failed_files > 0 {
                    format!("{} failed", failed_files).red().bold().to_string()
                } else {
                    format!("{} passed", summary.files.len()).green().bold().to_string()
                },
                summary.files.len()
            ),
            format!(" {} {} ({})", "Tests".dimmed(), parts.join(" | "), counts.total()),
        ];
        if !summary.errors.is_empty() {
            lines.push(format!(
                " {} {}",
                "Errors".dimmed(),
                format!("{}", summary.errors.len()).red().bold()
            ));
        }
        if summary.restarts > 0 {
            lines.push(format!(" {} {}", "Restarts".dimmed(), summary.restarts));
        }
        if let Some(reason) = &summary.cancelled {
            lines.push(format!(" {} {}", "Stopped".dimmed(), reason.to_string().yellow()));
        }
        lines.push(format!(" {} {}ms", "Duration".dimmed(), summary.duration_ms));
        lines
    }
}

impl Reporter for ConsoleReporter {
    fn on_event(&self, event: &ReporterEvent) {
        let mut out = io::stdout().lock();
        let _ = match event {
            ReporterEvent::RunStarted { files, workers, pool } => writeln!(
                out,
                "{} {} files on {} {:?} contexts\n",
                " RUN ".on_blue().black().bold(),
                files.len(),
                workers,
                pool
            ),
            ReporterEvent::Task {
                filepath,
                task,
                update,
            } => match &update.kind {
                UpdateKind::Finished { result } if task.kind == TaskKind::Test => {
                    writeln!(out, "{}", Self::task_line(filepath, task, result))
                }
                UpdateKind::Finished { result } if task.kind == TaskKind::File => result
                    .errors
                    .iter()
                    .try_for_each(|error| {
                        writeln!(out, " {} {} {}", "✗".red(), filepath, error.to_string().red())
                    }),
                _ => Ok(()),
            },
            ReporterEvent::Console { entry } => {
                let label = match entry.stream {
                    ConsoleStream::Stdout => "stdout",
                    ConsoleStream::Stderr => "stderr",
                };
                writeln!(
                    out,
                    "   {} {}",
                    format!("{} | {}", label, entry.filepath).dimmed(),
                    entry.content
                )
            }
            ReporterEvent::Error { filepath, error } => writeln!(
                out,
                " {} {} {}",
                "ERROR".on_red().white().bold(),
                filepath.as_deref().unwrap_or("<run>"),
                error.to_string().red()
            ),
            ReporterEvent::ContextCrashed {
                context_id,
                filepath,
                reason,
            } => writeln!(
                out,
                " {} {} while running {}: {}",
                "CRASH".on_red().white().bold(),
                context_id,
                filepath,
                reason
            ),
            ReporterEvent::RunFinished { summary } => Self::summary_lines(summary)
                .iter()
                .try_for_each(|line| writeln!(out, "{}", line)),
            ReporterEvent::FileCollected { .. } => Ok(()),
        };
    }
}

/// One JSON object per event on stdout
#[derive(Debug, Default)]
pub struct JsonReporter;

impl JsonReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Reporter for JsonReporter {
    fn on_event(&self, event: &ReporterEvent) {
        match serde_json::to_string(event) {
            Ok(line) => {
                let mut out = io::stdout().lock();
                let _ = writeln!(out, "{}", line);
            }
            Err(e) => warn!("Failed to serialize reporter event: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use trellis_core::{TaskError, TaskId};

    #[test]
    fn test_task_line_lists_errors() {
        colored::control::set_override(false);
        let task = TaskInfo {
            id: TaskId::for_file("math.yaml"),
            name: "sums > adds".to_string(),
            kind: TaskKind::Test,
        };
        let mut result = TaskResult::with_state(TaskState::Failed);
        result.duration = Some(Duration::from_millis(12));
        result.errors.push(TaskError::timeout(Duration::from_millis(10)));

        let line = ConsoleReporter::task_line("math.yaml", &task, &result);
        assert!(line.starts_with(" ✗ math.yaml > sums > adds 12ms"));
        assert!(line.contains("[timeout]"));
    }
}
