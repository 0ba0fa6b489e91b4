//! Colored output helpers for CLI
//!
//! Provides consistent, colored terminal output for the Argus CLI.

use crate::research::{ResearchReport, StopReason};
use owo_colors::OwoColorize;

/// How many results the summary lists before eliding the rest.
const SUMMARY_RESULTS: usize = 10;

/// Output style configuration
pub struct Output {
    /// Whether to use colored output
    pub colored: bool,
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}

impl Output {
    /// Create a new output helper with colors enabled
    pub fn new() -> Self {
        Self { colored: true }
    }

    /// Create a new output helper with colors disabled
    pub fn no_color() -> Self {
        Self { colored: false }
    }

    /// Print the Argus banner
    pub fn banner(&self) {
        if self.colored {
            println!(
                "\n   {} {}\n",
                "ARGUS".bright_cyan().bold(),
                format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
            );
        } else {
            println!("\n   ARGUS v{}\n", env!("CARGO_PKG_VERSION"));
        }
    }

    /// Print a success message with a checkmark
    pub fn success(&self, message: &str) {
        if self.colored {
            println!("  {} {}", "✓".green().bold(), message.green());
        } else {
            println!("  [OK] {}", message);
        }
    }

    /// Print an info message
    pub fn info(&self, message: &str) {
        if self.colored {
            println!("  {} {}", "•".blue(), message);
        } else {
            println!("  [INFO] {}", message);
        }
    }

    /// Print a warning message
    pub fn warning(&self, message: &str) {
        if self.colored {
            println!("  {} {}", "⚠".yellow().bold(), message.yellow());
        } else {
            println!("  [WARN] {}", message);
        }
    }

    /// Print an error message
    pub fn error(&self, message: &str) {
        if self.colored {
            eprintln!("  {} {}", "✗".red().bold(), message.red());
        } else {
            eprintln!("  [ERROR] {}", message);
        }
    }

    /// Print a header for a section
    pub fn header(&self, title: &str) {
        if self.colored {
            println!("\n  {}", title.bright_white().bold().underline());
        } else {
            println!("\n  === {} ===", title);
        }
    }

    /// Print a key-value pair
    pub fn kv(&self, key: &str, value: &str) {
        if self.colored {
            println!("    {}: {}", key.dimmed(), value.bright_white());
        } else {
            println!("    {}: {}", key, value);
        }
    }

    /// Print a list item
    pub fn list_item(&self, item: &str) {
        if self.colored {
            println!("    {} {}", "•".blue(), item);
        } else {
            println!("    - {}", item);
        }
    }

    /// Print a hint/tip message
    pub fn hint(&self, message: &str) {
        if self.colored {
            println!("\n  {} {}", "→".dimmed(), message.dimmed().italic());
        } else {
            println!("\n  [TIP] {}", message);
        }
    }

    /// Print a table header row
    pub fn table_header(&self, columns: &[&str]) {
        let header = pad_columns(columns);
        if self.colored {
            println!("    {}", header.bright_white().bold());
            println!("    {}", "─".repeat(columns.len() * 16).dimmed());
        } else {
            println!("    {}", header);
            println!("    {}", "-".repeat(columns.len() * 16));
        }
    }

    /// Print a table row
    pub fn table_row(&self, values: &[&str]) {
        println!("    {}", pad_columns(values));
    }

    /// Print a research report: text, stop reason, top results, failures.
    pub fn report(&self, report: &ResearchReport) {
        self.header("Report");
        for line in report.report_text.lines() {
            println!("  {}", line);
        }

        self.header("Run");
        self.kv("run id", &report.run_id);
        self.kv("stopped", &report.stop_reason.to_string());
        self.kv("elapsed", &format!("{:.1}s", report.elapsed_secs));
        self.kv("tasks", &report.tasks.len().to_string());
        self.kv("results", &report.results.len().to_string());
        self.kv("entities", &report.entities.len().to_string());
        if let StopReason::Saturated { .. } = report.stop_reason {
            self.success("Findings saturated before the task ceiling");
        }

        if !report.results.is_empty() {
            self.header("Top results");
            for result in report.results.iter().take(SUMMARY_RESULTS) {
                self.list_item(&format!("{} <{}>", result.title, result.url));
            }
            if report.results.len() > SUMMARY_RESULTS {
                self.hint(&format!(
                    "{} more; use --output to write the full report",
                    report.results.len() - SUMMARY_RESULTS
                ));
            }
        }

        if !report.failed_tasks.is_empty() {
            self.header("Failed tasks");
            for failed in &report.failed_tasks {
                self.warning(&format!("#{} {}: {}", failed.id, failed.query, failed.reason));
            }
        }
    }

    /// Print newline
    pub fn newline(&self) {
        println!();
    }
}

fn pad_columns(values: &[&str]) -> String {
    values
        .iter()
        .map(|v| format!("{:<15}", v))
        .collect::<Vec<_>>()
        .join(" ")
}
