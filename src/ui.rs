use colored::{ColoredString, Colorize};
use rollout::{AppResult, ExecutionResult, ExecutionStatus, PhaseResult};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Run report
// ============================================================================

fn symbol(status: ExecutionStatus) -> ColoredString {
    match status {
        ExecutionStatus::Success => "✓".green(),
        ExecutionStatus::Failed => "✗".red(),
        ExecutionStatus::RolledBack => "↺".yellow(),
        ExecutionStatus::Skipped => "-".dimmed(),
        ExecutionStatus::Running => "…".blue(),
        ExecutionStatus::Pending => "○".dimmed(),
    }
}

/// Human-readable duration: `850ms`, `12.3s`, `4m05s`
pub fn format_duration(duration: chrono::Duration) -> String {
    let millis = duration.num_milliseconds().max(0);
    if millis < 1000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        format!("{:.1}s", millis as f64 / 1000.0)
    } else {
        let secs = millis / 1000;
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

fn line(
    indent: usize,
    status: ExecutionStatus,
    name: &str,
    duration: Option<chrono::Duration>,
    error: Option<&str>,
) -> String {
    let mut out = format!("{}{} {}", "  ".repeat(indent), symbol(status), name);
    if status != ExecutionStatus::Success {
        out.push_str(&format!(" {}", format!("({status})").dimmed()));
    }
    if let Some(duration) = duration {
        out.push_str(&format!(" {}", format_duration(duration).dimmed()));
    }
    if let Some(error) = error {
        out.push_str(&format!("\n{}{}", "  ".repeat(indent + 2), error.red()));
    }
    out
}

fn app_lines(app: &AppResult, indent: usize, out: &mut Vec<String>) {
    out.push(line(indent, app.status, &app.name, app.duration(), app.error.as_deref()));
}

fn phase_lines(phase: &PhaseResult, indent: usize, out: &mut Vec<String>) {
    let title = format!("{}", phase.name.bold());
    out.push(line(indent, phase.status, &title, phase.duration(), phase.error.as_deref()));
    for app in &phase.apps {
        app_lines(app, indent + 1, out);
    }
    for nested in &phase.phases {
        phase_lines(nested, indent + 1, out);
    }
}

/// The result tree, one line per app and phase
pub fn report_lines(result: &ExecutionResult) -> Vec<String> {
    let mut out = Vec::new();
    for app in &result.apps {
        app_lines(app, 1, &mut out);
    }
    for phase in &result.phases {
        phase_lines(phase, 1, &mut out);
    }
    out
}

/// Print the result tree and a summary line
pub fn report(result: &ExecutionResult) {
    header("Deployment");
    for line in report_lines(result) {
        println!("{line}");
    }
    println!();

    let summary = format!(
        "{}/{} apps deployed{}",
        result.successful_apps(),
        result.total_apps(),
        result
            .duration()
            .map(|d| format!(" in {}", format_duration(d)))
            .unwrap_or_default()
    );
    if result.is_success() {
        success(&summary);
    } else {
        error(&summary);
        if let Some(err) = &result.error {
            dim(err);
        }
    }
}
