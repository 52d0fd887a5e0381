//! Terminal rendering of reports and runs

use colored::{ColoredString, Colorize};
use strata::migration::{
    DownCheck, FunctionCheck, FunctionOutcome, FunctionRun, MigrationOutcome, SchemaRun, StatusReport, UpCheck,
};

pub fn print_status(report: &StatusReport) {
    println!("\n📊 Schema Migrations\n");
    if report.schema.entries.is_empty() {
        println!("  None");
    }
    for entry in &report.schema.entries {
        let version = entry
            .version
            .map_or_else(|| "-".to_string(), |v| v.to_string());
        println!(
            "  {} {:<48} v{:<4} up: {:<8} down: {}",
            if entry.is_pending() { "⏳" } else { "✓ " },
            entry.filename,
            version,
            up_label(entry.up),
            down_label(entry.down),
        );
    }
    if let Some(error) = &report.schema.error {
        println!("  {} {}", "error:".red().bold(), error);
    }

    println!("\n📊 Functions\n");
    if report.functions.entries.is_empty() {
        println!("  None");
    }
    for entry in &report.functions.entries {
        println!(
            "  {} {:<48} {}",
            if entry.is_pending() { "⏳" } else { "✓ " },
            entry.filename,
            function_label(entry.check),
        );
    }
    if let Some(error) = &report.functions.error {
        println!("  {} {}", "error:".red().bold(), error);
    }

    let summary = match report.exit_code() {
        0 => "up to date".green(),
        1 => "changes pending".yellow(),
        _ => "errors".red(),
    };
    println!("\n📈 Summary: {summary}\n");
}

pub fn print_schema_run(run: &SchemaRun) {
    println!("\nSchema migrations (version {}):", run.version);
    for (filename, outcome) in &run.outcomes {
        if *outcome != MigrationOutcome::Skipped {
            println!("  {} {}", schema_outcome_label(*outcome), filename);
        }
    }
    println!(
        "  {} applied, {} rolled back, {} skipped",
        run.count(MigrationOutcome::Applied),
        run.count(MigrationOutcome::RolledBack) + run.count(MigrationOutcome::RolledBackWithoutDown),
        run.count(MigrationOutcome::Skipped),
    );
}

pub fn print_function_run(run: &FunctionRun) {
    println!("\nFunctions (version {}):", run.version);
    for (filename, outcome) in &run.outcomes {
        if *outcome != FunctionOutcome::Unchanged {
            println!("  {} {}", function_outcome_label(*outcome), filename);
        }
    }
    println!(
        "  {} created, {} updated, {} removed, {} unchanged",
        run.count(FunctionOutcome::Created),
        run.count(FunctionOutcome::Updated),
        run.count(FunctionOutcome::Removed),
        run.count(FunctionOutcome::Unchanged),
    );
}

fn up_label(check: UpCheck) -> ColoredString {
    match check {
        UpCheck::Skip => "skip".dimmed(),
        UpCheck::Valid => "valid".green(),
        UpCheck::Failed => "FAILED".red().bold(),
    }
}

fn down_label(check: DownCheck) -> ColoredString {
    match check {
        DownCheck::Valid => "valid".green(),
        DownCheck::Skip => "skip".dimmed(),
        DownCheck::Missing => "missing".yellow(),
        DownCheck::Empty => "empty".yellow(),
        DownCheck::Failed => "FAILED".red().bold(),
        DownCheck::NeedsRollback => "rollback pending".yellow(),
        DownCheck::Kept => "kept (first run)".dimmed(),
    }
}

fn function_label(check: FunctionCheck) -> ColoredString {
    match check {
        FunctionCheck::UpToDate => "up to date".dimmed(),
        FunctionCheck::CreatePending => "create pending".yellow(),
        FunctionCheck::UpdatePending => "update pending".yellow(),
        FunctionCheck::RemovePending => "remove pending".yellow(),
        FunctionCheck::Failed => "FAILED".red().bold(),
        FunctionCheck::NotRun => "not run".dimmed(),
    }
}

fn schema_outcome_label(outcome: MigrationOutcome) -> ColoredString {
    match outcome {
        MigrationOutcome::Skipped => "skipped".dimmed(),
        MigrationOutcome::Applied => "applied".green(),
        MigrationOutcome::Failed => "FAILED".red().bold(),
        MigrationOutcome::RolledBack => "rolled back".yellow(),
        MigrationOutcome::RolledBackWithoutDown => "rolled back (stored down only)".yellow(),
    }
}

fn function_outcome_label(outcome: FunctionOutcome) -> ColoredString {
    match outcome {
        FunctionOutcome::Unchanged => "unchanged".dimmed(),
        FunctionOutcome::Created => "created".green(),
        FunctionOutcome::Updated => "updated".green(),
        FunctionOutcome::Removed => "removed".yellow(),
        FunctionOutcome::Failed => "FAILED".red().bold(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_labels_stay_plain_text_underneath() {
        colored::control::set_override(false);
        assert_eq!(down_label(DownCheck::NeedsRollback).to_string(), "rollback pending");
        assert_eq!(down_label(DownCheck::Kept).to_string(), "kept (first run)");
        assert_eq!(function_label(FunctionCheck::NotRun).to_string(), "not run");
        assert_eq!(up_label(UpCheck::Failed).to_string(), "FAILED");
        assert_eq!(function_label(FunctionCheck::CreatePending).to_string(), "create pending");
    }
}
