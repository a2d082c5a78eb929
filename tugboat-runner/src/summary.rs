//! Terminal summary of a finished run

use colored::*;
use tugboat_core::domain::result::{PipelineResult, RunOutcome};
use tugboat_core::domain::stage::{StageOutcome, StageRecord};

/// Prints the stage history and final outcome of a run
pub fn print_summary(result: &PipelineResult) {
    println!();
    println!("{}", format!("Run {}", result.run_id).bold());

    for record in &result.history {
        print_stage(record);
    }
    println!();

    match &result.outcome {
        RunOutcome::Succeeded {
            address,
            image_reference,
            endpoint,
        } => {
            println!("{}", "✓ Deployment succeeded".green().bold());
            println!("  Instance: {}", address.cyan());
            println!("  Image:    {}", image_reference);
            println!("  Endpoint: {}", endpoint.cyan());
        }
        RunOutcome::Failed {
            stage,
            kind,
            reason,
            diagnostics,
        } => {
            println!(
                "{}",
                format!("✗ Deployment failed at {}", stage).red().bold()
            );
            println!("  Error:  {} {}", kind.yellow(), reason);
            match diagnostics {
                Some(report) => {
                    let failed = report.failed_fields();
                    if failed.is_empty() {
                        println!("  Diagnostics: {}", "complete (see log above)".dimmed());
                    } else {
                        println!(
                            "  Diagnostics: {} {}",
                            "partial, missing".yellow(),
                            failed.join(", ")
                        );
                    }
                }
                None => println!("  Diagnostics: {}", "none".dimmed()),
            }
        }
    }
}

fn print_stage(record: &StageRecord) {
    let marker = match &record.outcome {
        StageOutcome::Success => "✓".green(),
        StageOutcome::Skipped { .. } => "-".yellow(),
        StageOutcome::Failure { .. } => "✗".red(),
    };

    println!(
        "  {} {:<18} {:<40} {}",
        marker,
        record.stage.as_str(),
        record.outcome.to_string(),
        format!(
            "{} attempt(s), {}",
            record.attempts,
            record.timestamp.format("%H:%M:%S")
        )
        .dimmed()
    );
}
