use std::io::{self, Write};

use serde::Serialize;

use crate::app::{FetchResult, OrganizeResult, PlanResult, ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_plan(result: &PlanResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_organize(result: &OrganizeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human-readable progress on stderr, summaries on stdout.
pub struct TextOutput;

impl TextOutput {
    pub fn print_plan(result: &PlanResult) {
        println!(
            "planned {} requests: {} tiles ({} with points of interest) x {} windows for {}",
            result.requests, result.tiles, result.points_of_interest, result.windows, result.collection
        );
        if let Some(path) = &result.manifest_path {
            println!("manifest: {path}");
        }
    }

    pub fn print_fetch(result: &FetchResult) {
        if result.dry_run {
            println!(
                "dry run: {} requests would be written under {}",
                result.planned, result.output_dir
            );
            return;
        }
        let summary = &result.summary;
        println!("fetched into {}", result.output_dir);
        println!("  success:            {}", summary.success);
        println!("  skipped (existing): {}", summary.skipped_existing);
        println!("  failed (permanent): {}", summary.failed_permanent);
        println!("  failed (retries):   {}", summary.failed_retryable_exhausted);
        println!("  cancelled:          {}", summary.cancelled);
        for outcome in result.outcomes.iter().filter(|outcome| outcome.error.is_some()) {
            println!(
                "  ! {} after {} attempt(s): {}",
                outcome.key,
                outcome.attempts,
                outcome.error.as_deref().unwrap_or_default()
            );
        }
    }

    pub fn print_organize(result: &OrganizeResult) {
        let report = &result.report;
        println!(
            "organized {} samples into {}",
            report.samples.len(),
            result.target_dir
        );
        let mut labels: Vec<&str> = report
            .samples
            .iter()
            .filter_map(|sample| sample.label.as_deref())
            .collect();
        labels.sort_unstable();
        labels.dedup();
        for label in labels {
            println!("  {label}: {}", report.count_label(label));
        }
        for failure in &report.failures {
            println!("  ! {}: {}", failure.archive, failure.error);
        }
    }
}

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({} ms)", event.message, elapsed.as_millis()),
            None => eprintln!("{}", event.message),
        }
    }
}
