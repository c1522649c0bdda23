#![forbid(unsafe_code)]

use bd_conformance::{CaseStatus, HarnessConfig, run_fixture_by_id, run_fixture_suite};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut fixture_root: Option<String> = None;
    let mut case_filter: Option<String> = None;
    let mut emit_json = false;
    let mut require_green = false;

    let mut args = std::env::args().skip(1).peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fixtures" => {
                let value = args.next().ok_or("--fixtures requires a directory")?;
                fixture_root = Some(value);
            }
            "--case" => {
                let value = args
                    .next()
                    .ok_or("--case requires a value (e.g. join_combinatorial)")?;
                case_filter = Some(value);
            }
            "--json" => {
                emit_json = true;
            }
            "--require-green" => {
                require_green = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    let mut config = HarnessConfig::default_paths();
    if let Some(root) = fixture_root {
        config = config.with_fixture_root(root);
    }

    let report = match case_filter.as_deref() {
        Some(case_id) => run_fixture_by_id(&config, case_id)?,
        None => run_fixture_suite(&config)?,
    };

    if emit_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for result in &report.results {
            let status = match result.status {
                CaseStatus::Pass => "pass",
                CaseStatus::Fail => "FAIL",
            };
            println!(
                "{status} case={} operation={:?} strategy={} evidence={}",
                result.case_id, result.operation, result.strategy, result.evidence_records
            );
            if let Some(mismatch) = &result.mismatch {
                println!("     {mismatch}");
            }
        }
        println!(
            "suite={} fixtures={} passed={} failed={} green={}",
            report.suite,
            report.fixture_count,
            report.passed,
            report.failed,
            report.is_green()
        );
    }

    if require_green && !report.is_green() {
        return Err(format!(
            "suite {} is not green: {} of {} fixture(s) failed",
            report.suite, report.failed, report.fixture_count
        )
        .into());
    }

    Ok(())
}

fn print_help() {
    println!(
        "bd-conformance-cli\n\
         Usage:\n\
         \tbd-conformance-cli [--fixtures DIR] [--case ID] [--json] [--require-green]\n\
         Options:\n\
         \t--fixtures <dir>     Load fixtures from DIR instead of the bundled set\n\
         \t--case <id>          Run only one fixture case\n\
         \t--json               Print the suite report as JSON\n\
         \t--require-green      Fail with non-zero exit when any case fails or none ran\n\
         \t-h, --help           Show this help"
    );
}
