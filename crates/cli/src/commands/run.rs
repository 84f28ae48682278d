//! `run` - execute suites as concurrent module runs

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use colored::Colorize;
use tokio::task::JoinSet;
use tracing::{error, info};

use ephemeral_harness::{
    write_results, HarnessConfig, HarnessResult, ModuleReport, PortAllocator, TestRunner,
    WebDriverFactory,
};

use crate::output::{print_error, print_success};
use crate::suites;

#[derive(Args)]
pub struct RunArgs {
    /// Suites to run (all registered suites when omitted)
    pub suites: Vec<String>,

    /// Project root, overriding the configuration file
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// First server port to hand out
    #[arg(long)]
    pub base_port: Option<u16>,

    /// Write every module report to this JSON file
    #[arg(long)]
    pub results: Option<PathBuf>,

    /// Show the browser windows
    #[arg(long)]
    pub headed: bool,
}

/// How one module run ended
enum Outcome {
    Finished(ModuleReport),
    Aborted(String),
}

/// Run the selected suites and return the process exit code.
pub async fn execute(args: RunArgs, mut config: HarnessConfig) -> anyhow::Result<i32> {
    let selected = suites::select(&args.suites)?;

    if let Some(root) = args.root {
        config.project_root = root;
    }
    if let Some(port) = args.base_port {
        config.base_port = port;
    }
    if args.headed {
        config.webdriver.headless = false;
    }

    let factory = Arc::new(WebDriverFactory::new(config.webdriver.clone())?);
    let ports = Arc::new(PortAllocator::new(config.base_port));
    let runner = Arc::new(TestRunner::new(Arc::new(config), ports, factory));

    info!(suites = selected.len(), "starting module runs");
    let mut tasks = JoinSet::new();
    for suite in selected {
        let runner = Arc::clone(&runner);
        tasks.spawn(async move {
            let mut console = Vec::new();
            let outcome = runner.run_module(&suite, &mut console).await;
            (suite.name, console, outcome)
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, console, outcome)) => {
                // Each module's report is printed as one block.
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&console)?;
                stdout.flush()?;
                drop(stdout);
                outcomes.push((name, settle(name, outcome)));
            }
            Err(e) => {
                error!(error = %e, "module run task failed");
                outcomes.push(("<unknown>", Outcome::Aborted(e.to_string())));
            }
        }
    }

    let reports: Vec<ModuleReport> = outcomes
        .iter()
        .filter_map(|(_, outcome)| match outcome {
            Outcome::Finished(report) => Some(report.clone()),
            Outcome::Aborted(_) => None,
        })
        .collect();
    if let Some(path) = &args.results {
        write_results(path, &reports)?;
    }

    print_overview(&outcomes);
    Ok(exit_code(&outcomes))
}

fn settle(name: &str, outcome: HarnessResult<ModuleReport>) -> Outcome {
    match outcome {
        Ok(report) => Outcome::Finished(report),
        Err(e) => {
            error!(module = name, error = %e, "module run aborted");
            print_error(&format!("{name}: {e}"));
            Outcome::Aborted(e.to_string())
        }
    }
}

fn print_overview(outcomes: &[(&str, Outcome)]) {
    println!();
    println!("{}", "━".repeat(60).dimmed());
    println!("{}", " Modules".bold());
    println!("{}", "━".repeat(60).dimmed());
    for (name, outcome) in outcomes {
        match outcome {
            Outcome::Finished(report) if report.exit_code() == 0 => println!(
                "  {} {} {}",
                "✓".green(),
                name.bold(),
                format!("({} passed, port {})", report.passed(), report.port).dimmed()
            ),
            Outcome::Finished(report) => println!(
                "  {} {} {}",
                "✗".red(),
                name.bold(),
                format!("({} passed, {} failed)", report.passed(), report.failed()).dimmed()
            ),
            Outcome::Aborted(reason) => {
                println!("  {} {} {}", "✗".red(), name.bold(), reason.dimmed())
            }
        }
    }

    if exit_code(outcomes) == 0 {
        print_success("All modules passed");
    } else {
        print_error("Some modules failed");
    }
}

fn exit_code(outcomes: &[(&str, Outcome)]) -> i32 {
    let failed = outcomes.iter().any(|(_, outcome)| match outcome {
        Outcome::Finished(report) => report.exit_code() != 0,
        Outcome::Aborted(_) => true,
    });
    i32::from(failed)
}
