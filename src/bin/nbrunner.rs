//! Batch notebook runner binary.
//!
//! Executes a notebook file end-to-end, replaying inserted-cell and
//! set-cell-content actions between executions and collecting evaluation
//! records into a JSONL file. Cell execution itself is delegated to the
//! interactive runtime; without one attached this binary performs an
//! offline replay pass (actions and metadata are applied, code is not run).
//!
//! # Usage
//!
//! ```bash
//! nbrunner [-o OUTPUT] [-e EVALUATE] [-R] [-m MAX_CELLS] INPUT
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use jupyter_agent::evaluation::{NotebookRunner, RunnerOptions, ScriptedRuntime};

struct CliArgs {
    input_path: PathBuf,
    options: RunnerOptions,
}

fn usage() -> ! {
    eprintln!(
        "usage: nbrunner [-o OUTPUT] [-e EVALUATE] [-R] [-m MAX_CELLS] \
         [--skip-tag TAG] INPUT"
    );
    std::process::exit(2);
}

fn parse_args() -> CliArgs {
    let mut input_path: Option<PathBuf> = None;
    let mut options = RunnerOptions::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-o" | "--output-path" => {
                options.output_path = args.next().map(PathBuf::from);
            }
            "-e" | "--evaluate-path" => {
                options.evaluate_path = args.next().map(PathBuf::from);
            }
            "-R" | "--reset-output" => options.reset_output = true,
            "-m" | "--max-cells" => {
                match args.next().and_then(|value| value.parse().ok()) {
                    Some(max_cells) => options.max_cells = max_cells,
                    None => usage(),
                }
            }
            "--skip-tag" => match args.next() {
                Some(tag) => options.skip_cells_with_tag = tag,
                None => usage(),
            },
            "-h" | "--help" => usage(),
            other if !other.starts_with('-') && input_path.is_none() => {
                input_path = Some(PathBuf::from(other));
            }
            _ => usage(),
        }
    }
    let Some(input_path) = input_path else { usage() };
    CliArgs {
        input_path,
        options,
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = parse_args();
    let mut runner = match NotebookRunner::new(&args.input_path, args.options) {
        Ok(runner) => runner,
        Err(err) => {
            eprintln!("failed to open notebook {}: {err}", args.input_path.display());
            return ExitCode::FAILURE;
        }
    };
    log::info!("opening notebook: {}", args.input_path.display());
    let mut runtime = ScriptedRuntime::default();
    match runner.run(&mut runtime) {
        Ok(()) => {
            log::info!(
                "saved executed notebook to {}; evaluation records in {}",
                runner.output_path.display(),
                runner.evaluate_path.display(),
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("notebook execution failed: {err}");
            ExitCode::FAILURE
        }
    }
}
