mod cache;
mod cli;
mod cmd;
mod crdpolicy;
mod errors;
mod helmbuild;
mod index;
mod logger;
mod model;
mod output;
mod overlay;
mod pipeline;
mod postrender;
mod repository;
mod values;
mod worker;

use std::process::ExitCode;

use tracing::error;

use cli::Cli;
use errors::BuildError;

fn main() -> ExitCode {
    let config = match Cli::resolve() {
        Ok(config) => config,
        Err(err) => {
            // Config parsing failed before logging is set up; the CLI flags
            // that would configure the logger are exactly what's in
            // question, so fall back to a plain eprintln here.
            eprintln!("flux-build: configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    logger::init(config.log_level, config.log_encoding);
    let allow_failure = config.allow_failure;

    match pipeline::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            if allow_failure {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn report(err: &BuildError) {
    error!(kind = ?err.kind(), "{}", err);
}
