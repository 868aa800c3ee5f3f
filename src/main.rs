//! This program runs experiment campaigns on a testbed of reservable, deployable nodes. Which
//! routine is chosen by passing different command line arguments.

// Useful common routines
#[macro_use]
mod common;

mod error;
mod remote;
mod reservation;
mod sweep;

// Dispatches sweep combinations to worker threads.
mod dispatch;

// Routines
mod simulation;
mod storagebench;

#[cfg(test)]
mod testutil;

use crate::error::RunnerError;

fn run() -> Result<(), failure::Error> {
    let matches = clap::App::new("testbed-runner")
        .about(
            "This program runs experiment campaigns on reserved testbed nodes. Which routine is \
             chosen by passing different command line arguments.",
        )
        .subcommand(simulation::cli_options())
        .subcommand(storagebench::cli_options())
        .setting(clap::AppSettings::SubcommandRequired)
        .setting(clap::AppSettings::DisableVersion)
        .get_matches();

    match matches.subcommand() {
        ("sweep", Some(sub_m)) => simulation::run(sub_m),
        ("storagebench", Some(sub_m)) => storagebench::run(sub_m),

        _ => {
            unreachable!();
        }
    }
}

fn main() {
    use console::style;

    env_logger::init();

    // Always get backtraces. The performance penalty does not matter here, and debugging a
    // failed campaign without them is painful.
    std::env::set_var("RUST_BACKTRACE", "1");

    // If an error occurred, try to print something helpful.
    if let Err(err) = run() {
        const MESSAGE: &str =
r#"== ERROR ==================================================================================
`testbed-runner` encountered an error. The log above may offer clues. If the error pertains to
SSH, you may be able to get useful information by setting the RUST_LOG=debug environment
variable. Jobs that were not deleted can be listed with `oarstat -u` on the site frontend."#;

        println!("{}", style(MESSAGE).red().bold());

        // Errors from SSH commands
        if err.downcast_ref::<spurs::SshError>().is_some() {
            println!("An error occurred while attempting to run a command over SSH");
        }

        match err.downcast_ref::<RunnerError>() {
            Some(RunnerError::ReservationFailure { .. }) => {
                println!("The testbed could not provide usable nodes");
            }
            Some(RunnerError::ReservationLost { .. }) => {
                println!("The campaign is incomplete; it can be continued with `sweep --resume`");
            }
            _ => {}
        }

        // Print error and backtrace
        println!(
            "`testbed-runner` encountered the following error:\n{}\n{}",
            err.as_fail(),
            err.backtrace(),
        );

        std::process::exit(101);
    }
}
