use std::process::ExitCode;

fn main() -> ExitCode {
    pacer_cli::run()
}
