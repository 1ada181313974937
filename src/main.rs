use std::process::ExitCode;

fn main() -> ExitCode {
    tunnel_pilot::run()
}
