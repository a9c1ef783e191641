use directive_harness_cli::directives::EchoDirective;
use directive_harness_cli::run_directive_cli;

fn main() -> std::process::ExitCode {
    run_directive_cli(&EchoDirective)
}
