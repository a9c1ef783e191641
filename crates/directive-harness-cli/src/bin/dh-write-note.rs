use directive_harness_cli::directives::WriteNoteDirective;
use directive_harness_cli::run_directive_cli;

fn main() -> std::process::ExitCode {
    run_directive_cli(&WriteNoteDirective)
}
