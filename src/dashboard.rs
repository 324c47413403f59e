use std::io::{self, BufRead, Write};
use tracing::{info, warn};

const PROMPT: &str = "Would you like to monitor RabbitMQ queues? y or n ";

/// Asks on the terminal whether to open the management UI, and opens it
/// in the default browser on "y". Never fails the run.
pub fn offer(url: &str) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    match ask(stdin.lock(), &mut stdout, PROMPT) {
        Ok(true) => match open::that(url) {
            Ok(()) => info!(url = %url, "Opened RabbitMQ management UI"),
            Err(e) => warn!(error = %e, url = %url, "Failed to open browser"),
        },
        Ok(false) => info!("Skipping RabbitMQ management UI"),
        Err(e) => warn!(error = %e, "Could not read dashboard prompt answer"),
    }
}

pub fn ask<R: BufRead, W: Write>(mut input: R, output: &mut W, question: &str) -> io::Result<bool> {
    write!(output, "{}", question)?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    writeln!(output)?;

    let answer = answer.trim_end_matches(['\r', '\n']);
    Ok(answer.eq_ignore_ascii_case("y"))
}
