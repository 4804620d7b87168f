use std::io::Write;
use std::process::ExitCode;

use tinysmtpd::tracing::setup_tracing;
use tinysmtpd::{Config, Mail, Server, Settings};
use tracing::{error, info, warn};

fn print_mail(mail: Mail) {
    info!(
        "Received \"{}\" from {}",
        mail.message.subject().unwrap_or("(no subject)"),
        mail.peer
    );

    match serde_json::to_string(&mail) {
        Ok(line) => {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = writeln!(stdout, "{}", line) {
                warn!("Couldn't write message to stdout: {}", e);
            }
        }
        Err(e) => warn!("Couldn't serialise message: {}", e),
    }
}

fn serve() -> tinysmtpd::Result<()> {
    let config = Config::from_env()?;
    let mut server = Server::new(Settings::new(config.hostname, print_mail));
    server.bind(config.port, config.address)?;

    match server.start(config.processes)? {
        Some(dispatcher) => dispatcher.run(),
        None => {
            info!("All workers exited");
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    if let Err(e) = setup_tracing() {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("SMTP service exited: {}", e);
            ExitCode::FAILURE
        }
    }
}
