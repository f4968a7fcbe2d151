use anyhow::Result;
use clap::{ArgAction, Parser};

use scribe::config::Settings;
use scribe::mail::worker::MailWorker;

#[derive(Parser, Debug)]
#[command(name = "scribe-mailworker", version, about = "Scribe IMAP/SMTP worker", long_about = None)]
struct Args {
    /// Override the frontend API base URL
    #[arg(long, value_name = "URL")]
    frontend: Option<String>,

    /// Increase logging verbosity
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    scribe::telemetry::init_tracing(args.verbose)?;

    let mut settings = Settings::from_env()?;
    if let Some(frontend) = args.frontend {
        settings.mail.frontend_url = frontend;
    }

    let worker = MailWorker::new(settings.mail)?;
    worker.run().await
}
