use clap::Parser;
use graphsync::app::initialize_app;
use graphsync::cli::{execute, handle_key_clear, Cli, Command};
use graphsync::config::Settings;
use graphsync::logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    logging::init(&settings.logging);

    // Must work even when the stored key no longer decrypts anything.
    if let Command::ClearKey = cli.command {
        return handle_key_clear(&settings.security);
    }

    let engine = match initialize_app(settings).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    execute(&engine, cli.command).await
}
