#![deny(missing_docs, missing_debug_implementations)]

//! Service Bus queue sample over AMQP WebSockets, optionally through an HTTP proxy
//!
//! The sample resolves its configuration from flags and environment variables, switches the
//! connection to the WebSocket transport, then sends ten JSON messages to a queue while a receive
//! loop reads them back. It stops after a keypress or ten seconds.
//!
//! ```bash
//! proxy_sample -c "$SERVICE_BUS_CONNECTION_STRING" -q my-queue -h proxy.corp.example -p 3128
//! ```

use tracing_subscriber::EnvFilter;

pub mod amqp;
pub mod client;
pub mod config;
pub mod connection_string;
pub mod error;
pub mod message;
pub mod receive;
pub mod run;
pub mod send;
pub mod settings;

pub use config::OptionSet;
pub use error::{ClientError, ConfigError, Error};

use crate::{
    amqp::AmqpConnector,
    receive::ScientistHandler,
    run::{Coordinator, RunOptions},
};

/// Installs the fmt subscriber, filtered by `RUST_LOG` and `info` by default
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Already installed when called twice
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Runs the sample with the options of `set` and returns the process exit code
pub async fn launch(set: OptionSet) -> i32 {
    // RUST_LOG may come from the .env file
    dotenv::dotenv().ok();
    init_tracing();

    let config = match config::resolve(std::env::args_os(), |key| std::env::var(key).ok(), set) {
        Ok(config) => config,
        Err(ConfigError::InvalidArguments(err))
            if err.kind() == clap::error::ErrorKind::DisplayHelp =>
        {
            let _ = err.print();
            return 0;
        }
        Err(error) => {
            eprintln!("{error}");
            println!("{}", config::usage(set));
            return ConfigError::EXIT_CODE;
        }
    };

    let settings = match settings::configure(&config, config.proxy_strategy()) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("{error}");
            return ConfigError::EXIT_CODE;
        }
    };
    tracing::info!(
        host = settings.host(),
        queue = config.queue_name(),
        transport = %settings.transport(),
        "settings configured"
    );

    let mut coordinator = Coordinator::new(
        AmqpConnector::new(settings),
        config.queue_name(),
        RunOptions::default(),
    );
    match coordinator
        .run(ScientistHandler::new(), run::stdin_keypress())
        .await
    {
        Ok(()) => 0,
        Err(error) => {
            tracing::error!(%error, "sample failed");
            eprintln!("{error}");
            error.exit_code()
        }
    }
}
