//! Sends and receives the sample batch over AMQP WebSockets
//!
//! ```bash
//! websocket_sample -c "<connection string>" -q <queue>
//! ```

use servicebus_proxy_sample::OptionSet;

#[tokio::main]
async fn main() {
    let code = servicebus_proxy_sample::launch(OptionSet::Base).await;
    std::process::exit(code)
}
