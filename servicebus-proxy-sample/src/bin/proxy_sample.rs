//! Sends and receives the sample batch over AMQP WebSockets through an HTTP proxy
//!
//! ```bash
//! proxy_sample -c "<connection string>" -q <queue> -h <proxy host> -p <proxy port>
//! proxy_sample -c "<connection string>" -q <queue> -h <proxy host> -p <proxy port> --proxy-scope process
//! ```

use servicebus_proxy_sample::OptionSet;

#[tokio::main]
async fn main() {
    let code = servicebus_proxy_sample::launch(OptionSet::Proxy).await;
    std::process::exit(code)
}
