//! quote-relay daemon

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    quote_relay::daemon::run().await
}
