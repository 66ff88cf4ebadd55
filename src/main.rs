use anyhow::Context;
use modelgate::configuration::get_configuration;
use modelgate::startup::{run, Services};
use modelgate::telemetry::{get_subscriber, init_subscriber};
use std::net::TcpListener;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = get_subscriber("modelgate".into(), "info".into());
    init_subscriber(subscriber).map_err(anyhow::Error::msg)?;

    let settings = get_configuration().context("Failed to read configuration")?;
    let services = Services::build(&settings).await?;

    let address = settings.app.address();
    tracing::info!("Start server at {:?}", &address);
    let listener = TcpListener::bind(&address).with_context(|| format!("failed to bind to {}", address))?;

    let result = run(listener, services.clone()).await?.await;
    services.shutdown().await;

    Ok(result?)
}
