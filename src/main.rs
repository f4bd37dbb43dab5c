use api_gateway::{config::GatewayConfig, server};

#[tokio::main]
async fn main() {
    let config = GatewayConfig::from_env();

    if let Err(e) = config.validate() {
        eprintln!("configuration error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = server::startup(config).await {
        eprintln!("gateway failed: {}", e);
        std::process::exit(1);
    }
}
