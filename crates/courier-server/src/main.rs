use courier_server::{CourierServer, config::loader, init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1);
    let config = match loader::load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(2);
        }
    };

    init_tracing(&config.logging.level);

    if let Err(err) = CourierServer::new(config).run().await {
        eprintln!("server error: {err}");
        std::process::exit(1);
    }

    shutdown_tracing();
}
