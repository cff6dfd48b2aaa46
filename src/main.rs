use podquiz_lib::config::Config;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    podquiz_lib::init_logging(&config.log_level);

    if let Err(e) = podquiz_lib::run(config).await {
        log::error!("Server failed: {:#}", e);
        std::process::exit(1);
    }
}
