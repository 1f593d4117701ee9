use confab::config::AppConfig;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::load();
    if let Err(e) = confab::run(config).await {
        log::error!("[server] {e}");
        std::process::exit(1);
    }
}
