use auction_platform::config::Config;
use auction_platform::services::{self, StartupError};
use dotenvy::dotenv;

#[actix_web::main]
async fn main() -> Result<(), StartupError> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = Config::from_env()?;
    log::info!("Starting {:?} service(s)", config.role);

    services::run(config).await.inspect_err(|e| {
        log::error!("Startup failed: {}", e);
    })
}
