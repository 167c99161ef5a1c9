use musicr::config::AppConfig;

#[rocket::main]
async fn main() {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("💥 Fatal configuration error: {e}");
            std::process::exit(1);
        }
    };

    if config.maintenance_mode {
        println!("🚧 Maintenance mode: WS upgrades and message frames are refused");
    }

    let rocket = match musicr::build_rocket(config).await {
        Ok(rocket) => rocket,
        Err(e) => {
            eprintln!("💥 Refusing to serve: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rocket.launch().await {
        eprintln!("💥 Server exited with error: {e}");
        std::process::exit(1);
    }
}
