pub mod bus;
pub mod chat;
pub mod config;
pub mod connection;
pub mod db;
pub mod embedding;
pub mod error;
pub mod events;
pub mod matcher;
pub mod models;
pub mod presence;
pub mod rate_limit;
pub mod reactions;
pub mod routes;

use std::sync::Arc;

use rocket::fairing::AdHoc;
use rocket::http::Header;
use rocket_cors::{AllowedOrigins, CorsOptions};

use bus::Bus;
use chat::ChatService;
use config::{AppConfig, generate_instance_id};
use connection::ConnectionManager;
use db::Db;
use embedding::EmbeddingProvider;
use error::FatalConfig;
use matcher::SongMatcher;
use presence::PresenceRegistry;
use rate_limit::RateLimiter;
use reactions::ReactionService;

/// Process-scoped identifier, attached to every response and bus envelope.
pub struct InstanceId(pub String);

/// Hard cap on JSON bodies; the WS path carries its own frame limits.
const BODY_LIMIT_BYTES: u64 = 64 * 1024;

/// Wire the whole server: database, matcher, bus, presence, services,
/// gateway. All fatal configuration problems surface here, before launch.
pub async fn build_rocket(config: AppConfig) -> Result<rocket::Rocket<rocket::Build>, FatalConfig> {
    let instance_id = generate_instance_id();
    println!("🎤 musicr starting as instance {instance_id}");

    let db = Db::connect(&config.database_url)?;
    let catalog = db.startup_check().await?;
    println!(
        "🎵 Catalog ready: {} songs (index version {})",
        catalog.song_count, catalog.index_version
    );

    let embedder = Arc::new(EmbeddingProvider::new(config.embed_remote_url.clone()));
    embedder.startup_probe().await?;

    let matcher = Arc::new(SongMatcher::new(
        db.clone(),
        Arc::clone(&embedder),
        catalog.index_version.clone(),
        config.debug_matching,
    ));

    let connections = Arc::new(ConnectionManager::new());
    let bus = Arc::new(Bus::connect(config.bus_url.as_deref(), &instance_id).await);
    let presence = Arc::new(
        PresenceRegistry::new(
            config.heartbeat_timeout(),
            Arc::clone(&bus),
            Arc::clone(&connections),
        )
        .await,
    );
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_max,
        config.rate_limit_window_secs,
    ));
    let chat = Arc::new(ChatService::new(
        db.clone(),
        Arc::clone(&matcher),
        Arc::clone(&connections),
        Arc::clone(&bus),
        Arc::clone(&limiter),
    ));
    let reaction_service = Arc::new(ReactionService::new(
        db.clone(),
        Arc::clone(&connections),
        Arc::clone(&bus),
    ));

    let cors_options = if config.frontend_origins.is_empty() {
        CorsOptions::default()
    } else {
        CorsOptions {
            allowed_origins: AllowedOrigins::some_exact(&config.frontend_origins),
            ..Default::default()
        }
    };
    let cors = cors_options
        .to_cors()
        .map_err(|e| FatalConfig::Invalid("FRONTEND_ORIGIN", e.to_string()))?;

    let figment = rocket::Config::figment().merge(("limits.json", BODY_LIMIT_BYTES));

    let header_instance_id = instance_id.clone();
    let subscriber_bus = Arc::clone(&bus);
    let subscriber_connections = Arc::clone(&connections);
    let subscriber_presence = Arc::clone(&presence);
    let subscriber_instance_id = instance_id.clone();

    let build = rocket::custom(figment)
        .manage(config)
        .manage(db)
        .manage(bus)
        .manage(connections)
        .manage(presence)
        .manage(chat)
        .manage(reaction_service)
        .manage(InstanceId(instance_id))
        .attach(cors)
        .attach(AdHoc::on_response("Instance Id Header", move |_req, res| {
            let id = header_instance_id.clone();
            Box::pin(async move {
                res.set_header(Header::new("X-Instance-Id", id));
            })
        }))
        .register("/", rocket::catchers![routes::not_found])
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::list_rooms,
                routes::get_messages,
                routes::room_users,
                routes::socket_route,
            ],
        )
        .attach(AdHoc::on_liftoff("Bus Subscriber", move |_rocket| {
            Box::pin(async move {
                let Some(client) = subscriber_bus.redis_client() else {
                    return;
                };
                bus::spawn_subscriber(
                    client,
                    subscriber_instance_id,
                    subscriber_connections,
                    Arc::clone(&subscriber_presence),
                );
                subscriber_presence.spawn_maintenance();
                println!("🚌 Bus subscriber and presence sweeper started");
            })
        }));

    Ok(build)
}
