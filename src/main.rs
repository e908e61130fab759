use std::net::TcpListener;

use sqlx::postgres::PgPoolOptions;

use carelog_auth::configuration::get_configuration;
use carelog_auth::identity::seed_roles;
use carelog_auth::startup::run;
use carelog_auth::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_telemetry();

    tracing::info!("Starting credential service");

    let configuration = match get_configuration() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to read configuration: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "configuration error",
            ));
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&configuration.database.connection_string())
        .await
        .map_err(|e| {
            tracing::error!("Failed to create connection pool: {}", e);
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "database connection error")
        })?;

    if let Err(e) = seed_roles(&pool).await {
        tracing::error!("Failed to seed roles: {}", e);
        return Err(std::io::Error::new(std::io::ErrorKind::Other, "role seeding error"));
    }

    let address = format!("127.0.0.1:{}", configuration.application.port);
    let listener = TcpListener::bind(&address)?;
    tracing::info!("Listening on {}", address);

    let server = run(listener, pool, configuration.auth).map_err(|e| {
        tracing::error!("Failed to start server: {}", e);
        std::io::Error::new(std::io::ErrorKind::Other, "startup error")
    })?;

    server.await
}
