use config::ConfigError;

#[derive(serde::Deserialize, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub application: ApplicationSettings,
    pub auth: AuthSettings,
}

#[derive(serde::Deserialize, Clone)]
pub struct ApplicationSettings {
    pub port: u16,
}

#[derive(serde::Deserialize, Clone)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: String,
    pub port: u16,
    pub host: String,
    pub database_name: String,
}

impl DatabaseSettings {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database_name
        )
    }

    pub fn connection_string_without_db(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}",
            self.username, self.password, self.host, self.port
        )
    }
}

/// Signing key material and token lifetimes.
///
/// `key` must be non-empty; `AccessTokenIssuer::new` refuses to start
/// without it.
#[derive(serde::Deserialize, Clone)]
pub struct AuthSettings {
    pub key: String,
    pub issuer: String,
    pub audience: String,
    #[serde(default = "default_access_token_expiration_minutes")]
    pub access_token_expiration_minutes: i64,
    #[serde(default = "default_refresh_token_expiration_days")]
    pub refresh_token_expiration_days: i64,
}

fn default_access_token_expiration_minutes() -> i64 {
    60
}

fn default_refresh_token_expiration_days() -> i64 {
    7
}

impl AuthSettings {
    pub fn access_token_lifetime(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.access_token_expiration_minutes)
    }

    pub fn refresh_token_lifetime(&self) -> chrono::Duration {
        chrono::Duration::days(self.refresh_token_expiration_days)
    }
}

pub fn get_configuration() -> Result<Settings, ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("configuration").required(false))
        .build()?;
    settings.try_deserialize::<Settings>()
}
