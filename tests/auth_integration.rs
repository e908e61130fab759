use std::net::TcpListener;

use serde_json::{json, Value};
use sqlx::{Connection, Executor, PgConnection, PgPool, Row};

use carelog_auth::configuration::{get_configuration, DatabaseSettings};
use carelog_auth::identity::seed_roles;
use carelog_auth::startup::run;

pub struct TestApp {
    pub address: String,
    pub db_pool: PgPool,
}

async fn spawn_app() -> TestApp {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind random port");
    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    let mut configuration = get_configuration().expect("Failed to read configuration.");
    configuration.database.database_name = uuid::Uuid::new_v4().to_string();
    let connection_pool = configure_database(&configuration.database).await;

    let server = run(listener, connection_pool.clone(), configuration.auth)
        .expect("Failed to start test server");
    let _ = tokio::spawn(server);

    TestApp {
        address,
        db_pool: connection_pool,
    }
}

pub async fn configure_database(config: &DatabaseSettings) -> PgPool {
    let mut connection = PgConnection::connect(&config.connection_string_without_db())
        .await
        .expect("Failed to connect to Postgres");
    connection
        .execute(&*format!(r#"CREATE DATABASE "{}";"#, config.database_name))
        .await
        .expect("Failed to create database.");

    let connection_pool = PgPool::connect(&config.connection_string())
        .await
        .expect("Failed to connect to Postgres.");
    sqlx::migrate!("./migrations")
        .run(&connection_pool)
        .await
        .expect("Failed to migrate the database.");
    seed_roles(&connection_pool)
        .await
        .expect("Failed to seed roles.");

    connection_pool
}

async fn register(app: &TestApp, email: &str, password: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(&format!("{}/auth/register", &app.address))
        .json(&json!({
            "email": email,
            "password": password,
            "first_name": "Ada",
            "last_name": "Lovelace"
        }))
        .send()
        .await
        .expect("Failed to execute request.")
}

async fn refresh(app: &TestApp, refresh_token: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(&format!("{}/auth/refresh", &app.address))
        .json(&json!({ "refresh_token": refresh_token }))
        .send()
        .await
        .expect("Failed to execute request.")
}

// --- Health check ---

#[tokio::test]
async fn health_check_works() {
    let app = spawn_app().await;

    let response = reqwest::Client::new()
        .get(&format!("{}/health_check", &app.address))
        .send()
        .await
        .expect("Failed to execute request.");

    assert!(response.status().is_success());
}

// --- Registration ---

#[tokio::test]
async fn register_returns_201_with_a_token_pair() {
    let app = spawn_app().await;

    let response = register(&app, "a@x.com", "Secret123").await;
    assert_eq!(201, response.status().as_u16());

    let body: Value = response.json().await.expect("Failed to parse response");
    assert!(body.get("token").is_some());
    assert!(body.get("refresh_token").is_some());
    assert!(body.get("expires_at").is_some());
    assert_eq!(body["user"]["email"], "a@x.com");
    assert_eq!(body["user"]["first_name"], "Ada");
    assert_eq!(body["user"]["roles"], json!(["User"]));

    let user = sqlx::query("SELECT email, first_name FROM users WHERE email = 'a@x.com'")
        .fetch_one(&app.db_pool)
        .await
        .expect("Failed to fetch created user");
    assert_eq!(user.get::<String, _>("email"), "a@x.com");
    assert_eq!(user.get::<String, _>("first_name"), "Ada");
}

#[tokio::test]
async fn register_returns_400_for_invalid_email() {
    let app = spawn_app().await;

    for invalid_email in ["notanemail", "user@", "@example.com", "user@@example.com"] {
        let response = register(&app, invalid_email, "Secret123").await;
        assert_eq!(
            400,
            response.status().as_u16(),
            "Should reject invalid email: {}",
            invalid_email
        );
    }
}

#[tokio::test]
async fn register_returns_400_for_weak_password() {
    let app = spawn_app().await;

    let long_password = format!("Aa1{}", "a".repeat(126));
    let weak_passwords = [
        ("short", "password too short"),
        ("nouppercase123", "no uppercase"),
        ("NOLOWERCASE123", "no lowercase"),
        ("NoDigitsHere", "no digits"),
        (long_password.as_str(), "password too long"),
    ];

    for (weak_password, reason) in weak_passwords {
        let response = register(&app, "a@x.com", weak_password).await;
        assert_eq!(
            400,
            response.status().as_u16(),
            "Should reject weak password: {}",
            reason
        );
    }
}

#[tokio::test]
async fn register_returns_409_for_duplicate_email() {
    let app = spawn_app().await;

    assert_eq!(201, register(&app, "a@x.com", "Secret123").await.status().as_u16());

    let response = register(&app, "a@x.com", "Secret123").await;
    assert_eq!(409, response.status().as_u16());

    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["code"], "DUPLICATE_IDENTITY");
}

#[tokio::test]
async fn register_returns_400_for_missing_fields() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();

    let test_cases = [
        (json!({"email": "a@x.com", "password": "Secret123"}), "missing names"),
        (
            json!({"password": "Secret123", "first_name": "Ada", "last_name": "Lovelace"}),
            "missing email",
        ),
        (json!({}), "missing all fields"),
    ];

    for (body, reason) in test_cases {
        let response = client
            .post(&format!("{}/auth/register", &app.address))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request.");

        assert_eq!(400, response.status().as_u16(), "Should reject request: {}", reason);
    }
}

// --- Login ---

#[tokio::test]
async fn login_returns_200_for_valid_credentials() {
    let app = spawn_app().await;
    register(&app, "a@x.com", "Secret123").await;

    let response = reqwest::Client::new()
        .post(&format!("{}/auth/login", &app.address))
        .json(&json!({"email": "a@x.com", "password": "Secret123"}))
        .send()
        .await
        .expect("Failed to execute request.");

    assert_eq!(200, response.status().as_u16());

    let body: Value = response.json().await.expect("Failed to parse response");
    assert!(body.get("token").is_some());
    assert!(body.get("refresh_token").is_some());
    assert_eq!(body["user"]["email"], "a@x.com");
}

#[tokio::test]
async fn login_failures_share_status_and_body() {
    let app = spawn_app().await;
    register(&app, "a@x.com", "Secret123").await;
    let client = reqwest::Client::new();

    let wrong_password = client
        .post(&format!("{}/auth/login", &app.address))
        .json(&json!({"email": "a@x.com", "password": "WrongSecret123"}))
        .send()
        .await
        .expect("Failed to execute request.");
    let unknown_email = client
        .post(&format!("{}/auth/login", &app.address))
        .json(&json!({"email": "nobody@x.com", "password": "Secret123"}))
        .send()
        .await
        .expect("Failed to execute request.");

    assert_eq!(401, wrong_password.status().as_u16());
    assert_eq!(401, unknown_email.status().as_u16());

    // Neither response may reveal which check failed.
    let a: Value = wrong_password.json().await.expect("Failed to parse response");
    let b: Value = unknown_email.json().await.expect("Failed to parse response");
    assert_eq!(a["code"], b["code"]);
    assert_eq!(a["message"], b["message"]);
}

// --- Refresh ---

#[tokio::test]
async fn refresh_rotates_the_token_chain() {
    let app = spawn_app().await;

    let body: Value = register(&app, "a@x.com", "Secret123")
        .await
        .json()
        .await
        .expect("Failed to parse response");
    let t0 = body["refresh_token"].as_str().unwrap().to_string();

    // T0 -> T1
    let response = refresh(&app, &t0).await;
    assert_eq!(200, response.status().as_u16());
    let body: Value = response.json().await.expect("Failed to parse response");
    let t1 = body["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(t0, t1, "Refresh must rotate the token");

    // T0 is consumed.
    assert_eq!(401, refresh(&app, &t0).await.status().as_u16());

    // The chain continues from T1.
    let response = refresh(&app, &t1).await;
    assert_eq!(200, response.status().as_u16());

    // Exactly one row of the chain is still live.
    let live = sqlx::query(
        "SELECT COUNT(*) AS n FROM refresh_tokens WHERE revoked = FALSE AND expires_at > now()",
    )
    .fetch_one(&app.db_pool)
    .await
    .expect("Failed to count tokens");
    assert_eq!(live.get::<i64, _>("n"), 1);
}

#[tokio::test]
async fn refresh_returns_401_for_unknown_token() {
    let app = spawn_app().await;

    let response = refresh(&app, "definitely-not-a-valid-token").await;
    assert_eq!(401, response.status().as_u16());

    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["code"], "INVALID_CREDENTIALS");
}

#[tokio::test]
async fn refresh_returns_401_for_expired_token() {
    let app = spawn_app().await;

    let body: Value = register(&app, "a@x.com", "Secret123")
        .await
        .json()
        .await
        .expect("Failed to parse response");
    let token = body["refresh_token"].as_str().unwrap();

    sqlx::query("UPDATE refresh_tokens SET expires_at = now() - interval '1 day' WHERE token = $1")
        .bind(token)
        .execute(&app.db_pool)
        .await
        .expect("Failed to expire token");

    assert_eq!(401, refresh(&app, token).await.status().as_u16());
}

#[tokio::test]
async fn refresh_reflects_role_changes_since_login() {
    let app = spawn_app().await;

    let body: Value = register(&app, "a@x.com", "Secret123")
        .await
        .json()
        .await
        .expect("Failed to parse response");
    let token = body["refresh_token"].as_str().unwrap().to_string();
    let user_id = uuid::Uuid::parse_str(body["user"]["id"].as_str().unwrap()).unwrap();

    sqlx::query(
        "INSERT INTO user_roles (user_id, role_id) SELECT $1, id FROM roles WHERE name = 'Admin'",
    )
    .bind(user_id)
    .execute(&app.db_pool)
    .await
    .expect("Failed to grant role");

    let body: Value = refresh(&app, &token)
        .await
        .json()
        .await
        .expect("Failed to parse response");
    let roles = body["user"]["roles"].as_array().unwrap();
    assert!(roles.contains(&json!("Admin")));
    assert!(roles.contains(&json!("User")));
}

#[tokio::test]
async fn each_login_opens_an_independent_chain() {
    let app = spawn_app().await;

    let registered: Value = register(&app, "a@x.com", "Secret123")
        .await
        .json()
        .await
        .expect("Failed to parse response");
    let registration_token = registered["refresh_token"].as_str().unwrap().to_string();

    let login: Value = reqwest::Client::new()
        .post(&format!("{}/auth/login", &app.address))
        .json(&json!({"email": "a@x.com", "password": "Secret123"}))
        .send()
        .await
        .expect("Failed to execute request.")
        .json()
        .await
        .expect("Failed to parse response");
    let login_token = login["refresh_token"].as_str().unwrap().to_string();

    assert_ne!(registration_token, login_token);
    // The earlier chain survives the later login.
    assert_eq!(200, refresh(&app, &registration_token).await.status().as_u16());
    assert_eq!(200, refresh(&app, &login_token).await.status().as_u16());
}

// --- Revoke ---

#[tokio::test]
async fn revoke_invalidates_the_chain_and_is_idempotent() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();

    let body: Value = register(&app, "a@x.com", "Secret123")
        .await
        .json()
        .await
        .expect("Failed to parse response");
    let token = body["refresh_token"].as_str().unwrap().to_string();

    let response = client
        .post(&format!("{}/auth/revoke", &app.address))
        .json(&json!({ "refresh_token": token }))
        .send()
        .await
        .expect("Failed to execute request.");
    assert_eq!(200, response.status().as_u16());
    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["revoked"], true);

    // Second revocation reports no change.
    let body: Value = client
        .post(&format!("{}/auth/revoke", &app.address))
        .json(&json!({ "refresh_token": token }))
        .send()
        .await
        .expect("Failed to execute request.")
        .json()
        .await
        .expect("Failed to parse response");
    assert_eq!(body["revoked"], false);

    assert_eq!(401, refresh(&app, &token).await.status().as_u16());
}

#[tokio::test]
async fn revoking_an_unknown_token_reports_no_change() {
    let app = spawn_app().await;

    let body: Value = reqwest::Client::new()
        .post(&format!("{}/auth/revoke", &app.address))
        .json(&json!({ "refresh_token": "never-issued" }))
        .send()
        .await
        .expect("Failed to execute request.")
        .json()
        .await
        .expect("Failed to parse response");

    assert_eq!(body["revoked"], false);
}

// --- Protected routes ---

#[tokio::test]
async fn me_returns_401_without_token() {
    let app = spawn_app().await;

    let response = reqwest::Client::new()
        .get(&format!("{}/auth/me", &app.address))
        .send()
        .await
        .expect("Failed to execute request.");

    assert_eq!(401, response.status().as_u16());
    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn me_returns_401_with_invalid_token() {
    let app = spawn_app().await;

    let response = reqwest::Client::new()
        .get(&format!("{}/auth/me", &app.address))
        .header("Authorization", "Bearer invalid.token.here")
        .send()
        .await
        .expect("Failed to execute request.");

    assert_eq!(401, response.status().as_u16());
    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["code"], "TOKEN_INVALID");
}

#[tokio::test]
async fn me_returns_the_principal_from_the_token_alone() {
    let app = spawn_app().await;

    let body: Value = register(&app, "a@x.com", "Secret123")
        .await
        .json()
        .await
        .expect("Failed to parse response");
    let access_token = body["token"].as_str().unwrap();

    let response = reqwest::Client::new()
        .get(&format!("{}/auth/me", &app.address))
        .header("Authorization", format!("Bearer {}", access_token))
        .send()
        .await
        .expect("Failed to execute request.");

    assert_eq!(200, response.status().as_u16());
    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["email"], "a@x.com");
    assert_eq!(body["first_name"], "Ada");
    assert_eq!(body["roles"], json!(["User"]));
}

#[tokio::test]
async fn me_rejects_malformed_authorization_headers() {
    let app = spawn_app().await;
    let client = reqwest::Client::new();

    for header in ["Bearer", "Basic dXNlcjpwYXNz", "BearerToken", ""] {
        let response = client
            .get(&format!("{}/auth/me", &app.address))
            .header("Authorization", header)
            .send()
            .await
            .expect("Failed to execute request.");

        assert_eq!(
            401,
            response.status().as_u16(),
            "Should reject malformed header: {}",
            header
        );
    }
}
