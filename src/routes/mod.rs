mod auth;
mod health_check;

pub use auth::get_current_user;
pub use auth::login;
pub use auth::refresh;
pub use auth::register;
pub use auth::revoke;
pub use health_check::health_check;
