use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// One cleartext password shared by every user name.
#[derive(Debug)]
pub struct GatehouseAuthSource {
    password: String,
}

impl GatehouseAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for GatehouseAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(user = ?login.user(), "password login");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
