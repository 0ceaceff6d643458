use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// One shared password for every wire client. Booking identities
/// (requester, actor, admin flag) travel in the statements, so the login
/// user is not checked.
#[derive(Debug)]
pub struct BookdAuthSource {
    secret: Vec<u8>,
}

impl BookdAuthSource {
    pub fn new(password: String) -> Self {
        Self {
            secret: password.into_bytes(),
        }
    }
}

#[async_trait]
impl AuthSource for BookdAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.secret.clone()))
    }
}
