use std::str::FromStr;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::model::Role;

/// Cleartext verification against the shared deployment password. The
/// login user doubles as the actor role, so a user outside the closed
/// role set is turned away here, before it can issue a single command.
#[derive(Debug)]
pub struct TrialDeskAuthSource {
    password: String,
}

impl TrialDeskAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for TrialDeskAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if Role::from_str(user).is_err() {
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("unknown role: {user} (expected teacher|sales|admin|supervisor)"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
