//! Outbound SSH client against a sandbox.

use std::sync::Arc;

use log::debug;
use russh::client::{self, AuthResult};

use crate::error_handling::types::SessionError;

/// Client handler for backend sessions. Accepts every host key: sandboxes
/// are created fresh and their keys are never pinned.
pub struct BackendHandler;

impl client::Handler for BackendHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub type BackendHandle = client::Handle<BackendHandler>;

/// Dials the sandbox's sshd and authenticates with the fixed credentials.
pub async fn dial(
    addr: &str,
    username: &str,
    password: &str,
) -> Result<BackendHandle, SessionError> {
    let config = Arc::new(client::Config::default());

    let mut handle = client::connect(config, addr, BackendHandler)
        .await
        .map_err(|e| SessionError::BackendDialFailed(e.to_string()))?;

    debug!("backend TCP established to {}", addr);

    let auth = handle
        .authenticate_password(username, password)
        .await
        .map_err(|e| SessionError::BackendDialFailed(e.to_string()))?;

    match auth {
        AuthResult::Success => Ok(handle),
        AuthResult::Failure { .. } => Err(SessionError::BackendDialFailed(format!(
            "sandbox at {} rejected the configured credentials",
            addr
        ))),
    }
}
