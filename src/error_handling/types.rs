//! Per-subsystem error enums.
//!
//! Transient external failures (geolocation, Tor list) are swallowed at the
//! call site and never surface here; these types cover the failures the
//! caller has to act on.

use std::fmt;

/// Failures talking to the container runtime.
#[derive(Debug)]
pub enum ContainerError {
    RuntimeUnavailable(String),
    CreationFailed(String),
    StartFailed(String),
    InspectFailed(String),
    /// The runtime exposes no dialable address for the container's SSH port.
    AddressUnavailable(String),
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerError::RuntimeUnavailable(msg) => {
                write!(f, "container runtime is not available: {}", msg)
            }
            ContainerError::CreationFailed(msg) => write!(f, "container creation failed: {}", msg),
            ContainerError::StartFailed(msg) => write!(f, "container start failed: {}", msg),
            ContainerError::InspectFailed(msg) => write!(f, "container inspect failed: {}", msg),
            ContainerError::AddressUnavailable(id) => {
                write!(f, "no reachable SSH address for container {}", id)
            }
        }
    }
}

impl std::error::Error for ContainerError {}

/// Failures in the audit store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    ConnectionFailed,
    WriteFailed,
    ReadFailed,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ConnectionFailed => write!(f, "audit store connection failed"),
            StorageError::WriteFailed => write!(f, "audit store write failed"),
            StorageError::ReadFailed => write!(f, "audit store read failed"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Failures while setting up or running an admitted session.
#[derive(Debug)]
pub enum SessionError {
    /// The pool is draining; no sandbox will become available.
    PoolClosed,
    Container(ContainerError),
    Storage(StorageError),
    BackendDialFailed(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::PoolClosed => write!(f, "sandbox pool is shut down"),
            SessionError::Container(e) => write!(f, "sandbox unavailable: {}", e),
            SessionError::Storage(e) => write!(f, "audit failure: {}", e),
            SessionError::BackendDialFailed(msg) => {
                write!(f, "backend SSH dial failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ContainerError> for SessionError {
    fn from(err: ContainerError) -> Self {
        SessionError::Container(err)
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::Storage(err)
    }
}

/// Startup failures. Everything here is fatal: without the host key, the
/// audit store, the container runtime, or the listener there is nothing to
/// serve.
#[derive(Debug)]
pub enum SupervisorError {
    HostKey(String),
    Storage(StorageError),
    Container(ContainerError),
    Bind(std::io::Error),
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::HostKey(msg) => write!(f, "host key unusable: {}", msg),
            SupervisorError::Storage(e) => write!(f, "audit store unavailable: {}", e),
            SupervisorError::Container(e) => write!(f, "container runtime unavailable: {}", e),
            SupervisorError::Bind(e) => write!(f, "listener bind failed: {}", e),
        }
    }
}

impl std::error::Error for SupervisorError {}

impl From<StorageError> for SupervisorError {
    fn from(err: StorageError) -> Self {
        SupervisorError::Storage(err)
    }
}

impl From<ContainerError> for SupervisorError {
    fn from(err: ContainerError) -> Self {
        SupervisorError::Container(err)
    }
}

/// Error type of the inbound SSH handler; must absorb protocol errors.
#[derive(Debug)]
pub enum ProxyError {
    Ssh(russh::Error),
    Session(SessionError),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Ssh(e) => write!(f, "ssh protocol error: {}", e),
            ProxyError::Session(e) => write!(f, "session error: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<russh::Error> for ProxyError {
    fn from(err: russh::Error) -> Self {
        ProxyError::Ssh(err)
    }
}

impl From<SessionError> for ProxyError {
    fn from(err: SessionError) -> Self {
        ProxyError::Session(err)
    }
}
