//! The SSH man-in-the-middle.
//!
//! Terminates inbound SSH with the honeypot's host key, drives admission
//! through the credential tracker, and — once a session is admitted —
//! opens a matching SSH session against the assigned sandbox and bridges
//! channels and requests in both directions, tapping everything the
//! sandbox sends toward the attacker.

pub mod backend;
pub mod bridge;
pub mod server;

pub use server::{serve_connection, ProxyContext, ProxyHandler};
