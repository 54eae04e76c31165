//! Per-channel bridging between the attacker-facing session and the
//! backend sandbox session.
//!
//! One bridge task runs per channel pair. It selects over two sources:
//! operations arriving from the server side (data and out-of-band requests
//! relayed by the connection handler) and [`ChannelMsg`]s arriving from the
//! backend channel. Backend data flows to the attacker through the session
//! tap; an `exit-status` from the backend is relayed and terminates the
//! bridge; a closed op channel means the server side is gone and ends the
//! bridge without touching it again.

use log::{debug, trace};
use russh::client::Msg;
use russh::server::Handle;
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Pty};
use tokio::sync::mpsc;

use crate::capture::SessionTap;

/// Server-side traffic relayed into a bridge: raw data plus the typed
/// out-of-band requests the inbound handler receives.
#[derive(Debug)]
pub enum ChannelOp {
    Data(Vec<u8>),
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
    Env(String, String),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Eof,
}

/// Runs one channel bridge to completion.
pub async fn run(
    server: Handle,
    channel_id: ChannelId,
    mut backend: Channel<Msg>,
    mut ops: mpsc::Receiver<ChannelOp>,
    mut tap: SessionTap,
) {
    debug!("bridge up for channel {}", channel_id);

    loop {
        tokio::select! {
            msg = backend.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        tap.record(&data).await;
                        if server
                            .data(channel_id, CryptoVec::from_slice(&data))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        tap.record(&data).await;
                        if server
                            .extended_data(channel_id, ext, CryptoVec::from_slice(&data))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        let _ = server.eof(channel_id).await;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!(
                            "backend channel exited with status {}, closing bridge",
                            exit_status
                        );
                        let _ = server.exit_status_request(channel_id, exit_status).await;
                        let _ = server.eof(channel_id).await;
                        let _ = server.close(channel_id).await;
                        break;
                    }
                    Some(ChannelMsg::Close) | None => {
                        let _ = server.close(channel_id).await;
                        break;
                    }
                    Some(other) => {
                        trace!("bridge ignoring backend message: {:?}", other);
                    }
                }
            }
            op = ops.recv() => {
                match op {
                    Some(op) => {
                        if forward_op(&backend, op).await.is_err() {
                            let _ = server.close(channel_id).await;
                            break;
                        }
                    }
                    // Server side dropped its sender: the attacker's
                    // channel is gone, wind the backend down.
                    None => {
                        let _ = backend.eof().await;
                        let _ = backend.close().await;
                        break;
                    }
                }
            }
        }
    }

    debug!("bridge down for channel {}", channel_id);
}

async fn forward_op(backend: &Channel<Msg>, op: ChannelOp) -> Result<(), russh::Error> {
    match op {
        ChannelOp::Data(data) => backend.data(&data[..]).await,
        ChannelOp::Pty {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        } => {
            backend
                .request_pty(
                    false,
                    &term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    &modes,
                )
                .await
        }
        ChannelOp::Shell => backend.request_shell(false).await,
        ChannelOp::Exec(command) => backend.exec(false, &command[..]).await,
        ChannelOp::Subsystem(name) => backend.request_subsystem(false, &name).await,
        ChannelOp::Env(name, value) => backend.set_env(false, &name, &value).await,
        ChannelOp::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            backend
                .window_change(col_width, row_height, pix_width, pix_height)
                .await
        }
        ChannelOp::Eof => backend.eof().await,
    }
}
