//! Per-connection handler and per-channel tasks

use std::net::SocketAddr;
use std::sync::Arc;

use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, Pty};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::dispatch;

/// Accepted username/password pair
#[derive(Debug)]
pub(crate) struct Login {
    pub username: String,
    pub password: String,
}

/// Handler for one accepted connection
pub(crate) struct ConnectionHandler {
    peer: SocketAddr,
    login: Arc<Login>,
    cancel: CancellationToken,
}

impl ConnectionHandler {
    pub(crate) fn new(peer: SocketAddr, login: Arc<Login>, cancel: CancellationToken) -> Self {
        Self {
            peer,
            login,
            cancel,
        }
    }
}

impl server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        // plain comparison; test server only
        if user == self.login.username && password == self.login.password {
            info!(peer = %self.peer, user = %user, "password accepted");
            Ok(Auth::Accept)
        } else {
            warn!(peer = %self.peer, user = %user, "password rejected");
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.cancel.is_cancelled() {
            debug!(peer = %self.peer, "refusing channel, server is stopping");
            return Ok(false);
        }

        debug!(peer = %self.peer, channel = ?channel.id(), "session channel opened");
        tokio::spawn(serve_channel(channel, self.peer));
        Ok(true)
    }

    // The requests below are also delivered to the channel task; these hooks
    // only send the reply the client asked for.

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }
}

async fn serve_channel(mut channel: Channel<Msg>, peer: SocketAddr) {
    let id = channel.id();
    if let Err(e) = run_channel(&mut channel).await {
        warn!(peer = %peer, channel = ?id, error = %e, "channel task failed");
    }
    debug!(peer = %peer, channel = ?id, "channel task finished");
}

/// Dispatch channel requests by type until the channel ends
async fn run_channel(channel: &mut Channel<Msg>) -> Result<(), russh::Error> {
    // Some once a shell was requested; holds a partial input line
    let mut shell: Option<Vec<u8>> = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::RequestPty {
                term,
                col_width,
                row_height,
                ..
            } => {
                debug!(term = %term, cols = col_width, rows = row_height, "pty requested");
            }
            ChannelMsg::WindowChange {
                col_width,
                row_height,
                ..
            } => {
                debug!(cols = col_width, rows = row_height, "window changed");
            }
            ChannelMsg::Exec { command, .. } => {
                let line = String::from_utf8_lossy(&command);
                debug!(command = %line, "exec");
                let reply = dispatch(&line);
                channel.data(reply.output.as_bytes()).await?;
                return finish(channel, reply.status).await;
            }
            ChannelMsg::RequestShell { .. } => {
                debug!("shell requested");
                shell = Some(Vec::new());
            }
            ChannelMsg::Data { data } => {
                let Some(pending) = shell.as_mut() else {
                    continue;
                };
                pending.extend_from_slice(&data);

                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let reply = dispatch(&String::from_utf8_lossy(&line));
                    channel.data(reply.output.as_bytes()).await?;
                    if reply.closes_channel {
                        return finish(channel, reply.status).await;
                    }
                }
            }
            ChannelMsg::Eof => {
                let Some(pending) = shell.take() else {
                    continue;
                };
                // unterminated last line
                if !pending.iter().all(u8::is_ascii_whitespace) {
                    let reply = dispatch(&String::from_utf8_lossy(&pending));
                    channel.data(reply.output.as_bytes()).await?;
                }
                return finish(channel, 0).await;
            }
            _ => {}
        }
    }

    Ok(())
}

async fn finish(channel: &Channel<Msg>, status: u32) -> Result<(), russh::Error> {
    channel.exit_status(status).await?;
    channel.eof().await?;
    channel.close().await
}
