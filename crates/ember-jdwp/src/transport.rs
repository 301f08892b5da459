//! Transport variants for the debugger connection.
//!
//! `dt_socket` speaks plain TCP to the debugger, either listening
//! (`server=y`, bound once at init) or dialing out. `dt_android_adb` dials
//! the local debug-bridge broker, which proxies debugger traffic to us; the
//! broker owns the listening side, so both the accept and establish roles
//! dial. The bridge muxing protocol itself lives in the bridge, not here.

use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;

use nix::poll::PollTimeout;

use crate::net::{NetShared, NetState, PollOutcome};
use crate::options::{JdwpOptions, JdwpTransport};
use crate::{JdwpError, Result};

/// Loopback control port of the on-device debug bridge.
pub(crate) const TUNNEL_PORT: u16 = 8700;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to sit between dial attempts while waiting for the bridge.
const TUNNEL_RETRY_MS: u16 = 1000;

pub(crate) enum Transport {
    Socket { listener: Option<TcpListener> },
    HostTunnel,
}

/// Construct the net state for `options`, binding the listen socket up front
/// in server mode so bring-up failures surface before the worker spawns.
pub(crate) fn init(options: &JdwpOptions, shared: &Arc<NetShared>) -> Result<NetState> {
    let transport = match options.transport {
        JdwpTransport::Socket => {
            if options.server {
                let listener =
                    TcpListener::bind((Ipv4Addr::UNSPECIFIED, options.port)).map_err(|err| {
                        tracing::error!(
                            target = "ember.jdwp",
                            port = options.port,
                            error = %err,
                            "failed to bind JDWP listen socket"
                        );
                        JdwpError::Transport(format!(
                            "failed to bind port {}: {err}",
                            options.port
                        ))
                    })?;
                let addr = listener.local_addr()?;
                tracing::info!(target = "ember.jdwp", %addr, "awaiting debugger");
                shared.set_listen_addr(addr);
                Transport::Socket {
                    listener: Some(listener),
                }
            } else {
                Transport::Socket { listener: None }
            }
        }
        JdwpTransport::HostTunnel => Transport::HostTunnel,
        JdwpTransport::Unknown | JdwpTransport::None => {
            return Err(JdwpError::Transport("no transport configured".to_owned()));
        }
    };
    NetState::new(Arc::clone(shared), transport)
}

fn connect_socket(host: &str, port: u16) -> io::Result<TcpStream> {
    let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(ErrorKind::InvalidInput, "unable to resolve JDWP address")
    })?;
    TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
}

impl NetState {
    /// Block until a debugger connects (or the wake pipe trips). Returns
    /// false on shutdown or a fatal listen-socket failure.
    pub(crate) fn accept(&mut self) -> bool {
        loop {
            let stream = match &self.transport {
                Transport::Socket {
                    listener: Some(listener),
                } => {
                    match self.wait_readable(listener.as_fd(), PollTimeout::NONE) {
                        PollOutcome::Ready => {}
                        PollOutcome::Woken => {
                            tracing::debug!(
                                target = "ember.jdwp",
                                "woken while awaiting a debugger"
                            );
                            return false;
                        }
                        PollOutcome::TimedOut | PollOutcome::Failed => return false,
                    }
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            tracing::info!(target = "ember.jdwp", %peer, "debugger connected");
                            stream
                        }
                        Err(err)
                            if err.kind() == ErrorKind::Interrupted
                                || err.kind() == ErrorKind::WouldBlock =>
                        {
                            continue
                        }
                        Err(err) => {
                            tracing::error!(target = "ember.jdwp", error = %err, "accept failed");
                            return false;
                        }
                    }
                }
                Transport::Socket { listener: None } => {
                    tracing::error!(target = "ember.jdwp", "accept without a listen socket");
                    return false;
                }
                Transport::HostTunnel => match self.dial_tunnel_until_woken() {
                    Some(stream) => stream,
                    None => return false,
                },
            };
            self.on_connected(stream);
            return true;
        }
    }

    /// Dial out to the debugger. Returns false on failure; the caller reports
    /// the failed attach.
    pub(crate) fn establish(&mut self, options: &JdwpOptions) -> bool {
        let stream = match &self.transport {
            Transport::Socket { .. } => {
                tracing::info!(
                    target = "ember.jdwp",
                    host = %options.host,
                    port = options.port,
                    "connecting out to debugger"
                );
                match connect_socket(&options.host, options.port) {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::error!(
                            target = "ember.jdwp",
                            host = %options.host,
                            port = options.port,
                            error = %err,
                            "unable to connect to debugger"
                        );
                        return false;
                    }
                }
            }
            Transport::HostTunnel => {
                let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, TUNNEL_PORT));
                match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::error!(
                            target = "ember.jdwp",
                            %addr,
                            error = %err,
                            "unable to reach the debug bridge"
                        );
                        return false;
                    }
                }
            }
        };
        self.on_connected(stream);
        true
    }

    /// Keep dialing the bridge until it answers or shutdown wakes us.
    fn dial_tunnel_until_woken(&self) -> Option<TcpStream> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, TUNNEL_PORT));
        let mut reported = false;
        loop {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    tracing::info!(target = "ember.jdwp", %addr, "connected to the debug bridge");
                    return Some(stream);
                }
                Err(err) => {
                    if !reported {
                        tracing::warn!(
                            target = "ember.jdwp",
                            %addr,
                            error = %err,
                            "debug bridge not ready, retrying"
                        );
                        reported = true;
                    }
                }
            }
            match self.wait_wake(PollTimeout::from(TUNNEL_RETRY_MS)) {
                PollOutcome::TimedOut => continue,
                _ => return None,
            }
        }
    }
}
