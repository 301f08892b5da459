//! Debug-launch option string parsing.
//!
//! The runtime receives a single comma-separated `name=value` option string
//! (`transport=dt_socket,address=8000,server=y,suspend=n`) from its launch
//! flags. Parsing validates the combination and produces the immutable
//! [`JdwpOptions`] record the session controller is created from.

use crate::{JdwpError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JdwpTransport {
    Unknown,
    None,
    /// TCP stream socket (`dt_socket`).
    Socket,
    /// Local debug-bridge tunnel (`dt_android_adb`).
    HostTunnel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JdwpOptions {
    pub transport: JdwpTransport,
    pub server: bool,
    pub suspend: bool,
    /// Debugger host to dial. Empty in server mode.
    pub host: String,
    pub port: u16,
}

impl Default for JdwpOptions {
    fn default() -> Self {
        Self {
            transport: JdwpTransport::None,
            server: false,
            suspend: false,
            host: String::new(),
            port: 0,
        }
    }
}

fn parse_jdwp_option(name: &str, value: &str, options: &mut JdwpOptions) -> Result<()> {
    match name {
        "transport" => match value {
            "dt_socket" => options.transport = JdwpTransport::Socket,
            "dt_android_adb" => options.transport = JdwpTransport::HostTunnel,
            _ => {
                options.transport = JdwpTransport::Unknown;
                tracing::error!(target = "ember.jdwp", value, "JDWP transport not supported");
                return Err(JdwpError::InvalidOptions(format!(
                    "transport not supported: {value}"
                )));
            }
        },
        "server" => match value {
            "y" => options.server = true,
            "n" => options.server = false,
            _ => {
                tracing::error!(target = "ember.jdwp", "JDWP option 'server' must be 'y' or 'n'");
                return Err(JdwpError::InvalidOptions(
                    "option 'server' must be 'y' or 'n'".to_owned(),
                ));
            }
        },
        "suspend" => match value {
            "y" => options.suspend = true,
            "n" => options.suspend = false,
            _ => {
                tracing::error!(target = "ember.jdwp", "JDWP option 'suspend' must be 'y' or 'n'");
                return Err(JdwpError::InvalidOptions(
                    "option 'suspend' must be 'y' or 'n'".to_owned(),
                ));
            }
        },
        "address" => {
            // Either <port> or <host>:<port>.
            options.host.clear();
            let port_str = match value.split_once(':') {
                Some((host, port)) => {
                    options.host = host.to_owned();
                    port
                }
                None => value,
            };
            if port_str.is_empty() {
                tracing::error!(target = "ember.jdwp", value, "JDWP address missing port");
                return Err(JdwpError::InvalidOptions(format!(
                    "address missing port: {value}"
                )));
            }
            let port: u32 = port_str.parse().map_err(|_| {
                tracing::error!(target = "ember.jdwp", value, "JDWP address has junk in port field");
                JdwpError::InvalidOptions(format!("address has junk in port field: {value}"))
            })?;
            if port > 0xffff {
                tracing::error!(target = "ember.jdwp", value, "JDWP address has junk in port field");
                return Err(JdwpError::InvalidOptions(format!(
                    "address has junk in port field: {value}"
                )));
            }
            options.port = port as u16;
        }
        "launch" | "onthrow" | "oncaught" | "timeout" => {
            // Valid but unsupported.
            tracing::info!(target = "ember.jdwp", name, value, "ignoring JDWP option");
        }
        _ => {
            tracing::info!(target = "ember.jdwp", name, value, "ignoring unrecognized JDWP option");
        }
    }
    Ok(())
}

/// Parse a debug-launch option string into a validated [`JdwpOptions`].
pub fn parse_jdwp_options(options: &str) -> Result<JdwpOptions> {
    tracing::debug!(target = "ember.jdwp", options, "parsing JDWP options");

    if options == "help" {
        tracing::error!(
            target = "ember.jdwp",
            "Example: -XjdwpOptions:transport=dt_socket,address=8000,server=y\n\
             Example: -Xrunjdwp:transport=dt_socket,address=8000,server=y\n\
             Example: -Xrunjdwp:transport=dt_socket,address=localhost:6500,server=n"
        );
        return Err(JdwpError::Usage);
    }

    let mut parsed = JdwpOptions::default();
    for pair in options.split(',') {
        let Some((name, value)) = pair.split_once('=') else {
            tracing::error!(target = "ember.jdwp", pair, options, "cannot parse JDWP option");
            return Err(JdwpError::InvalidOptions(format!(
                "cannot parse option '{pair}' in '{options}'"
            )));
        };
        parse_jdwp_option(name, value, &mut parsed)?;
    }

    if parsed.transport == JdwpTransport::Unknown {
        tracing::error!(target = "ember.jdwp", options, "must specify JDWP transport");
        return Err(JdwpError::InvalidOptions(format!(
            "must specify transport: {options}"
        )));
    }
    #[cfg(target_os = "android")]
    {
        if parsed.transport == JdwpTransport::None {
            parsed.transport = JdwpTransport::HostTunnel;
            tracing::warn!(
                target = "ember.jdwp",
                "no JDWP transport specified, defaulting to dt_android_adb"
            );
        }
    }
    if !parsed.server && (parsed.host.is_empty() || parsed.port == 0) {
        tracing::error!(
            target = "ember.jdwp",
            options,
            "must specify JDWP host and port when server=n"
        );
        return Err(JdwpError::InvalidOptions(format!(
            "must specify host and port when server=n: {options}"
        )));
    }

    Ok(parsed)
}
