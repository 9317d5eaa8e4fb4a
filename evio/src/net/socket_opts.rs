// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words sockopt nodelay keepidle RCVBUF SNDBUF

//! Socket option helpers shared by the listener and connector.

use crate::config::LoopConfig;
use crate::error::Result;
use rustix::net::sockopt;
use std::os::fd::AsFd;
use std::time::Duration;

/// Applies the loop's socket policy to a fresh TCP socket: nodelay plus
/// any explicitly configured buffer sizes. Kernel defaults stay untouched
/// when no size is configured.
pub(crate) fn configure_tcp(fd: &impl AsFd, config: &LoopConfig) -> Result<()> {
    if config.nodelay {
        sockopt::set_tcp_nodelay(fd, true)?;
    }
    if let Some(size) = config.socket_recv_buffer_size {
        sockopt::set_socket_recv_buffer_size(fd, size)?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        sockopt::set_socket_send_buffer_size(fd, size)?;
    }
    Ok(())
}

/// TCP keepalive with an idle delay before the first probe.
pub fn set_keepalive(fd: &impl AsFd, enable: bool, delay_secs: u64) -> Result<()> {
    sockopt::set_socket_keepalive(fd, enable)?;
    if enable {
        sockopt::set_tcp_keepidle(fd, Duration::from_secs(delay_secs.max(1)))?;
    }
    Ok(())
}
