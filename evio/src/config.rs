// cspell:words nodelay

// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Per-loop tuning knobs.

/// Configuration applied when a loop is created.
///
/// The defaults reproduce the runtime's classic behavior; construct with
/// struct-update syntax to override selectively:
///
/// ```
/// use evio::LoopConfig;
/// let config = LoopConfig { max_events: 128, ..LoopConfig::default() };
/// ```
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Capacity of one demux wait batch.
    pub max_events: usize,
    /// Buffers retained per size class in the loop's buffer pool.
    pub pool_retain: usize,
    /// `TCP_NODELAY` on accepted and connected sockets.
    pub nodelay: bool,
    /// Explicit `SO_RCVBUF` for accepted/connected sockets; `None` leaves
    /// the kernel default in place.
    pub socket_recv_buffer_size: Option<usize>,
    /// Explicit `SO_SNDBUF`; `None` leaves the kernel default in place.
    pub socket_send_buffer_size: Option<usize>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_events: 64,
            pool_retain: 32,
            nodelay: true,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
        }
    }
}
