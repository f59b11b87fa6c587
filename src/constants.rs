//! Protocol, topology and timing constants for the overlay.
//!
//! The timing values are defaults; the running daemon takes them from the
//! `[timing]` section of its configuration.

/// Wire protocol constants
pub mod protocol {
    /// The only packet version this node speaks
    pub const VERSION: u16 = 1;

    /// Fixed header: version(2) type(2) length(4) ip(8) port(4)
    pub const HEADER_LEN: usize = 20;

    /// Reply the transport expects for every delivered frame
    pub const ACK_TOKEN: &[u8; 3] = b"ACK";

    /// Frames larger than this are refused by the transport (64 KiB)
    pub const MAX_FRAME_SIZE: usize = 64 * 1024;

    /// Reunion entry count is written with two decimal digits
    pub const MAX_REUNION_ENTRIES: usize = 99;
}

/// Overlay tree shape
pub mod topology {
    /// Deepest level a node may occupy; the root is level 0
    pub const MAX_DEPTH: u8 = 8;

    /// Degree limit for every node, root included
    pub const MAX_CHILDREN: usize = 2;
}

/// Default intervals and timeouts
pub mod timing {
    /// Main state-machine tick
    pub const TICK_INTERVAL_MS: u64 = 2_000;

    /// ReunionScheduler period
    pub const REUNION_INTERVAL_SECS: u64 = 4;

    /// Root expires a node whose last heartbeat is older than this
    pub const ROOT_HEARTBEAT_TIMEOUT_SECS: u64 = 24;

    /// Leaf declares failure when hello and hello-back drift further apart than this
    pub const PEER_PENDING_TIMEOUT_SECS: u64 = 36;

    /// Upper bound for a single connect/write/ACK exchange
    pub const SEND_TIMEOUT_SECS: u64 = 5;
}
