/*! Error types.

Two separate notions of "error" run through this crate, and spec §7
("Error Handling Design") keeps them deliberately distinct:

* [`ReturnCode`] is *data*: the terminal status of a `parse()` call, a TLV
  sub-loop, or a pipeline stage. It is carried by return value, never by
  panic, and user callbacks produce it too (negative values are reserved for
  user-op errors and propagated unchanged).
* [`Error`] is a genuine Rust error for things that are bugs or environment
  failures rather than expected packet-shaped outcomes: a malformed graph
  caught at construction time, PVbuf allocator exhaustion, or a pipeline
  invariant violation.
*/

/// Crate-wide result alias for genuine (non-wire) errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by graph construction, PVbuf management, and the
/// accelerator pipeline scheduler.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A parse graph failed validation (e.g. for [`crate::fastpath`]).
    #[error("invalid parse graph: {0}")]
    InvalidGraph(String),

    /// PVbuf allocator could not satisfy a request.
    #[error("pvbuf allocation failed: {0}")]
    Alloc(String),

    /// A PVbuf-tree invariant was violated. Indicates a bug, not a runtime
    /// packet condition.
    #[error("pvbuf invariant violated: {0}")]
    PvbufInvariant(String),

    /// A pipeline stage produced output in excess of available buffer
    /// space, or otherwise violated the stage contract.
    #[error("pipeline stage {stage} violated its contract: {msg}")]
    PipelineContract {
        /// Index of the offending stage.
        stage: usize,
        /// What went wrong.
        msg: String,
    },
}

/// Terminal status codes returned by the parser engine (spec §4.1, §6.6).
///
/// `OKAY` is the only non-terminal code: it means "continue", and is what a
/// user op returns to signal success. Every other value is terminal.
/// Negative values are reserved for user-op errors and are propagated to
/// the caller unchanged, so `ReturnCode` wraps a plain `i32` rather than
/// being a closed enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReturnCode(pub i32);

impl ReturnCode {
    /// Continue parsing. Not a terminal status.
    pub const OKAY: ReturnCode = ReturnCode(0);
    /// Terminal success: a leaf node (or `ZERO_LEN_OK` exhaustion) was
    /// reached cleanly.
    pub const STOP_OKAY: ReturnCode = ReturnCode(1);
    /// A user handler signalled failure.
    pub const STOP_FAIL: ReturnCode = ReturnCode(2);
    /// Not enough bytes for the declared minimum or exact header length.
    pub const STOP_LENGTH: ReturnCode = ReturnCode(3);
    /// No table match and no wildcard for the next protocol.
    pub const STOP_UNKNOWN_PROTO: ReturnCode = ReturnCode(4);
    /// `encaps > max_encaps`.
    pub const STOP_ENCAP_DEPTH: ReturnCode = ReturnCode(5);
    /// `nodes_left` reached zero.
    pub const STOP_MAX_NODES: ReturnCode = ReturnCode(6);
    /// TLV count exceeded `max_tlvs`.
    pub const STOP_OPTION_LIMIT: ReturnCode = ReturnCode(7);
    /// TLV length out of range (zero, below `min_len`, or past the end of
    /// the enclosing header).
    pub const STOP_TLV_LENGTH: ReturnCode = ReturnCode(8);

    /// True for `OKAY`, the one non-terminal value.
    #[must_use]
    pub fn is_okay_continue(self) -> bool {
        self == Self::OKAY
    }

    /// True for any of the two success codes (`OKAY` or `STOP_OKAY`), the
    /// set that routes to `okay_node` rather than `fail_node` on exit
    /// (spec §4.1 "Exit hook").
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::OKAY || self == Self::STOP_OKAY
    }

    /// True for negative codes, which are reserved for user-op errors.
    #[must_use]
    pub fn is_user_error(self) -> bool {
        self.0 < 0
    }
}

impl std::fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::OKAY => "OKAY",
            Self::STOP_OKAY => "STOP_OKAY",
            Self::STOP_FAIL => "STOP_FAIL",
            Self::STOP_LENGTH => "STOP_LENGTH",
            Self::STOP_UNKNOWN_PROTO => "STOP_UNKNOWN_PROTO",
            Self::STOP_ENCAP_DEPTH => "STOP_ENCAP_DEPTH",
            Self::STOP_MAX_NODES => "STOP_MAX_NODES",
            Self::STOP_OPTION_LIMIT => "STOP_OPTION_LIMIT",
            Self::STOP_TLV_LENGTH => "STOP_TLV_LENGTH",
            _ if self.0 < 0 => return write!(f, "USER_ERROR({})", self.0),
            _ => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}

impl From<i32> for ReturnCode {
    fn from(v: i32) -> Self {
        ReturnCode(v)
    }
}
