//! Event names emitted in the `event` field of log records.

pub const LIFECYCLE_STARTED: &str = "lifecycle_started";
pub const LIFECYCLE_START_FAILED: &str = "lifecycle_start_failed";
pub const LIFECYCLE_STOPPED: &str = "lifecycle_stopped";

pub const SESSION_OPEN: &str = "session_open";
pub const SESSION_REJECTED: &str = "session_rejected";
pub const SESSION_CLOSED: &str = "session_closed";
pub const SESSION_IO_ERROR: &str = "session_io_error";
pub const SESSION_FORCE_CLOSED: &str = "session_force_closed";
pub const SESSION_WRITE_STALLED: &str = "session_write_stalled";
pub const SESSION_ABORTED: &str = "session_aborted";

pub const SUBMIT_ACCEPTED: &str = "submit_accepted";
pub const SUBMIT_REJECTED: &str = "submit_rejected";
pub const SUBMIT_DUPLICATE: &str = "submit_duplicate";

pub const DISPATCH_SEND_OK: &str = "dispatch_send_ok";
pub const DISPATCH_SEND_FAILED: &str = "dispatch_send_failed";
pub const DISPATCH_NO_CONSUMER: &str = "dispatch_no_consumer";

pub const ACK_RECEIVED: &str = "ack_received";
pub const ACK_IGNORED: &str = "ack_ignored";

pub const RETRY_TIMEOUT: &str = "retry_timeout";
pub const RETRY_STALE: &str = "retry_stale";
pub const REQUEUE_SESSION_CLOSED: &str = "requeue_session_closed";

pub const DELIVERY_FAILED: &str = "delivery_failed";
pub const DELIVERY_FAILED_UNREPORTED: &str = "delivery_failed_unreported";

pub const RETENTION_EVICT: &str = "retention_evict";

pub const DRAIN_TICK: &str = "drain_tick";
pub const DRAIN_COMPLETE: &str = "drain_complete";
pub const DRAIN_TIMEOUT: &str = "drain_timeout";
