//! # System Constants
//!
//! Event names, correlation attribute names and protocol defaults shared by the
//! orchestrator and the shadow reconciler.

/// Event names published on the orchestration event channel
pub mod events {
    pub const COMMAND_SUBMITTED: &str = "command.submitted";
    pub const COMMAND_SENDING: &str = "command.sending";
    pub const COMMAND_DELIVERED: &str = "command.delivered";
    pub const COMMAND_STAGE_TIMED_OUT: &str = "command.stage_timed_out";
    pub const COMMAND_STAGE_TRANSITION: &str = "command.stage_transition";
    pub const COMMAND_COMPLETE: &str = "command.complete";
}

/// Attribute names used in correlation keys
pub mod correlation {
    pub const STAGE: &str = "stage";
    pub const SUBMISSION_ID: &str = "submissionId";
    pub const MESSAGE_ID: &str = "messageId";
    pub const MOBILE_ID: &str = "mobileId";
    pub const CODEC_SERVICE_ID: &str = "codecServiceId";
    pub const CODEC_MESSAGE_ID: &str = "codecMessageId";

    pub const STAGE_SUBMISSION: &str = "submission";
    pub const STAGE_DELIVERY: &str = "delivery";
    pub const STAGE_RESPONSE: &str = "response";

    /// Attribute values that mark a key as malformed
    pub const INVALID_MARKERS: &[&str] = &["", "undefined", "null", "invalid"];
}

/// Satellite network forward message states
pub mod forward_states {
    pub const DELIVERED: &str = "DELIVERED";
    pub const ERROR: &str = "ERROR";
    pub const FAILED_DELIVERY: &str = "FAILED_DELIVERY";
    pub const TIMED_OUT: &str = "TIMED_OUT";

    pub const SUCCESS_STATES: &[&str] = &[DELIVERED];
    pub const FAILED_STATES: &[&str] = &[ERROR, FAILED_DELIVERY, TIMED_OUT];
}

/// Default timing values, overridable through configuration
pub mod defaults {
    pub const SENDING_TIMEOUT_SECONDS: u64 = 300;
    pub const DELIVERY_TIMEOUT_SECONDS: u64 = 600;
    pub const RESPONSE_TIMEOUT_SECONDS: u64 = 900;

    pub const DELIVERY_GRACE_SECONDS: u64 = 120;
    pub const DELIVERY_GRACE_INCREMENT_SECONDS: u64 = 60;
    pub const DELIVERY_SIZE_THRESHOLD_BYTES: usize = 100;
    pub const DELIVERY_SIZE_BLOCK_BYTES: usize = 1000;

    pub const INSTANCE_MAX_AGE_SECONDS: u64 = 86_400;
    pub const INSTANCE_RETENTION_SECONDS: u64 = 30 * 86_400;
    pub const CLEANUP_SWEEP_INTERVAL_SECONDS: u64 = 300;

    pub const MAILBOX_CAPACITY: usize = 16;
    pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

    pub const DEVICE_ID_FORMAT: &str = "idp-${mobileId}";
    pub const DEFAULT_DEVICE_MODEL: &str = "idpDefault";
}

/// Prefix for deterministic orchestration instance ids
pub const INSTANCE_ID_PREFIX: &str = "otaCommand";

/// Ack descriptions written to the device shadow
pub mod ack_descriptions {
    pub const PENDING_OTA_WRITE: &str = "pending OTA write";
    pub const COMPLETED: &str = "completed";
    pub const PRESUMED_CLOSED: &str = "presumed closed independently";
    pub const RESPONSE_MISSING: &str = "delivered; response not received";
    pub const DEFAULT: &str = "default";
}
