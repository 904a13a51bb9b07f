//! Protocol constants for the Zigbee OTA Upgrade cluster.
//!
//! Derived from the ZCL OTA Upgrade cluster specification (cluster 0x0019).

// ============================================================================
// Cluster
// ============================================================================

/// OTA Upgrade cluster ID (`genOta`).
pub const OTA_CLUSTER_ID: u16 = 0x0019;

// ============================================================================
// Image file format
// ============================================================================

/// Upgrade file identifier, first four bytes of every OTA file (0x0BEEF11E LE).
pub const UPGRADE_FILE_IDENTIFIER: [u8; 4] = [0x1E, 0xF1, 0xEE, 0x0B];

/// Size of the header up to and including `totalImageSize`.
pub const FIXED_HEADER_SIZE: usize = 56;

/// Length of the `headerString` text field.
pub const HEADER_STRING_LEN: usize = 32;

/// Length of the `upgradeFileDestination` field (an IEEE address).
pub const UPGRADE_FILE_DESTINATION_LEN: usize = 8;

/// Sub-element header: tag (u16) + length (u32).
pub const SUB_ELEMENT_HEADER_SIZE: usize = 6;

/// Field control bits.
pub const FIELD_CONTROL_SECURITY_CREDENTIAL: u16 = 0x0001;
pub const FIELD_CONTROL_DEVICE_SPECIFIC: u16 = 0x0002;
pub const FIELD_CONTROL_HARDWARE_VERSIONS: u16 = 0x0004;

/// Query next image request field control: hardware version present.
pub const QUERY_FIELD_CONTROL_HARDWARE_VERSION: u8 = 0x01;

/// Well-known sub-element tags.
pub mod tags {
    pub const UPGRADE_IMAGE: u16 = 0x0000;
    pub const ECDSA_SIGNATURE: u16 = 0x0001;
    pub const ECDSA_SIGNING_CERTIFICATE: u16 = 0x0002;
    pub const IMAGE_INTEGRITY_CODE: u16 = 0x0003;
}

// ============================================================================
// Command payload constants
// ============================================================================

/// `imageNotify` payload type: query jitter only.
pub const IMAGE_NOTIFY_PAYLOAD_TYPE_JITTER: u8 = 0;

/// `imageNotify` query jitter (1..=100; 100 means every device must respond).
pub const IMAGE_NOTIFY_QUERY_JITTER: u8 = 100;

/// `upgradeEndResponse` current time: 0 means "now".
pub const UPGRADE_END_CURRENT_TIME: u32 = 0;

/// `upgradeEndResponse` upgrade time, relative to current time.
pub const UPGRADE_END_UPGRADE_TIME: u32 = 1;

/// Command id of `upgradeEndRequest`, referenced by its default response.
pub const UPGRADE_END_REQUEST_ID: u8 = 0x06;

// ============================================================================
// Block sizes
// ============================================================================

/// Block size cap for devices without a known limit. Larger blocks make
/// many devices unstable.
pub const DEFAULT_MAXIMUM_DATA_SIZE: u8 = 50;

/// Insta devices only complete transfers with blocks of 40 bytes or less.
pub const INSTA_MANUFACTURER_CODE: u16 = 0x117A;
pub const INSTA_MAXIMUM_DATA_SIZE: u8 = 40;

/// Newer Legrand firmware needs blocks of up to 64 bytes; no cap applies.
pub const LEGRAND_MANUFACTURER_CODE: u16 = 0x1021;

// ============================================================================
// Timing (milliseconds)
// ============================================================================

/// Deadline for the device to answer the initial `imageNotify`.
pub const INITIAL_QUERY_TIMEOUT_MS: u64 = 10_000;

/// Deadline for each `imageBlockRequest` during a transfer.
pub const BLOCK_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Upper bound for long-poll waiters (largest 32-bit signed millisecond timer).
pub const LONG_POLL_TIMEOUT_MS: u64 = 2_147_483_647;

/// Minimum spacing between consecutive `imageBlockResponse` transmissions.
pub const BLOCK_RESPONSE_PACING_MS: u64 = 250;

/// Minimum spacing between progress reports.
pub const PROGRESS_INTERVAL_MS: u64 = 30_000;

/// Wait after `upgradeEndResponse` while the device reboots.
pub const REBOOT_GRACE_MS: u64 = 30_000;
