//! Opcodes and CDB builders for the engine's internal commands.
//!
//! Only the handful of six-byte commands the engine issues on its own
//! behalf (autosense and LUN discovery probes) live here; user commands
//! arrive with their CDB already built.

/// TEST UNIT READY.
pub const OP_TEST_UNIT_READY: u8 = 0x00;
/// REQUEST SENSE.
pub const OP_REQUEST_SENSE: u8 = 0x03;
/// INQUIRY.
pub const OP_INQUIRY: u8 = 0x12;
/// MODE SENSE (6).
pub const OP_MODE_SENSE: u8 = 0x1A;
/// START STOP UNIT.
pub const OP_START_UNIT: u8 = 0x1B;

/// Length of the sense data the engine requests.
pub const SENSE_LEN: u8 = 18;
/// Length of the standard INQUIRY data the engine requests.
pub const INQUIRY_LEN: u8 = 36;
/// Control mode page, carrying the queue-algorithm flags.
pub const PAGE_CONTROL_MODE: u8 = 0x0A;
/// Allocation length for the MODE SENSE probe.
pub const MODE_SENSE_LEN: u8 = 24;

/// REQUEST SENSE with an 18-byte allocation.
#[must_use]
pub fn request_sense() -> [u8; 6] {
    [OP_REQUEST_SENSE, 0, 0, 0, SENSE_LEN, 0]
}

/// Standard INQUIRY, 36 bytes.
#[must_use]
pub fn inquiry() -> [u8; 6] {
    [OP_INQUIRY, 0, 0, 0, INQUIRY_LEN, 0]
}

/// MODE SENSE (6) for the control mode page.
#[must_use]
pub fn mode_sense_control() -> [u8; 6] {
    [OP_MODE_SENSE, 0, PAGE_CONTROL_MODE, 0, MODE_SENSE_LEN, 0]
}

/// START UNIT with the immediate bit clear.
#[must_use]
pub fn start_unit() -> [u8; 6] {
    [OP_START_UNIT, 0, 0, 0, 0x01, 0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_use_their_opcode() {
        assert_eq!(request_sense()[0], OP_REQUEST_SENSE);
        assert_eq!(inquiry()[0], OP_INQUIRY);
        assert_eq!(mode_sense_control()[0], OP_MODE_SENSE);
        assert_eq!(start_unit()[0], OP_START_UNIT);
    }

    #[test]
    fn mode_sense_asks_for_control_page() {
        assert_eq!(mode_sense_control()[2], PAGE_CONTROL_MODE);
    }

    #[test]
    fn start_unit_sets_start_bit() {
        assert_eq!(start_unit()[4] & 0x01, 0x01);
    }
}
