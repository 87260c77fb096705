//! SCSI message byte values and the message-in parse table.
//!
//! Message bytes are fixed by the SCSI-2 standard; the length of a message
//! is determined entirely by its first byte (and, for extended messages,
//! the declared length in the second byte). The engine never interprets a
//! message until it is complete.

/// COMMAND COMPLETE.
pub const M_COMPLETE: u8 = 0x00;
/// EXTENDED MESSAGE prefix.
pub const M_EXTENDED: u8 = 0x01;
/// SAVE DATA POINTER.
pub const M_SAVE_DP: u8 = 0x02;
/// RESTORE POINTERS.
pub const M_RESTORE_DP: u8 = 0x03;
/// DISCONNECT.
pub const M_DISCONNECT: u8 = 0x04;
/// INITIATOR DETECTED ERROR.
pub const M_ID_ERROR: u8 = 0x05;
/// ABORT.
pub const M_ABORT: u8 = 0x06;
/// MESSAGE REJECT.
pub const M_REJECT: u8 = 0x07;
/// NO OPERATION.
pub const M_NOOP: u8 = 0x08;
/// MESSAGE PARITY ERROR.
pub const M_PARITY: u8 = 0x09;
/// LINKED COMMAND COMPLETE.
pub const M_LCOMPLETE: u8 = 0x0A;
/// LINKED COMMAND COMPLETE WITH FLAG.
pub const M_LCOMPLETE_F: u8 = 0x0B;
/// BUS DEVICE RESET.
pub const M_RESET: u8 = 0x0C;
/// ABORT TAG.
pub const M_ABORT_TAG: u8 = 0x0D;
/// CLEAR QUEUE.
pub const M_CLEAR_QUEUE: u8 = 0x0E;
/// TERMINATE I/O PROCESS.
pub const M_TERMINATE: u8 = 0x11;
/// SIMPLE QUEUE TAG.
pub const M_SIMPLE_TAG: u8 = 0x20;
/// HEAD OF QUEUE TAG.
pub const M_HEAD_TAG: u8 = 0x21;
/// ORDERED QUEUE TAG.
pub const M_ORDERED_TAG: u8 = 0x22;
/// IGNORE WIDE RESIDUE.
pub const M_IGN_RESIDUE: u8 = 0x23;
/// IDENTIFY base value; bit 6 grants disconnect privilege, bits 0-2 the LUN.
pub const M_IDENTIFY: u8 = 0x80;

/// Extended message sub-code: MODIFY DATA POINTER.
pub const MX_MODIFY_DP: u8 = 0x00;
/// Extended message sub-code: synchronous data transfer request.
pub const MX_SYNC: u8 = 0x01;
/// Extended message sub-code: wide data transfer request.
pub const MX_WIDE: u8 = 0x03;

/// Builds an IDENTIFY message byte.
#[must_use]
pub fn identify(lun: u8, allow_disconnect: bool) -> u8 {
    M_IDENTIFY | (u8::from(allow_disconnect) << 6) | (lun & 0x07)
}

/// Total length of a message given its first byte(s).
///
/// Returns `None` when more bytes are needed to know the length (an
/// extended message whose declared-length byte has not arrived yet).
#[must_use]
pub fn expected_len(buf: &[u8]) -> Option<usize> {
    let first = buf[0];
    match first {
        M_EXTENDED => {
            // 0x01, n, code, n-1 argument bytes. n == 0 means 256, which
            // no message we speak uses; treat it as a 2-byte runt.
            let n = *buf.get(1)?;
            Some(2 + n.max(1) as usize)
        }
        0x20..=0x2F => Some(2),
        _ => Some(1),
    }
}

/// A fully received message-in, decoded for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedMsg {
    /// Command complete; status has been received, bus free follows.
    CommandComplete,
    /// Linked command complete (with or without flag).
    LinkedComplete,
    /// Save the current data pointer.
    SaveDataPointer,
    /// Restore the current data pointer from the saved one.
    RestorePointers,
    /// Target will disconnect; bus free follows.
    Disconnect,
    /// The last message-out we sent was rejected.
    MessageReject,
    /// No operation.
    NoOp,
    /// Message parity error reported by the target.
    MessageParityError,
    /// Identify: LUN nexus (re)establishment.
    Identify {
        /// Logical unit number carried in the low bits.
        lun: u8,
    },
    /// A queue tag message; picks a disconnected command by tag.
    QueueTag {
        /// The tag value from the second byte.
        tag: u8,
    },
    /// Synchronous transfer request or answer.
    Sdtr {
        /// Transfer period factor.
        period: u8,
        /// REQ/ACK offset; zero means asynchronous.
        offset: u8,
    },
    /// Wide transfer request or answer.
    Wdtr {
        /// Transfer width exponent (0 = 8 bit, 1 = 16 bit).
        width: u8,
    },
    /// The target over-read on a wide bus; rewind one or more bytes.
    IgnoreWideResidue {
        /// Number of residue bytes to rewind.
        residue: u8,
    },
    /// Signed adjustment of the current data pointer.
    ModifyDataPointer {
        /// Two's-complement byte offset.
        delta: i32,
    },
    /// Anything we do not speak; answered with MESSAGE REJECT.
    Unsupported(u8),
}

/// Decodes a complete message.
///
/// `buf` must hold exactly the bytes of one message, complete per
/// [`expected_len`].
#[must_use]
pub fn parse(buf: &[u8]) -> ParsedMsg {
    match buf[0] {
        M_COMPLETE => ParsedMsg::CommandComplete,
        M_LCOMPLETE | M_LCOMPLETE_F => ParsedMsg::LinkedComplete,
        M_SAVE_DP => ParsedMsg::SaveDataPointer,
        M_RESTORE_DP => ParsedMsg::RestorePointers,
        M_DISCONNECT => ParsedMsg::Disconnect,
        M_REJECT => ParsedMsg::MessageReject,
        M_NOOP => ParsedMsg::NoOp,
        M_PARITY => ParsedMsg::MessageParityError,
        M_SIMPLE_TAG | M_HEAD_TAG | M_ORDERED_TAG => ParsedMsg::QueueTag { tag: buf[1] },
        M_IGN_RESIDUE => ParsedMsg::IgnoreWideResidue { residue: buf[1] },
        M_EXTENDED => parse_extended(buf),
        b if b & M_IDENTIFY != 0 => ParsedMsg::Identify { lun: b & 0x07 },
        b => ParsedMsg::Unsupported(b),
    }
}

fn parse_extended(buf: &[u8]) -> ParsedMsg {
    match (buf.get(2), buf.len()) {
        (Some(&MX_SYNC), 5) => ParsedMsg::Sdtr {
            period: buf[3],
            offset: buf[4],
        },
        (Some(&MX_WIDE), 4) => ParsedMsg::Wdtr { width: buf[3] },
        (Some(&MX_MODIFY_DP), 7) => {
            let delta = i32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);
            ParsedMsg::ModifyDataPointer { delta }
        }
        _ => ParsedMsg::Unsupported(M_EXTENDED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_messages_are_one_byte() {
        assert_eq!(expected_len(&[M_COMPLETE]), Some(1));
        assert_eq!(expected_len(&[M_DISCONNECT]), Some(1));
        assert_eq!(expected_len(&[M_IDENTIFY | 3]), Some(1));
    }

    #[test]
    fn two_byte_messages() {
        assert_eq!(expected_len(&[M_SIMPLE_TAG]), Some(2));
        assert_eq!(expected_len(&[M_IGN_RESIDUE]), Some(2));
        assert_eq!(expected_len(&[M_ORDERED_TAG, 7]), Some(2));
    }

    #[test]
    fn extended_length_needs_second_byte() {
        assert_eq!(expected_len(&[M_EXTENDED]), None);
        assert_eq!(expected_len(&[M_EXTENDED, 3]), Some(5));
        assert_eq!(expected_len(&[M_EXTENDED, 2]), Some(4));
    }

    #[test]
    fn parse_sdtr() {
        let m = parse(&[M_EXTENDED, 3, MX_SYNC, 25, 8]);
        assert_eq!(
            m,
            ParsedMsg::Sdtr {
                period: 25,
                offset: 8
            }
        );
    }

    #[test]
    fn parse_wdtr() {
        assert_eq!(parse(&[M_EXTENDED, 2, MX_WIDE, 1]), ParsedMsg::Wdtr { width: 1 });
    }

    #[test]
    fn parse_modify_data_pointer_negative() {
        let m = parse(&[M_EXTENDED, 5, MX_MODIFY_DP, 0xFF, 0xFF, 0xFF, 0xF8]);
        assert_eq!(m, ParsedMsg::ModifyDataPointer { delta: -8 });
    }

    #[test]
    fn parse_identify_extracts_lun() {
        assert_eq!(parse(&[identify(5, true)]), ParsedMsg::Identify { lun: 5 });
        assert_eq!(parse(&[identify(2, false)]), ParsedMsg::Identify { lun: 2 });
    }

    #[test]
    fn parse_tag_messages() {
        assert_eq!(parse(&[M_SIMPLE_TAG, 11]), ParsedMsg::QueueTag { tag: 11 });
        assert_eq!(parse(&[M_HEAD_TAG, 0]), ParsedMsg::QueueTag { tag: 0 });
    }

    #[test]
    fn unknown_messages_are_flagged() {
        assert_eq!(parse(&[0x13]), ParsedMsg::Unsupported(0x13));
        assert_eq!(
            parse(&[M_EXTENDED, 2, 0x42, 0]),
            ParsedMsg::Unsupported(M_EXTENDED)
        );
    }
}
