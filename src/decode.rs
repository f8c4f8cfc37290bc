//! Pure HCI frame decoding.
//!
//! `decode_command` and `decode_event` are the only two entry points; both
//! take a raw byte slice and return a tagged [`Command`] or [`Event`],
//! falling back to the `Ignore` variant for anything the state machine does
//! not need to react to, including frames too short to hold the fields being
//! extracted. Neither function panics on malformed input — a hostile or
//! buggy HCI peer must never be able to crash the analyzer.

use crate::hci::common::{AclMode, BdAddr, ConnectionHandle, LinkType};
use crate::hci::opcodes::{self, event_code};

macro_rules! make_u16 {
    ($packet:ident, $start:expr) => {
        u16::from_le_bytes([$packet[$start], $packet[$start + 1]])
    };
}

/// "Chews" `$size` bytes off the front of `$packet`, advancing it past them.
macro_rules! chew {
    ($packet:ident, $size:expr) => {{
        let chewed = &$packet[..$size];
        $packet = &$packet[$size..];
        chewed
    }};
}

macro_rules! chew_u16 {
    ($packet:ident) => {{
        let chewed = make_u16!($packet, 0);
        $packet = &$packet[2..];
        chewed
    }};
}

macro_rules! chew_baddr {
    ($packet:ident) => {{
        let mut wire = [0u8; 6];
        wire.copy_from_slice(&$packet[..6]);
        $packet = &$packet[6..];
        BdAddr::from_wire_bytes(wire)
    }};
}

macro_rules! chew_handle {
    ($packet:ident) => {{
        ConnectionHandle::from_wire(chew_u16!($packet))
    }};
}

/// A decoded outgoing HCI command, reduced to the fields the activity state
/// machine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Inquiry,
    InquiryCancel,
    ExitPeriodicInquiry,
    Reset,
    PeriodicInquiry {
        min_period_slots: u16,
        inquiry_length_slots: u16,
    },
    CreateConnection {
        addr: BdAddr,
    },
    AddScoConnection {
        acl_handle: ConnectionHandle,
    },
    RemoteNameRequest {
        addr: BdAddr,
    },
    WritePageTimeout {
        page_timeout_slots: u16,
    },
    ReadPageTimeout,
    SetupSynchronousConnection {
        handle: ConnectionHandle,
    },
    /// Any command the core does not need to react to, or one whose frame
    /// was too short to extract the fields above.
    Ignore,
}

/// A decoded incoming HCI event, reduced to the fields the activity state
/// machine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    InquiryComplete,
    ConnectionComplete {
        status: u8,
        handle: ConnectionHandle,
        addr: BdAddr,
        link_type: LinkType,
    },
    ConnectionRequest {
        addr: BdAddr,
        link_type: LinkType,
    },
    /// Status is intentionally not carried: disconnect completion is acted
    /// on regardless of the reported status (see the crate's error handling
    /// notes on non-success disconnects).
    DisconnectionComplete {
        handle: ConnectionHandle,
    },
    RemoteNameRequestComplete {
        addr: BdAddr,
    },
    ReadPageTimeoutComplete {
        status: u8,
        page_timeout_slots: u16,
    },
    RoleChange {
        status: u8,
        addr: BdAddr,
    },
    ModeChange {
        status: u8,
        handle: ConnectionHandle,
        mode: AclMode,
    },
    PinCodeRequest {
        addr: BdAddr,
    },
    LinkKeyRequest {
        addr: BdAddr,
    },
    SyncConnectionComplete {
        status: u8,
        handle: ConnectionHandle,
        addr: BdAddr,
        link_type: LinkType,
        tx_interval: u8,
        retrans_window: u8,
    },
    SyncConnectionChanged {
        status: u8,
        handle: ConnectionHandle,
        tx_interval: u8,
        retrans_window: u8,
    },
    /// Any event the core does not need to react to (including
    /// `Command_Complete` for any opcode other than `Read_Page_Timeout`, and
    /// `Number_Of_Completed_Packets`), or one whose frame was too short.
    Ignore,
}

/// Decode one outgoing HCI command frame: 2-byte little-endian opcode,
/// 1-byte parameter length, then parameters.
pub fn decode_command(bytes: &[u8]) -> Command {
    if bytes.len() < 3 {
        return Command::Ignore;
    }

    let opcode = make_u16!(bytes, 0);
    let mut params = &bytes[3..];

    match opcode {
        op if op == opcodes::INQUIRY.raw() => Command::Inquiry,
        op if op == opcodes::INQUIRY_CANCEL.raw() => Command::InquiryCancel,
        op if op == opcodes::EXIT_PERIODIC_INQUIRY_MODE.raw() => Command::ExitPeriodicInquiry,
        op if op == opcodes::RESET.raw() => Command::Reset,
        op if op == opcodes::PERIODIC_INQUIRY_MODE.raw() => {
            if params.len() < 9 {
                return Command::Ignore;
            }
            let _max_period = chew_u16!(params);
            let min_period_slots = chew_u16!(params);
            let _lap = chew!(params, 3);
            let inquiry_length_slots = chew!(params, 1)[0] as u16;
            Command::PeriodicInquiry {
                min_period_slots,
                inquiry_length_slots,
            }
        }
        op if op == opcodes::CREATE_CONNECTION.raw() => {
            if params.len() < 6 {
                return Command::Ignore;
            }
            Command::CreateConnection {
                addr: chew_baddr!(params),
            }
        }
        op if op == opcodes::ADD_SCO_CONNECTION.raw() => {
            if params.len() < 2 {
                return Command::Ignore;
            }
            Command::AddScoConnection {
                acl_handle: chew_handle!(params),
            }
        }
        op if op == opcodes::REMOTE_NAME_REQUEST.raw() => {
            if params.len() < 6 {
                return Command::Ignore;
            }
            Command::RemoteNameRequest {
                addr: chew_baddr!(params),
            }
        }
        op if op == opcodes::WRITE_PAGE_TIMEOUT.raw() => {
            if params.len() < 2 {
                return Command::Ignore;
            }
            Command::WritePageTimeout {
                page_timeout_slots: chew_u16!(params),
            }
        }
        op if op == opcodes::READ_PAGE_TIMEOUT.raw() => Command::ReadPageTimeout,
        op if op == opcodes::SETUP_SYNCHRONOUS_CONNECTION.raw() => {
            if params.len() < 2 {
                return Command::Ignore;
            }
            Command::SetupSynchronousConnection {
                handle: chew_handle!(params),
            }
        }
        _ => Command::Ignore,
    }
}

/// Decode one incoming HCI event frame: 1-byte event code, 1-byte parameter
/// length, then parameters.
pub fn decode_event(bytes: &[u8]) -> Event {
    if bytes.len() < 2 {
        return Event::Ignore;
    }

    let code = bytes[0];
    let mut params = &bytes[2..];

    match code {
        event_code::INQUIRY_COMPLETE => Event::InquiryComplete,
        event_code::CONNECTION_COMPLETE => {
            if params.len() < 10 {
                return Event::Ignore;
            }
            let status = chew!(params, 1)[0];
            let handle = chew_handle!(params);
            let addr = chew_baddr!(params);
            let link_type = LinkType::from_wire(chew!(params, 1)[0]);
            Event::ConnectionComplete {
                status,
                handle,
                addr,
                link_type,
            }
        }
        event_code::CONNECTION_REQUEST => {
            if params.len() < 10 {
                return Event::Ignore;
            }
            let addr = chew_baddr!(params);
            let _class_of_device = chew!(params, 3);
            let link_type = LinkType::from_wire(chew!(params, 1)[0]);
            Event::ConnectionRequest { addr, link_type }
        }
        event_code::DISCONNECTION_COMPLETE => {
            if params.len() < 3 {
                return Event::Ignore;
            }
            let _status = chew!(params, 1)[0];
            let handle = chew_handle!(params);
            Event::DisconnectionComplete { handle }
        }
        event_code::REMOTE_NAME_REQUEST_COMPLETE => {
            if params.len() < 7 {
                return Event::Ignore;
            }
            let _status = chew!(params, 1)[0];
            let addr = chew_baddr!(params);
            Event::RemoteNameRequestComplete { addr }
        }
        event_code::COMMAND_COMPLETE => {
            if params.len() < 3 {
                return Event::Ignore;
            }
            let _num_hci_command_packets = chew!(params, 1)[0];
            let command_opcode = chew_u16!(params);
            if command_opcode != opcodes::READ_PAGE_TIMEOUT.raw() || params.len() < 3 {
                return Event::Ignore;
            }
            let status = chew!(params, 1)[0];
            let page_timeout_slots = chew_u16!(params);
            Event::ReadPageTimeoutComplete {
                status,
                page_timeout_slots,
            }
        }
        event_code::ROLE_CHANGE => {
            if params.len() < 7 {
                return Event::Ignore;
            }
            let status = chew!(params, 1)[0];
            let addr = chew_baddr!(params);
            Event::RoleChange { status, addr }
        }
        event_code::MODE_CHANGE => {
            if params.len() < 4 {
                return Event::Ignore;
            }
            let status = chew!(params, 1)[0];
            let handle = chew_handle!(params);
            let mode = AclMode::from_wire(chew!(params, 1)[0]);
            Event::ModeChange {
                status,
                handle,
                mode,
            }
        }
        event_code::PIN_CODE_REQUEST => {
            if params.len() < 6 {
                return Event::Ignore;
            }
            Event::PinCodeRequest {
                addr: chew_baddr!(params),
            }
        }
        event_code::LINK_KEY_REQUEST => {
            if params.len() < 6 {
                return Event::Ignore;
            }
            Event::LinkKeyRequest {
                addr: chew_baddr!(params),
            }
        }
        event_code::SYNC_CONNECTION_COMPLETE => {
            if params.len() < 12 {
                return Event::Ignore;
            }
            let status = chew!(params, 1)[0];
            let handle = chew_handle!(params);
            let addr = chew_baddr!(params);
            let link_type = LinkType::from_wire(chew!(params, 1)[0]);
            let tx_interval = chew!(params, 1)[0];
            let retrans_window = chew!(params, 1)[0];
            Event::SyncConnectionComplete {
                status,
                handle,
                addr,
                link_type,
                tx_interval,
                retrans_window,
            }
        }
        event_code::SYNC_CONNECTION_CHANGED => {
            if params.len() < 5 {
                return Event::Ignore;
            }
            let status = chew!(params, 1)[0];
            let handle = chew_handle!(params);
            let tx_interval = chew!(params, 1)[0];
            let retrans_window = chew!(params, 1)[0];
            Event::SyncConnectionChanged {
                status,
                handle,
                tx_interval,
                retrans_window,
            }
        }
        _ => Event::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_inquiry_command() {
        let bytes = [0x01, 0x04, 0x05, 0x33, 0x8B, 0x9E, 0x08, 0x00];
        assert_eq!(decode_command(&bytes), Command::Inquiry);
    }

    #[test]
    fn decodes_create_connection_command() {
        let bytes = [
            0x05, 0x04, 0x0D, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x18, 0xCC, 0x02, 0x00, 0x00,
            0x00, 0x01,
        ];
        match decode_command(&bytes) {
            Command::CreateConnection { addr } => {
                assert_eq!(addr.octets(), [0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
            }
            other => panic!("expected CreateConnection, got {:?}", other),
        }
    }

    #[test]
    fn truncated_command_is_ignored_not_panicking() {
        assert_eq!(decode_command(&[0x05, 0x04]), Command::Ignore);
        assert_eq!(decode_command(&[0x05, 0x04, 0x0D, 0x11, 0x22]), Command::Ignore);
    }

    #[test]
    fn decodes_connection_complete_event() {
        let bytes = [
            0x03, 0x0B, 0x00, 0x2A, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x01, 0x00, 0x00,
            0x00,
        ];
        match decode_event(&bytes) {
            Event::ConnectionComplete {
                status,
                handle,
                addr,
                link_type,
            } => {
                assert_eq!(status, 0);
                assert_eq!(handle.raw(), 0x002A);
                assert_eq!(addr.octets(), [0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
                assert_eq!(link_type, LinkType::Acl);
            }
            other => panic!("expected ConnectionComplete, got {:?}", other),
        }
    }

    #[test]
    fn decodes_connection_request_event() {
        let bytes = [
            0x04, 0x0A, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x40, 0x04, 0x08, 0x01,
        ];
        match decode_event(&bytes) {
            Event::ConnectionRequest { addr, link_type } => {
                assert_eq!(addr.octets(), [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
                assert_eq!(link_type, LinkType::Acl);
            }
            other => panic!("expected ConnectionRequest, got {:?}", other),
        }
    }

    #[test]
    fn decodes_sync_connection_complete_event() {
        // Status(1) Handle(2) Addr(6) LinkType(1) TxInterval(1) RetransWindow(1)
        // RxPacketLen(2) TxPacketLen(2) AirMode(1) = 17 bytes.
        let params = [
            0x00, 0x31, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x02, 0x06, 0x02, 0x07, 0x00,
            0x00, 0x00, 0x02,
        ];
        let mut bytes = vec![event_code::SYNC_CONNECTION_COMPLETE, params.len() as u8];
        bytes.extend_from_slice(&params);

        match decode_event(&bytes) {
            Event::SyncConnectionComplete {
                status,
                handle,
                addr,
                link_type,
                tx_interval,
                retrans_window,
            } => {
                assert_eq!(status, 0);
                assert_eq!(handle.raw(), 0x0031);
                assert_eq!(addr.octets(), [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
                assert_eq!(link_type, LinkType::Esco);
                assert_eq!(tx_interval, 6);
                assert_eq!(retrans_window, 2);
            }
            other => panic!("expected SyncConnectionComplete, got {:?}", other),
        }
    }

    #[test]
    fn command_complete_ignores_unrelated_opcodes() {
        let params = [0x01, 0x03, 0x0C, 0x00];
        let mut bytes = vec![event_code::COMMAND_COMPLETE, params.len() as u8];
        bytes.extend_from_slice(&params);
        assert_eq!(decode_event(&bytes), Event::Ignore);
    }

    #[test]
    fn command_complete_decodes_read_page_timeout() {
        let params = [0x01, 0x19, 0x0C, 0x00, 0x00, 0x20];
        let mut bytes = vec![event_code::COMMAND_COMPLETE, params.len() as u8];
        bytes.extend_from_slice(&params);
        match decode_event(&bytes) {
            Event::ReadPageTimeoutComplete {
                status,
                page_timeout_slots,
            } => {
                assert_eq!(status, 0);
                assert_eq!(page_timeout_slots, 0x2000);
            }
            other => panic!("expected ReadPageTimeoutComplete, got {:?}", other),
        }
    }
}
