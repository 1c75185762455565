//! Integration tests for the guest-facing vocabulary
//!
//! Covers the request kinds, the reply code mapping and descriptor
//! validation as seen from outside the crate.

use protocol::messages::{
    DIR_DEVICE2HOST, DIR_HOST2DEVICE, REC_DEVICE, REC_INTERFACE, REQUEST_SET_CONFIGURATION,
    REQUEST_SET_INTERFACE, TYPE_CLASS, TYPE_STANDARD,
};
use protocol::types::{DESCRIPTOR_TYPE_INTERFACE, INTERFACE_DESCRIPTOR_SIZE};
use protocol::{
    BulkMessage, CONTROL_SETUP_SIZE, CtrlMessage, DescriptorError, IPC_ENOENT, IPC_SUCCESS,
    InterfaceDescriptor, IsoMessage, RequestId, TRANSFER_FAILED, TRANSFER_STALLED,
    TransferOutcome, TransferRequest, request_header,
};

fn ctrl(request_type: u8, request: u8) -> CtrlMessage {
    CtrlMessage {
        id: RequestId(1),
        request_type,
        request,
        value: 0,
        index: 0,
        length: 0,
        data_address: 0,
    }
}

mod result_codes {
    use super::*;

    #[test]
    fn test_completed_passes_value_through() {
        assert_eq!(TransferOutcome::Completed(64).code(), 64);
        assert_eq!(TransferOutcome::Completed(IPC_SUCCESS).code(), 0);
    }

    #[test]
    fn test_failure_codes_are_distinct() {
        let codes = [
            TransferOutcome::Failed.code(),
            TransferOutcome::Stalled.code(),
            TransferOutcome::NoDevice.code(),
        ];
        assert_eq!(codes, [TRANSFER_FAILED, TRANSFER_STALLED, IPC_ENOENT]);
        assert!(codes.iter().all(|code| *code < 0));
    }
}

mod control_requests {
    use super::*;

    #[test]
    fn test_intercepted_headers_match_messages() {
        let set_interface = ctrl(
            DIR_HOST2DEVICE | TYPE_STANDARD | REC_INTERFACE,
            REQUEST_SET_INTERFACE,
        );
        assert_eq!(
            set_interface.header(),
            request_header(
                DIR_HOST2DEVICE,
                TYPE_STANDARD,
                REC_INTERFACE,
                REQUEST_SET_INTERFACE
            )
        );

        let set_configuration = ctrl(
            DIR_HOST2DEVICE | TYPE_STANDARD | REC_DEVICE,
            REQUEST_SET_CONFIGURATION,
        );
        assert_eq!(
            set_configuration.header(),
            request_header(
                DIR_HOST2DEVICE,
                TYPE_STANDARD,
                REC_DEVICE,
                REQUEST_SET_CONFIGURATION
            )
        );
    }

    #[test]
    fn test_class_request_does_not_match_standard_header() {
        let class_request = ctrl(
            DIR_HOST2DEVICE | TYPE_CLASS | REC_INTERFACE,
            REQUEST_SET_INTERFACE,
        );
        assert_ne!(
            class_request.header(),
            request_header(
                DIR_HOST2DEVICE,
                TYPE_STANDARD,
                REC_INTERFACE,
                REQUEST_SET_INTERFACE
            )
        );
    }

    #[test]
    fn test_setup_packet_carries_length() {
        let msg = CtrlMessage {
            length: 0x0102,
            value: 0xAABB,
            index: 0x0001,
            ..ctrl(DIR_DEVICE2HOST | TYPE_CLASS | REC_INTERFACE, 0x01)
        };
        let setup = msg.setup_packet();
        assert_eq!(setup.len(), CONTROL_SETUP_SIZE);
        assert_eq!(&setup[2..4], &[0xBB, 0xAA]);
        assert_eq!(&setup[4..6], &[0x01, 0x00]);
        assert_eq!(&setup[6..8], &[0x02, 0x01]);
    }
}

mod transfer_requests {
    use super::*;

    #[test]
    fn test_bulk_direction_follows_endpoint() {
        let bulk_in = TransferRequest::Bulk(BulkMessage {
            id: RequestId(2),
            endpoint: 0x81,
            length: 64,
            data_address: 0,
        });
        assert!(bulk_in.is_device_to_host());
        assert_eq!(bulk_in.length(), 64);

        let bulk_out = TransferRequest::Bulk(BulkMessage {
            id: RequestId(3),
            endpoint: 0x01,
            length: 64,
            data_address: 0,
        });
        assert!(!bulk_out.is_device_to_host());
    }

    #[test]
    fn test_iso_request_identity() {
        let iso = TransferRequest::Isochronous(IsoMessage {
            id: RequestId(77),
            endpoint: 0x83,
            length: 30,
            packet_sizes: vec![10, 10, 10],
            packet_sizes_address: 0x80,
            data_address: 0x40,
        });
        assert_eq!(iso.id(), RequestId(77));
        assert_eq!(iso.endpoint(), 0x83);
        assert_eq!(iso.data_address(), 0x40);
        assert_eq!(iso.kind_name(), "Isochronous");
    }
}

mod descriptors {
    use super::*;

    #[test]
    fn test_interface_descriptor_validation() {
        let interface = InterfaceDescriptor {
            length: INTERFACE_DESCRIPTOR_SIZE,
            descriptor_type: DESCRIPTOR_TYPE_INTERFACE,
            interface_number: 0,
            alternate_setting: 1,
            num_endpoints: 1,
            interface_class: 0xFF,
            interface_subclass: 0,
            interface_protocol: 0,
            interface_index: 0,
        };
        assert!(interface.validate().is_ok());

        let truncated = InterfaceDescriptor {
            length: 2,
            ..interface
        };
        assert_eq!(
            truncated.validate(),
            Err(DescriptorError::TooShort {
                kind: "interface",
                length: 2,
                minimum: INTERFACE_DESCRIPTOR_SIZE,
            })
        );
    }
}
