// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Behavior implemented by real and simulated firmware devices.

use crate::command::CommandError;
use crate::command::CommandHeader;
use crate::command::CompletionCode;
use crate::command::MessageType;
use crate::command::RESPONSE_HEADER_SIZE;
use crate::fw_update::decode_exact_body;
use crate::fw_update::encode_failure;
use crate::fw_update::ActivateFirmwareRequest;
use crate::fw_update::ActivateFirmwareResponse;
use crate::fw_update::CancelUpdateResponse;
use crate::fw_update::FwUpdateCommand;
use crate::fw_update::GetStatusResponse;
use crate::fw_update::PassComponentTableRequest;
use crate::fw_update::PassComponentTableResponse;
use crate::fw_update::RequestUpdateRequest;
use crate::fw_update::RequestUpdateResponse;
use crate::fw_update::UpdateComponentRequest;
use crate::fw_update::UpdateComponentResponse;
use crate::fw_update::VersionString;
use crate::fw_update::VersionedBody;
use serde::Serialize;
use zerocopy::IntoBytes;

/// Firmware-device side of the update command set. Each method either
/// produces a response body or fails with the completion code to send back.
pub trait FdHandler {
    /// Writes a device identifier body (see
    /// [`crate::fw_update::DeviceIdentifiers::encode`]) into `out`.
    fn query_device_identifiers(
        &mut self,
        out: &mut [u8],
    ) -> Result<usize, CompletionCode>;

    /// Writes a firmware parameters body (see
    /// [`crate::fw_update::FirmwareParameters::encode`]) into `out`.
    fn get_firmware_parameters(
        &mut self,
        out: &mut [u8],
    ) -> Result<usize, CompletionCode>;

    fn request_update(
        &mut self,
        request: &RequestUpdateRequest,
        image_set_version: VersionString<'_>,
    ) -> Result<RequestUpdateResponse, CompletionCode>;

    fn pass_component_table(
        &mut self,
        request: &PassComponentTableRequest,
        version: VersionString<'_>,
    ) -> Result<PassComponentTableResponse, CompletionCode>;

    fn update_component(
        &mut self,
        request: &UpdateComponentRequest,
        version: VersionString<'_>,
    ) -> Result<UpdateComponentResponse, CompletionCode>;

    fn activate_firmware(
        &mut self,
        request: &ActivateFirmwareRequest,
    ) -> Result<ActivateFirmwareResponse, CompletionCode>;

    fn get_status(&mut self) -> Result<GetStatusResponse, CompletionCode>;

    fn cancel_update_component(&mut self) -> Result<(), CompletionCode>;

    fn cancel_update(&mut self) -> Result<CancelUpdateResponse, CompletionCode>;
}

fn decode_failure(err: CommandError) -> CompletionCode {
    match err {
        CommandError::InvalidBody => CompletionCode::INVALID_DATA,
        _ => CompletionCode::INVALID_LENGTH,
    }
}

fn expect_empty(body: &[u8]) -> Result<(), CompletionCode> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(CompletionCode::INVALID_LENGTH)
    }
}

fn put<T: Serialize>(out: &mut [u8], body: &T) -> Result<usize, CompletionCode> {
    hubpack::serialize(out, body).map_err(encode_failure)
}

/// Handle a single incoming message.
///
/// `data` is a complete reassembled message. If it is a firmware update
/// request, the matching `handler` method is called and the response
/// (header, completion code and body) is written to `out`, returning its
/// length. Anything else (responses, other message types, runts) gets no
/// reply and returns `None`.
pub fn handle_message<H: FdHandler>(
    data: &[u8],
    handler: &mut H,
    out: &mut [u8],
) -> Option<usize> {
    let (header, body) = CommandHeader::read(data).ok()?;
    if !header.is_request() || header.msg_type() != MessageType::FwUpdate as u8
    {
        return None;
    }
    let (prefix, body_out) = out.split_at_mut_checked(RESPONSE_HEADER_SIZE)?;

    let (code, n) = match handle_request(header.command, body, handler, body_out)
    {
        Ok(n) => (CompletionCode::SUCCESS, n),
        Err(code) => (code, 0),
    };
    prefix[..RESPONSE_HEADER_SIZE - 1]
        .copy_from_slice(header.to_response().as_bytes());
    prefix[RESPONSE_HEADER_SIZE - 1] = code.0;
    Some(RESPONSE_HEADER_SIZE + n)
}

fn handle_request<H: FdHandler>(
    command: u8,
    body: &[u8],
    handler: &mut H,
    out: &mut [u8],
) -> Result<usize, CompletionCode> {
    let command = FwUpdateCommand::from_repr(command)
        .ok_or(CompletionCode::UNSUPPORTED_COMMAND)?;

    match command {
        FwUpdateCommand::QueryDeviceIdentifiers => {
            expect_empty(body)?;
            handler.query_device_identifiers(out)
        }
        FwUpdateCommand::GetFirmwareParameters => {
            expect_empty(body)?;
            handler.get_firmware_parameters(out)
        }
        FwUpdateCommand::RequestUpdate => {
            let (request, version, _) =
                RequestUpdateRequest::decode_versioned(body)
                    .map_err(decode_failure)?;
            let response = handler.request_update(&request, version)?;
            put(out, &response)
        }
        FwUpdateCommand::PassComponentTable => {
            let (request, version, _) =
                PassComponentTableRequest::decode_versioned(body)
                    .map_err(decode_failure)?;
            let response = handler.pass_component_table(&request, version)?;
            put(out, &response)
        }
        FwUpdateCommand::UpdateComponent => {
            let (request, version, _) =
                UpdateComponentRequest::decode_versioned(body)
                    .map_err(decode_failure)?;
            let response = handler.update_component(&request, version)?;
            put(out, &response)
        }
        FwUpdateCommand::ActivateFirmware => {
            let request = decode_exact_body::<ActivateFirmwareRequest>(body)
                .map_err(decode_failure)?;
            let response = handler.activate_firmware(&request)?;
            put(out, &response)
        }
        FwUpdateCommand::GetStatus => {
            expect_empty(body)?;
            let response = handler.get_status()?;
            put(out, &response)
        }
        FwUpdateCommand::CancelUpdateComponent => {
            expect_empty(body)?;
            handler.cancel_update_component()?;
            Ok(0)
        }
        FwUpdateCommand::CancelUpdate => {
            expect_empty(body)?;
            let response = handler.cancel_update()?;
            put(out, &response)
        }
        // sent by the device, never to it
        FwUpdateCommand::RequestFirmwareData
        | FwUpdateCommand::TransferComplete
        | FwUpdateCommand::VerifyComplete
        | FwUpdateCommand::ApplyComplete => {
            Err(CompletionCode::UNSUPPORTED_COMMAND)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::encode_request;
    use crate::command::InstanceId;
    use crate::fw_update::completion;
    use crate::fw_update::decode_body;
    use crate::fw_update::string_type;
    use crate::fw_update::Descriptor;
    use crate::fw_update::DeviceIdentifiers;
    use crate::fw_update::UpdateOptionFlags;

    #[derive(Default)]
    struct FakeHandler {
        in_update: bool,
        cancelled: bool,
        last_version: Vec<u8>,
    }

    impl FdHandler for FakeHandler {
        fn query_device_identifiers(
            &mut self,
            out: &mut [u8],
        ) -> Result<usize, CompletionCode> {
            let ids = [Descriptor { descriptor_type: 0xffff, data: b"EROT" }];
            DeviceIdentifiers::encode(&ids, out)
                .map_err(|_| CompletionCode::ERROR)
        }

        fn get_firmware_parameters(
            &mut self,
            _out: &mut [u8],
        ) -> Result<usize, CompletionCode> {
            Err(CompletionCode::NOT_READY)
        }

        fn request_update(
            &mut self,
            _request: &RequestUpdateRequest,
            image_set_version: VersionString<'_>,
        ) -> Result<RequestUpdateResponse, CompletionCode> {
            if self.in_update {
                return Err(completion::ALREADY_IN_UPDATE_MODE);
            }
            self.in_update = true;
            self.last_version = image_set_version.bytes.to_vec();
            Ok(RequestUpdateResponse {
                fd_metadata_length: 0,
                fd_will_send_get_package_data: 0,
            })
        }

        fn pass_component_table(
            &mut self,
            _request: &PassComponentTableRequest,
            _version: VersionString<'_>,
        ) -> Result<PassComponentTableResponse, CompletionCode> {
            Ok(PassComponentTableResponse {
                component_response: 0,
                component_response_code: 0,
            })
        }

        fn update_component(
            &mut self,
            _request: &UpdateComponentRequest,
            _version: VersionString<'_>,
        ) -> Result<UpdateComponentResponse, CompletionCode> {
            Ok(UpdateComponentResponse {
                compatibility_response: 0,
                compatibility_response_code: 0,
                update_option_flags_enabled: UpdateOptionFlags::empty(),
                time_before_request_fw_data: 0,
            })
        }

        fn activate_firmware(
            &mut self,
            _request: &ActivateFirmwareRequest,
        ) -> Result<ActivateFirmwareResponse, CompletionCode> {
            Ok(ActivateFirmwareResponse {
                estimated_time_for_self_contained_activation: 0,
            })
        }

        fn get_status(&mut self) -> Result<GetStatusResponse, CompletionCode> {
            Err(CompletionCode::UNSUPPORTED_COMMAND)
        }

        fn cancel_update_component(&mut self) -> Result<(), CompletionCode> {
            self.cancelled = true;
            Ok(())
        }

        fn cancel_update(
            &mut self,
        ) -> Result<CancelUpdateResponse, CompletionCode> {
            self.in_update = false;
            Ok(CancelUpdateResponse {
                non_functioning_component_indication: 0,
                non_functioning_component_bitmap: 0,
            })
        }
    }

    fn request(command: FwUpdateCommand, body: &[u8]) -> Vec<u8> {
        let header = CommandHeader::request(
            MessageType::FwUpdate,
            InstanceId::new(5),
            command as u8,
        );
        let mut buf = vec![0; 64];
        let n = encode_request(&mut buf, header, &(), body).unwrap();
        buf.truncate(n);
        buf
    }

    fn call(handler: &mut FakeHandler, data: &[u8]) -> (CompletionCode, Vec<u8>) {
        let mut out = [0; 128];
        let n = handle_message(data, handler, &mut out).unwrap();
        let (header, code, body) =
            CommandHeader::read_response(&out[..n]).unwrap();
        assert!(!header.is_request());
        assert_eq!(header.instance_id(), InstanceId::new(5));
        (code, body.to_vec())
    }

    #[test]
    fn query_device_identifiers() {
        let mut handler = FakeHandler::default();
        let (code, body) =
            call(&mut handler, &request(FwUpdateCommand::QueryDeviceIdentifiers, &[]));
        assert!(code.is_success());
        let ids = DeviceIdentifiers::decode(&body).unwrap();
        assert_eq!(ids.count, 1);

        // trailing bytes on a bodiless command
        let (code, body) = call(
            &mut handler,
            &request(FwUpdateCommand::QueryDeviceIdentifiers, &[0]),
        );
        assert_eq!(code, CompletionCode::INVALID_LENGTH);
        assert!(body.is_empty());
    }

    #[test]
    fn request_update_passes_version_and_errors() {
        let mut handler = FakeHandler::default();
        let fixed = RequestUpdateRequest {
            max_transfer_size: 4096,
            num_components: 1,
            max_outstanding_transfer_requests: 1,
            package_data_length: 0,
            version_type: string_type::ASCII,
            version_len: 4,
        };
        let mut body = [0; 32];
        let n = hubpack::serialize(&mut body, &fixed).unwrap();
        body[n..n + 4].copy_from_slice(b"v1.0");
        let msg = request(FwUpdateCommand::RequestUpdate, &body[..n + 4]);

        let (code, rsp) = call(&mut handler, &msg);
        assert!(code.is_success());
        let rsp: RequestUpdateResponse = decode_body(&rsp).unwrap();
        assert_eq!(rsp.fd_metadata_length, 0);
        assert_eq!(handler.last_version, b"v1.0");

        let (code, _) = call(&mut handler, &msg);
        assert_eq!(code, completion::ALREADY_IN_UPDATE_MODE);

        // version string cut short
        let msg = request(FwUpdateCommand::RequestUpdate, &body[..n + 2]);
        let (code, _) = call(&mut handler, &msg);
        assert_eq!(code, CompletionCode::INVALID_LENGTH);
    }

    #[test]
    fn unknown_and_device_initiated_commands() {
        let mut handler = FakeHandler::default();
        let mut msg = request(FwUpdateCommand::GetStatus, &[]);
        msg[2] = 0x7e;
        let (code, _) = call(&mut handler, &msg);
        assert_eq!(code, CompletionCode::UNSUPPORTED_COMMAND);

        let msg = request(FwUpdateCommand::RequestFirmwareData, &[0; 8]);
        let (code, _) = call(&mut handler, &msg);
        assert_eq!(code, CompletionCode::UNSUPPORTED_COMMAND);
    }

    #[test]
    fn cancel_commands() {
        let mut handler = FakeHandler { in_update: true, ..Default::default() };
        let (code, body) =
            call(&mut handler, &request(FwUpdateCommand::CancelUpdateComponent, &[]));
        assert!(code.is_success());
        assert!(body.is_empty());
        assert!(handler.cancelled);

        let (code, body) =
            call(&mut handler, &request(FwUpdateCommand::CancelUpdate, &[]));
        assert!(code.is_success());
        assert_eq!(body.len(), 9);
        assert!(!handler.in_update);
    }

    #[test]
    fn ignores_non_requests() {
        let mut handler = FakeHandler::default();
        let mut out = [0; 64];
        let msg = request(FwUpdateCommand::GetStatus, &[]);

        let (header, _) = CommandHeader::read(&msg).unwrap();
        let rsp = header.to_response();
        assert_eq!(handle_message(rsp.as_bytes(), &mut handler, &mut out), None);

        let mut control = msg.clone();
        control[0] = MessageType::Control as u8;
        assert_eq!(handle_message(&control, &mut handler, &mut out), None);

        assert_eq!(handle_message(&msg[..2], &mut handler, &mut out), None);
    }
}
