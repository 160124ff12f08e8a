// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-process EROT behind the bus and ready-signal traits.
//!
//! The simulated device answers Set Endpoint ID and the firmware update
//! commands, and once a component update starts it drives the device side
//! of the transfer itself: it pulls the image with RequestFirmwareData and
//! reports transfer, verify and apply completion.

use crate::bus::ReadySignal;
use crate::bus::SpiBus;
use crate::error::BusError;
use async_trait::async_trait;
use erot_messages::command::encode_request;
use erot_messages::control::answer_set_endpoint_id;
use erot_messages::control::SET_ENDPOINT_ID;
use erot_messages::fd_impl::handle_message;
use erot_messages::fd_impl::FdHandler;
use erot_messages::fw_update::completion;
use erot_messages::fw_update::descriptor_type;
use erot_messages::fw_update::string_type;
use erot_messages::fw_update::ActivateFirmwareRequest;
use erot_messages::fw_update::ActivateFirmwareResponse;
use erot_messages::fw_update::ActivationMethods;
use erot_messages::fw_update::ApplyCompleteRequest;
use erot_messages::fw_update::CancelUpdateResponse;
use erot_messages::fw_update::ComponentParameters;
use erot_messages::fw_update::ComponentParametersHeader;
use erot_messages::fw_update::Descriptor;
use erot_messages::fw_update::DeviceIdentifiers;
use erot_messages::fw_update::FdState;
use erot_messages::fw_update::FirmwareParameters;
use erot_messages::fw_update::FwUpdateCommand;
use erot_messages::fw_update::GetStatusResponse;
use erot_messages::fw_update::PassComponentTableRequest;
use erot_messages::fw_update::PassComponentTableResponse;
use erot_messages::fw_update::RequestFirmwareDataRequest;
use erot_messages::fw_update::RequestUpdateRequest;
use erot_messages::fw_update::RequestUpdateResponse;
use erot_messages::fw_update::TransferCompleteRequest;
use erot_messages::fw_update::TransferFlag;
use erot_messages::fw_update::UpdateComponentRequest;
use erot_messages::fw_update::UpdateComponentResponse;
use erot_messages::fw_update::UpdateOptionFlags;
use erot_messages::fw_update::VerifyCompleteRequest;
use erot_messages::fw_update::VersionString;
use erot_messages::fw_update::BASELINE_TRANSFER_SIZE;
use erot_messages::package::ComponentTemplate;
use erot_messages::package::DeviceRecordTemplate;
use erot_messages::package::PackageBuilder;
use erot_messages::transport::decode_packet;
use erot_messages::transport::encode_packet;
use erot_messages::transport::Fragments;
use erot_messages::transport::MAX_PACKET_SIZE;
use erot_messages::CommandHeader;
use erot_messages::CompletionCode;
use erot_messages::InstanceId;
use erot_messages::MessageTag;
use erot_messages::MessageType;
use erot_messages::MAX_MESSAGE_SIZE;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Verify result the simulated device reports when told to fail: the first
/// vendor-defined verify failure.
pub const SIM_VERIFY_FAILURE: u8 = 0x90;

/// One updatable component of the simulated device.
#[derive(Debug, Clone)]
pub struct SimComponent {
    pub classification: u16,
    pub identifier: u16,
    pub classification_index: u8,
    pub active_version: String,
}

/// Injected misbehavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimFaults {
    /// Never answer anything.
    pub silent: bool,
    /// Report firmware parameters larger than the host accepts.
    pub oversize_parameters: bool,
    /// Refuse every UpdateComponent.
    pub will_not_update: bool,
    /// Report a verify failure for every component.
    pub fail_verify: bool,
    /// Answer RequestUpdate with an unsupported-command completion code.
    pub request_update_unsupported: bool,
    /// Ask for device metadata in the RequestUpdate reply.
    pub request_metadata: bool,
    /// Refuse every component table entry.
    pub refuse_components: bool,
    /// Accept UpdateComponent but never pull firmware data.
    pub stall_transfer: bool,
    /// Pull from past the end of the image.
    pub pull_out_of_range: bool,
    /// Pull once more after the transfer has been reported complete.
    pub late_pull: bool,
    /// Send this request in place of the first firmware data pull.
    pub stray_request: Option<(MessageType, u8)>,
    /// Refuse ActivateFirmware.
    pub fail_activation: bool,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub descriptors: Vec<(u16, Vec<u8>)>,
    pub components: Vec<SimComponent>,
    pub active_version: String,
    /// Length of each RequestFirmwareData pull.
    pub transfer_chunk: u32,
    /// If set, ApplyComplete reports these methods in place of the ones the
    /// package requested.
    pub modified_activation: Option<ActivationMethods>,
    pub faults: SimFaults,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            descriptors: vec![
                (descriptor_type::PCI_VENDOR_ID, 0x10deu16.to_le_bytes().to_vec()),
                (descriptor_type::PCI_DEVICE_ID, 0x22a3u16.to_le_bytes().to_vec()),
            ],
            components: vec![
                SimComponent {
                    classification: 0x000a,
                    identifier: 0x0010,
                    classification_index: 0,
                    active_version: "1.0.0".to_string(),
                },
                SimComponent {
                    classification: 0x000a,
                    identifier: 0x0020,
                    classification_index: 1,
                    active_version: "1.0.0".to_string(),
                },
            ],
            active_version: "erot-1.0.0".to_string(),
            transfer_chunk: 1024,
            modified_activation: None,
            faults: SimFaults::default(),
        }
    }
}

impl SimConfig {
    /// Builds a package with one device record matching this device and
    /// one image of `image_len` bytes per component.
    pub fn matching_package(&self, image_len: usize) -> Vec<u8> {
        let components: Vec<ComponentTemplate> = self
            .components
            .iter()
            .enumerate()
            .map(|(i, c)| ComponentTemplate {
                classification: c.classification,
                identifier: c.identifier,
                comparison_stamp: 2,
                requested_activation_method: ActivationMethods::MEDIUM_SPECIFIC_RESET,
                version: "2.0.0".to_string(),
                image: (0..image_len).map(|b| (b as u8) ^ (i as u8 + 1)).collect(),
                ..Default::default()
            })
            .collect();
        PackageBuilder {
            version: "erot-2.0.0".to_string(),
            device_records: vec![DeviceRecordTemplate {
                descriptors: self.descriptors.clone(),
                applicable_components: (0..components.len()).collect(),
                image_set_version: "erot-2.0.0".to_string(),
                ..Default::default()
            }],
            components,
            ..Default::default()
        }
        .build()
    }
}

/// Host-visible handle; clones share one device.
#[derive(Clone)]
pub struct SimulatedErot {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedErot {
    pub fn new(config: SimConfig) -> Self {
        Self { state: Arc::new(Mutex::new(SimState::new(config))) }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_faults(&self, faults: SimFaults) {
        self.lock().device.config.faults = faults;
    }

    /// Firmware update commands the host has sent, in order.
    pub fn commands_received(&self) -> Vec<u8> {
        self.lock().commands.clone()
    }

    /// Images the device pulled, one per completed transfer.
    pub fn received_images(&self) -> Vec<Vec<u8>> {
        self.lock().device.images.clone()
    }

    pub fn fd_state(&self) -> FdState {
        self.lock().device.state
    }

    /// Completion codes the host refused RequestFirmwareData with.
    pub fn data_refusals(&self) -> Vec<CompletionCode> {
        self.lock().data_refusals.clone()
    }

    /// Endpoint ID the host assigned us.
    pub fn eid(&self) -> u8 {
        self.lock().eid
    }
}

#[async_trait]
impl SpiBus for SimulatedErot {
    async fn transact(
        &mut self,
        _chip_select: u8,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<usize, BusError> {
        let mut state = self.lock();
        if !tx.is_empty() {
            state.packet_from_host(tx);
            return Ok(0);
        }
        match state.outbox.pop_front() {
            Some(packet) => {
                let n = packet.len().min(rx.len());
                rx[..n].copy_from_slice(&packet[..n]);
                Ok(packet.len())
            }
            None => Ok(0),
        }
    }
}

impl ReadySignal for SimulatedErot {
    fn is_asserted(&mut self) -> bool {
        !self.lock().outbox.is_empty()
    }
}

/// A device-initiated request awaiting the host's answer.
#[derive(Debug, Clone, Copy)]
struct Outstanding {
    command: FwUpdateCommand,
    instance_id: InstanceId,
    tag: MessageTag,
}

struct SimState {
    device: SimDevice,
    eid: u8,
    host_eid: u8,
    partial: Vec<u8>,
    outbox: VecDeque<Vec<u8>>,
    next_tag: MessageTag,
    next_instance_id: InstanceId,
    outstanding: Option<Outstanding>,
    commands: Vec<u8>,
    data_refusals: Vec<CompletionCode>,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        Self {
            device: SimDevice::new(config),
            eid: 0,
            host_eid: 0,
            partial: Vec::new(),
            outbox: VecDeque::new(),
            next_tag: MessageTag::default(),
            next_instance_id: InstanceId::default(),
            outstanding: None,
            commands: Vec::new(),
            data_refusals: Vec::new(),
        }
    }

    fn packet_from_host(&mut self, bytes: &[u8]) {
        let Ok(packet) = decode_packet(bytes) else {
            return;
        };
        if packet.header.start_of_message {
            self.partial.clear();
        }
        self.partial.extend_from_slice(packet.payload);
        if packet.header.end_of_message {
            self.host_eid = packet.header.source;
            let message = std::mem::take(&mut self.partial);
            if !self.device.config.faults.silent {
                self.message_from_host(&message, packet.header.tag);
            }
        }
    }

    fn message_from_host(&mut self, message: &[u8], tag: MessageTag) {
        let Ok((header, _)) = CommandHeader::read(message) else {
            return;
        };
        let mut out = vec![0; MAX_MESSAGE_SIZE];

        if header.msg_type() == MessageType::Control as u8 {
            if header.is_request() && header.command == SET_ENDPOINT_ID {
                if let Ok((eid, n)) = answer_set_endpoint_id(message, &mut out) {
                    self.eid = eid;
                    self.queue(&out[..n], tag, false);
                }
            }
            return;
        }
        if header.msg_type() != MessageType::FwUpdate as u8 {
            return;
        }

        if header.is_request() {
            self.commands.push(header.command);
            if let Some(n) = handle_message(message, &mut self.device, &mut out) {
                self.queue(&out[..n], tag, false);
            }
            if let Some(size) = self.device.transfer_started.take() {
                self.device.transfer = Some(Transfer { size, data: Vec::new() });
                let faults = self.device.config.faults;
                if let Some((msg_type, command)) = faults.stray_request {
                    self.stray_request(msg_type, command);
                } else if !faults.stall_transfer {
                    self.pull_next();
                }
            }
            return;
        }

        // the host's answer to one of our requests
        let Some(outstanding) = self.outstanding else {
            return;
        };
        if header.instance_id() != outstanding.instance_id
            || header.command != outstanding.command as u8
            || tag != outstanding.tag
        {
            return;
        }
        self.outstanding = None;
        let Ok((_, code, body)) = CommandHeader::read_response(message) else {
            return;
        };
        self.answer_received(outstanding.command, code, body);
    }

    fn answer_received(
        &mut self,
        command: FwUpdateCommand,
        code: CompletionCode,
        body: &[u8],
    ) {
        match command {
            FwUpdateCommand::RequestFirmwareData => {
                if !code.is_success() {
                    self.data_refusals.push(code);
                }
                let Some(transfer) = self.device.transfer.as_mut() else {
                    // a pull after the transfer; carry on verifying
                    if self.device.state == FdState::Verify {
                        self.report_verify();
                    }
                    return;
                };
                if !code.is_success() {
                    // image could not be fetched; abort the transfer
                    self.device.transfer = None;
                    self.device.state = FdState::ReadyXfer;
                    let request = TransferCompleteRequest { transfer_result: 0x02 };
                    self.request(FwUpdateCommand::TransferComplete, &request);
                    return;
                }
                let wanted = transfer.size - transfer.data.len();
                transfer.data.extend_from_slice(&body[..body.len().min(wanted)]);
                self.pull_next();
            }
            FwUpdateCommand::TransferComplete => {
                if self.device.state != FdState::Verify {
                    return;
                }
                if self.device.config.faults.late_pull {
                    let request = RequestFirmwareDataRequest {
                        offset: 0,
                        length: BASELINE_TRANSFER_SIZE,
                    };
                    self.request(FwUpdateCommand::RequestFirmwareData, &request);
                    return;
                }
                self.report_verify();
            }
            FwUpdateCommand::VerifyComplete => {
                if self.device.state != FdState::Apply {
                    return;
                }
                let request = match self.device.config.modified_activation {
                    Some(methods) => ApplyCompleteRequest {
                        apply_result: 1,
                        activation_methods_modification: methods,
                    },
                    None => ApplyCompleteRequest {
                        apply_result: 0,
                        activation_methods_modification: ActivationMethods::empty(),
                    },
                };
                self.request(FwUpdateCommand::ApplyComplete, &request);
            }
            FwUpdateCommand::ApplyComplete => {
                self.device.state = FdState::ReadyXfer;
            }
            _ => {}
        }
    }

    fn report_verify(&mut self) {
        let verify_result = if self.device.config.faults.fail_verify {
            SIM_VERIFY_FAILURE
        } else {
            0
        };
        let request = VerifyCompleteRequest { verify_result };
        self.request(FwUpdateCommand::VerifyComplete, &request);
        if verify_result == 0 {
            self.device.state = FdState::Apply;
        } else {
            self.device.state = FdState::ReadyXfer;
        }
    }

    /// Requests the next chunk of the image, or reports the transfer
    /// complete once all of it has arrived.
    fn pull_next(&mut self) {
        let Some(transfer) = self.device.transfer.as_ref() else {
            return;
        };
        let received = transfer.data.len();
        if received < transfer.size {
            let remaining = (transfer.size - received) as u32;
            let length = if remaining < self.device.config.transfer_chunk {
                // last pull rounds up to whole baseline units
                remaining.div_ceil(BASELINE_TRANSFER_SIZE) * BASELINE_TRANSFER_SIZE
            } else {
                self.device.config.transfer_chunk
            };
            let mut offset = received as u32;
            if self.device.config.faults.pull_out_of_range {
                offset += transfer.size as u32;
            }
            let request = RequestFirmwareDataRequest { offset, length };
            self.request(FwUpdateCommand::RequestFirmwareData, &request);
            return;
        }

        if let Some(transfer) = self.device.transfer.take() {
            self.device.images.push(transfer.data);
        }
        self.device.state = FdState::Verify;
        let request = TransferCompleteRequest { transfer_result: 0 };
        self.request(FwUpdateCommand::TransferComplete, &request);
    }

    /// Sends a device-initiated request.
    fn request<T: Serialize>(&mut self, command: FwUpdateCommand, body: &T) {
        let instance_id = self.next_instance_id;
        self.next_instance_id = instance_id.next();
        let tag = self.next_tag;
        self.next_tag = tag.next();

        let header =
            CommandHeader::request(MessageType::FwUpdate, instance_id, command as u8);
        let mut out = [0; 32];
        let Ok(n) = encode_request(&mut out, header, body, &[]) else {
            return;
        };
        self.outstanding = Some(Outstanding { command, instance_id, tag });
        self.queue(&out[..n], tag, true);
    }

    /// Sends a bodiless request the host does not expect.
    fn stray_request(&mut self, msg_type: MessageType, command: u8) {
        let instance_id = self.next_instance_id;
        self.next_instance_id = instance_id.next();
        let tag = self.next_tag;
        self.next_tag = tag.next();

        let header = CommandHeader::request(msg_type, instance_id, command);
        let mut out = [0; 8];
        if let Ok(n) = encode_request(&mut out, header, &(), &[]) {
            self.queue(&out[..n], tag, true);
        }
    }

    fn queue(&mut self, message: &[u8], tag: MessageTag, tag_owner: bool) {
        for (header, payload) in
            Fragments::new(message, self.eid, self.host_eid, tag, tag_owner)
        {
            let mut packet = [0; MAX_PACKET_SIZE];
            if let Ok(n) = encode_packet(&header, payload, &mut packet) {
                self.outbox.push_back(packet[..n].to_vec());
            }
        }
    }
}

#[derive(Debug)]
struct Transfer {
    size: usize,
    data: Vec<u8>,
}

/// Firmware-device command handling.
struct SimDevice {
    config: SimConfig,
    state: FdState,
    /// Image size of a component the host just started updating.
    transfer_started: Option<usize>,
    transfer: Option<Transfer>,
    images: Vec<Vec<u8>>,
    update_option_flags: UpdateOptionFlags,
}

impl SimDevice {
    fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: FdState::Idle,
            transfer_started: None,
            transfer: None,
            images: Vec::new(),
            update_option_flags: UpdateOptionFlags::empty(),
        }
    }

    fn knows(&self, classification: u16, identifier: u16) -> bool {
        self.config.components.iter().any(|c| {
            c.classification == classification && c.identifier == identifier
        })
    }
}

impl FdHandler for SimDevice {
    fn query_device_identifiers(
        &mut self,
        out: &mut [u8],
    ) -> Result<usize, CompletionCode> {
        let descriptors: Vec<Descriptor<'_>> = self
            .config
            .descriptors
            .iter()
            .map(|(descriptor_type, data)| Descriptor {
                descriptor_type: *descriptor_type,
                data,
            })
            .collect();
        DeviceIdentifiers::encode(&descriptors, out).map_err(|_| CompletionCode::ERROR)
    }

    fn get_firmware_parameters(
        &mut self,
        out: &mut [u8],
    ) -> Result<usize, CompletionCode> {
        let padding = [b'x'; 255];
        let (active, pending) = if self.config.faults.oversize_parameters {
            let padded = VersionString { string_type: string_type::ASCII, bytes: &padding };
            (padded, padded)
        } else {
            (VersionString::ascii(&self.config.active_version), VersionString::ascii(""))
        };
        let components: Vec<ComponentParameters<'_>> = self
            .config
            .components
            .iter()
            .map(|c| ComponentParameters {
                header: ComponentParametersHeader {
                    classification: c.classification,
                    identifier: c.identifier,
                    classification_index: c.classification_index,
                    active_comparison_stamp: 1,
                    active_version_type: active.string_type,
                    active_version_len: 0,
                    active_release_date: [0; 8],
                    pending_comparison_stamp: 0,
                    pending_version_type: active.string_type,
                    pending_version_len: 0,
                    pending_release_date: [0; 8],
                    activation_methods: ActivationMethods::MEDIUM_SPECIFIC_RESET
                        | ActivationMethods::SYSTEM_REBOOT,
                    capabilities_during_update: 0,
                },
                active_version: c.active_version.as_bytes(),
                pending_version: &[],
            })
            .collect();
        FirmwareParameters::encode(0, active, pending, &components, out)
            .map_err(|_| CompletionCode::ERROR)
    }

    fn request_update(
        &mut self,
        request: &RequestUpdateRequest,
        _image_set_version: VersionString<'_>,
    ) -> Result<RequestUpdateResponse, CompletionCode> {
        if self.config.faults.request_update_unsupported {
            return Err(CompletionCode::UNSUPPORTED_COMMAND);
        }
        if self.state != FdState::Idle {
            return Err(completion::ALREADY_IN_UPDATE_MODE);
        }
        if request.num_components == 0 {
            return Err(CompletionCode::INVALID_DATA);
        }
        self.state = FdState::LearnComponents;
        Ok(RequestUpdateResponse {
            fd_metadata_length: if self.config.faults.request_metadata {
                16
            } else {
                0
            },
            fd_will_send_get_package_data: 0,
        })
    }

    fn pass_component_table(
        &mut self,
        request: &PassComponentTableRequest,
        _version: VersionString<'_>,
    ) -> Result<PassComponentTableResponse, CompletionCode> {
        if self.state != FdState::LearnComponents {
            return Err(completion::INVALID_STATE_FOR_COMMAND);
        }
        if request.transfer_flag.contains(TransferFlag::END) {
            self.state = FdState::ReadyXfer;
        }
        let known = self.knows(request.classification, request.identifier)
            && !self.config.faults.refuse_components;
        Ok(PassComponentTableResponse {
            component_response: u8::from(!known),
            // "not supported by the device"
            component_response_code: if known { 0 } else { 0x06 },
        })
    }

    fn update_component(
        &mut self,
        request: &UpdateComponentRequest,
        _version: VersionString<'_>,
    ) -> Result<UpdateComponentResponse, CompletionCode> {
        if self.state != FdState::ReadyXfer {
            return Err(completion::INVALID_STATE_FOR_COMMAND);
        }
        if self.config.faults.will_not_update
            || !self.knows(request.classification, request.identifier)
        {
            return Ok(UpdateComponentResponse {
                compatibility_response: 1,
                // "comparison stamp identical"
                compatibility_response_code: 0x01,
                update_option_flags_enabled: UpdateOptionFlags::empty(),
                time_before_request_fw_data: 0,
            });
        }
        self.state = FdState::Download;
        self.update_option_flags = request.update_option_flags;
        self.transfer_started = Some(request.image_size as usize);
        Ok(UpdateComponentResponse {
            compatibility_response: 0,
            compatibility_response_code: 0,
            update_option_flags_enabled: request.update_option_flags,
            time_before_request_fw_data: 0,
        })
    }

    fn activate_firmware(
        &mut self,
        _request: &ActivateFirmwareRequest,
    ) -> Result<ActivateFirmwareResponse, CompletionCode> {
        if self.state != FdState::ReadyXfer {
            return Err(completion::INVALID_STATE_FOR_COMMAND);
        }
        if self.config.faults.fail_activation {
            return Err(CompletionCode::ERROR);
        }
        self.state = FdState::Idle;
        Ok(ActivateFirmwareResponse {
            estimated_time_for_self_contained_activation: 0,
        })
    }

    fn get_status(&mut self) -> Result<GetStatusResponse, CompletionCode> {
        let progress_percent = match &self.transfer {
            Some(t) if t.size > 0 => (t.data.len() * 100 / t.size) as u8,
            _ => 0,
        };
        Ok(GetStatusResponse {
            current_state: self.state as u8,
            previous_state: self.state as u8,
            aux_state: 0,
            aux_state_status: 0,
            progress_percent,
            reason_code: 0,
            update_option_flags_enabled: self.update_option_flags,
        })
    }

    fn cancel_update_component(&mut self) -> Result<(), CompletionCode> {
        match self.state {
            FdState::Download | FdState::Verify | FdState::Apply => {
                self.transfer = None;
                self.state = FdState::ReadyXfer;
                Ok(())
            }
            _ => Err(completion::INVALID_STATE_FOR_COMMAND),
        }
    }

    fn cancel_update(&mut self) -> Result<CancelUpdateResponse, CompletionCode> {
        if self.state == FdState::Idle {
            return Err(completion::NOT_IN_UPDATE_MODE);
        }
        self.transfer = None;
        self.state = FdState::Idle;
        Ok(CancelUpdateResponse {
            non_functioning_component_indication: 0,
            non_functioning_component_bitmap: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use erot_messages::package::Package;

    #[test]
    fn matching_package_matches_device() {
        let config = SimConfig::default();
        let data = config.matching_package(100);
        let package = Package::parse(&data).unwrap();
        assert_eq!(package.component_count(), 2);

        let mut device = SimDevice::new(config);
        let mut ids = [0; 64];
        let n = device.query_device_identifiers(&mut ids).unwrap();
        let ids = DeviceIdentifiers::decode(&ids[..n]).unwrap();
        let record = package.find_matching_record(&ids).unwrap();
        assert!(record.is_applicable(0));
        assert!(record.is_applicable(1));
    }

    #[test]
    fn oversize_parameters_exceed_host_buffer() {
        let config = SimConfig {
            faults: SimFaults { oversize_parameters: true, ..Default::default() },
            ..Default::default()
        };
        let mut device = SimDevice::new(config);
        let mut out = vec![0; MAX_MESSAGE_SIZE];
        let n = device.get_firmware_parameters(&mut out).unwrap();
        assert!(n > erot_messages::FW_PARAMS_BUFFER_SIZE);
        let params = FirmwareParameters::decode(&out[..n]).unwrap();
        assert_eq!(params.components().count(), 2);
    }

    #[test]
    fn update_states() {
        let mut device = SimDevice::new(SimConfig::default());
        assert_eq!(
            device.cancel_update().unwrap_err(),
            completion::NOT_IN_UPDATE_MODE
        );
        let request = RequestUpdateRequest {
            max_transfer_size: 4096,
            num_components: 1,
            max_outstanding_transfer_requests: 1,
            package_data_length: 0,
            version_type: 1,
            version_len: 0,
        };
        device.request_update(&request, VersionString::ascii("")).unwrap();
        assert_eq!(device.state, FdState::LearnComponents);
        assert_eq!(
            device.request_update(&request, VersionString::ascii("")).unwrap_err(),
            completion::ALREADY_IN_UPDATE_MODE
        );
        device.cancel_update().unwrap();
        assert_eq!(device.state, FdState::Idle);
    }
}
