// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware update tasks: one per device, run to completion in turn.

use crate::binding::Direction;
use crate::error::BadResponse;
use crate::error::CommandFailure;
use crate::error::CommunicationError;
use crate::error::TaskCreateError;
use crate::error::TransportError;
use crate::error::UpdateError;
use crate::registry::Endpoint;
use crate::registry::EndpointHandle;
use crate::registry::EndpointRegistry;
use erot_messages::command::encode_response;
use erot_messages::command::CommandError;
use erot_messages::command::RESPONSE_HEADER_SIZE;
use erot_messages::fw_update::completion;
use erot_messages::fw_update::decode_body;
use erot_messages::fw_update::decode_exact_body;
use erot_messages::fw_update::ActivateFirmwareRequest;
use erot_messages::fw_update::ActivateFirmwareResponse;
use erot_messages::fw_update::ActivationMethods;
use erot_messages::fw_update::ApplyCompleteRequest;
use erot_messages::fw_update::CancelUpdateResponse;
use erot_messages::fw_update::DeviceIdentifiers;
use erot_messages::fw_update::FirmwareParameters;
use erot_messages::fw_update::FwUpdateCommand;
use erot_messages::fw_update::PassComponentTableRequest;
use erot_messages::fw_update::PassComponentTableResponse;
use erot_messages::fw_update::RequestFirmwareDataRequest;
use erot_messages::fw_update::RequestUpdateRequest;
use erot_messages::fw_update::RequestUpdateResponse;
use erot_messages::fw_update::ResultCode;
use erot_messages::fw_update::ResultStage;
use erot_messages::fw_update::TransferCompleteRequest;
use erot_messages::fw_update::TransferFlag;
use erot_messages::fw_update::UpdateComponentRequest;
use erot_messages::fw_update::UpdateComponentResponse;
use erot_messages::fw_update::UpdateOptionFlags;
use erot_messages::fw_update::VerifyCompleteRequest;
use erot_messages::fw_update::BASELINE_TRANSFER_SIZE;
use erot_messages::fw_update::MAX_OUTSTANDING_TRANSFER_REQUESTS;
use erot_messages::fw_update::MAX_TRANSFER_SIZE;
use erot_messages::package::ComponentImage;
use erot_messages::package::ComponentOptions;
use erot_messages::package::DeviceIdRecord;
use erot_messages::package::Package;
use erot_messages::CommandHeader;
use erot_messages::CompletionCode;
use erot_messages::MessageTag;
use erot_messages::MessageType;
use erot_messages::SerializedSize;
use erot_messages::FW_PARAMS_BUFFER_SIZE;
use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::trace;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::time::Duration;
use tokio::time::Instant;

type Result<T, E = UpdateError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy)]
pub struct UpdateConfig {
    /// Largest chunk a device may pull with one RequestFirmwareData.
    pub max_transfer_size: u32,

    /// Padding a device may read past the end of an image.
    pub baseline_transfer_size: u32,

    /// How long to wait for the device's next request (UA_T2).
    pub fd_idle_timeout: Duration,

    /// Added to the response timeout of ActivateFirmware.
    pub activation_extra_wait: Duration,

    /// Largest firmware parameters body we keep.
    pub fw_params_capacity: usize,

    /// Size of the buffer responses and device requests are received into.
    pub receive_capacity: usize,

    /// Send CancelUpdateComponent/CancelUpdate when a task fails after the
    /// device accepted RequestUpdate.
    pub cancel_on_failure: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_transfer_size: MAX_TRANSFER_SIZE,
            baseline_transfer_size: BASELINE_TRANSFER_SIZE,
            fd_idle_timeout: Duration::from_secs(90),
            activation_extra_wait: Duration::from_secs(20),
            fw_params_capacity: FW_PARAMS_BUFFER_SIZE,
            receive_capacity: 1024,
            cancel_on_failure: true,
        }
    }
}

/// Last stage a task reached, in order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum TaskStage {
    Created,
    IdentifyMatched,
    ParametersRead,
    UpdateRequested,
    ComponentsPassed,
    ComponentsTransferred,
    Verified,
    Applied,
    Activated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(usize);

impl TaskHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Terminal state of one task after [`TaskEngine::execute_all`].
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub name: String,
    pub socket: u8,
    pub stage: TaskStage,
    pub result: Result<ActivationMethods>,
}

#[derive(Debug, Clone)]
pub struct ExecuteSummary {
    /// Error of the first task that failed, if any.
    pub first_error: Option<UpdateError>,

    /// Activation methods of every successful task OR'd together.
    pub activation_methods: ActivationMethods,

    pub outcomes: Vec<TaskOutcome>,
}

impl ExecuteSummary {
    pub fn all_succeeded(&self) -> bool {
        self.first_error.is_none()
    }
}

pub type ProgressFn<'a> = Box<dyn FnMut(u8) + Send + 'a>;

/// Percentage over every task; only increases are reported.
struct Progress<'a> {
    callback: Option<ProgressFn<'a>>,
    reported: u8,
    total: u64,
    finished: u64,
}

impl Progress<'_> {
    fn report(&mut self, percent: u8) {
        if percent <= self.reported {
            return;
        }
        self.reported = percent;
        if let Some(callback) = self.callback.as_mut() {
            callback(percent);
        }
    }

    fn transferred(&mut self, task_bytes: u64) {
        if self.total == 0 {
            return;
        }
        let percent = ((self.finished + task_bytes) * 99 / self.total).min(99);
        self.report(percent as u8);
    }
}

/// A component the package and the device agree on.
#[derive(Debug, Clone, Copy)]
struct Applicable<'a> {
    image: ComponentImage<'a>,
    classification_index: u8,
}

/// Firmware-update state of the device while a component is in flight.
#[derive(Debug, Default)]
struct Session {
    update_requested: bool,
    component_in_flight: bool,
}

/// What a Transfer/Verify/ApplyComplete request told us.
#[derive(Debug, Clone, Copy)]
struct Notice {
    result: ResultCode,
    modification: ActivationMethods,
}

pub struct UpdateTask<'a> {
    endpoint: EndpointHandle,
    name: String,
    socket: u8,
    package: Package<'a>,
    stage: TaskStage,
    outcome: Option<Result<ActivationMethods>>,
    fw_params: Vec<u8>,
    /// Image bytes of this task the device has asked for so far.
    bytes_requested: u64,
    /// Highest offset + length requested for the component in flight.
    last_requested: u64,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    log: Logger,
}

impl<'a> UpdateTask<'a> {
    pub fn endpoint(&self) -> EndpointHandle {
        self.endpoint
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> TaskStage {
        self.stage
    }

    pub fn outcome(&self) -> Option<&Result<ActivationMethods>> {
        self.outcome.as_ref()
    }

    /// The firmware parameters body the device reported, empty until read.
    pub fn firmware_parameters(&self) -> &[u8] {
        &self.fw_params
    }

    async fn run(
        &mut self,
        endpoint: &mut Endpoint,
        config: &UpdateConfig,
        progress: &mut Progress<'_>,
    ) -> Result<ActivationMethods> {
        let mut session = Session::default();
        let result = self.update(endpoint, config, progress, &mut session).await;
        if let Err(err) = &result {
            error!(
                self.log, "update failed";
                "stage" => <&'static str>::from(self.stage),
                InlineErrorChain::new(err),
            );
            if session.update_requested && config.cancel_on_failure {
                self.cancel(endpoint, &session).await;
            }
        }
        result
    }

    async fn update(
        &mut self,
        endpoint: &mut Endpoint,
        config: &UpdateConfig,
        progress: &mut Progress<'_>,
        session: &mut Session,
    ) -> Result<ActivationMethods> {
        let package = self.package;

        let (code, body) = call(
            endpoint,
            FwUpdateCommand::QueryDeviceIdentifiers,
            &[],
            &mut self.recv_buf,
            Duration::ZERO,
        )
        .await?;
        if !code.is_success() {
            return Err(UpdateError::QueryDeviceIdsFailed(
                CommandFailure::Completion(code),
            ));
        }
        let ids = DeviceIdentifiers::decode(body)
            .map_err(|e| UpdateError::QueryDeviceIdsFailed(e.into()))?;
        let record = package
            .find_matching_record(&ids)
            .ok_or(UpdateError::NoMatchInPackage)?;
        self.stage = TaskStage::IdentifyMatched;
        debug!(
            self.log, "device matched package";
            "image_set_version" => record.image_set_version.as_str(),
        );

        self.read_parameters(endpoint, config).await?;
        self.stage = TaskStage::ParametersRead;

        let applicable = self.applicable_components(&record)?;

        let request = RequestUpdateRequest {
            max_transfer_size: config.max_transfer_size,
            // bounded by the package's 16-bit component count
            num_components: applicable.len() as u16,
            max_outstanding_transfer_requests: MAX_OUTSTANDING_TRANSFER_REQUESTS,
            package_data_length: record.package_data.len() as u16,
            version_type: record.image_set_version.string_type,
            version_len: record.image_set_version.wire_len(),
        };
        let command = FwUpdateCommand::RequestUpdate;
        let body = request_body(
            command,
            &request,
            record.image_set_version.wire_bytes(),
        )?;
        let (code, body) =
            call(endpoint, command, &body, &mut self.recv_buf, Duration::ZERO)
                .await?;
        if code == CompletionCode::UNSUPPORTED_COMMAND {
            return Err(UpdateError::RequestUpdateUnsupported);
        }
        if !code.is_success() {
            return Err(UpdateError::RequestUpdateFailed(
                CommandFailure::Completion(code),
            ));
        }
        let response = decode_exact_body::<RequestUpdateResponse>(body)
            .map_err(|e| UpdateError::RequestUpdateFailed(e.into()))?;
        session.update_requested = true;
        if response.fd_metadata_length != 0
            || response.fd_will_send_get_package_data != 0
        {
            return Err(UpdateError::RequestUpdateUnsupported);
        }
        self.stage = TaskStage::UpdateRequested;

        for (position, component) in applicable.iter().enumerate() {
            self.pass_component(endpoint, component, position, applicable.len())
                .await?;
        }
        self.stage = TaskStage::ComponentsPassed;

        let mut activation = ActivationMethods::empty();
        for component in &applicable {
            activation |= self
                .update_component(endpoint, config, progress, session, component)
                .await?;
        }

        let command = FwUpdateCommand::ActivateFirmware;
        let request = ActivateFirmwareRequest { self_contained_activation_request: 0 };
        let body = request_body(command, &request, &[])?;
        let (code, body) = call(
            endpoint,
            command,
            &body,
            &mut self.recv_buf,
            config.activation_extra_wait,
        )
        .await?;
        if !code.is_success() {
            return Err(UpdateError::ActivateFwFailed(CommandFailure::Completion(
                code,
            )));
        }
        let response = decode_body::<ActivateFirmwareResponse>(body)
            .map_err(|e| UpdateError::ActivateFwFailed(e.into()))?;
        self.stage = TaskStage::Activated;
        info!(
            self.log, "firmware activated";
            "activation_methods" => ?activation,
            "estimated_self_contained_secs" =>
                response.estimated_time_for_self_contained_activation,
        );
        Ok(activation)
    }

    async fn read_parameters(
        &mut self,
        endpoint: &mut Endpoint,
        config: &UpdateConfig,
    ) -> Result<()> {
        let (code, body) = call(
            endpoint,
            FwUpdateCommand::GetFirmwareParameters,
            &[],
            &mut self.recv_buf,
            Duration::ZERO,
        )
        .await?;
        if !code.is_success() {
            return Err(UpdateError::GetParamsFailed(CommandFailure::Completion(
                code,
            )));
        }
        FirmwareParameters::decode(body)
            .map_err(|e| UpdateError::GetParamsFailed(e.into()))?;
        if body.len() > config.fw_params_capacity {
            return Err(UpdateError::BufferTooSmall {
                len: body.len(),
                capacity: config.fw_params_capacity,
            });
        }
        self.fw_params.clear();
        self.fw_params.extend_from_slice(body);
        Ok(())
    }

    /// Components whose bitmap bit is set in `record` and that the device
    /// reported parameters for.
    fn applicable_components(
        &self,
        record: &DeviceIdRecord<'a>,
    ) -> Result<Vec<Applicable<'a>>> {
        let params = FirmwareParameters::decode(&self.fw_params)
            .map_err(|e| UpdateError::GetParamsFailed(e.into()))?;
        let applicable: Vec<_> = self
            .package
            .components()
            .filter(|image| record.is_applicable(image.index))
            .filter_map(|image| {
                let entry = params.find(image.classification, image.identifier)?;
                Some(Applicable {
                    image,
                    classification_index: entry.header.classification_index,
                })
            })
            .collect();
        if applicable.is_empty() {
            return Err(UpdateError::NoUpdateComponents);
        }
        debug!(self.log, "applicable components"; "count" => applicable.len());
        Ok(applicable)
    }

    async fn pass_component(
        &mut self,
        endpoint: &mut Endpoint,
        component: &Applicable<'a>,
        position: usize,
        count: usize,
    ) -> Result<()> {
        let image = &component.image;
        let request = PassComponentTableRequest {
            transfer_flag: TransferFlag::for_position(position, count),
            classification: image.classification,
            identifier: image.identifier,
            classification_index: component.classification_index,
            comparison_stamp: image.comparison_stamp,
            version_type: image.version.string_type,
            version_len: image.version.wire_len(),
        };
        let command = FwUpdateCommand::PassComponentTable;
        let body = request_body(command, &request, image.version.wire_bytes())?;
        let (code, body) =
            call(endpoint, command, &body, &mut self.recv_buf, Duration::ZERO)
                .await?;
        let index = image.index;
        if !code.is_success() {
            return Err(UpdateError::PassComponentTableFailed {
                component: index,
                err: CommandFailure::Completion(code),
            });
        }
        let response = decode_exact_body::<PassComponentTableResponse>(body)
            .map_err(|e| UpdateError::PassComponentTableBadRsp {
                component: index,
                err: e.into(),
            })?;
        if response.component_response != 0 {
            return Err(UpdateError::PassComponentTableBadRsp {
                component: index,
                err: BadResponse::Refused {
                    response: response.component_response,
                    code: response.component_response_code,
                },
            });
        }
        Ok(())
    }

    async fn update_component(
        &mut self,
        endpoint: &mut Endpoint,
        config: &UpdateConfig,
        progress: &mut Progress<'_>,
        session: &mut Session,
        component: &Applicable<'a>,
    ) -> Result<ActivationMethods> {
        let image = component.image;
        let index = image.index;
        let mut update_option_flags = UpdateOptionFlags::empty();
        if image.options.contains(ComponentOptions::FORCE_UPDATE) {
            update_option_flags |= UpdateOptionFlags::FORCE_UPDATE;
        }
        let request = UpdateComponentRequest {
            classification: image.classification,
            identifier: image.identifier,
            classification_index: component.classification_index,
            comparison_stamp: image.comparison_stamp,
            image_size: image.size,
            update_option_flags,
            version_type: image.version.string_type,
            version_len: image.version.wire_len(),
        };
        let command = FwUpdateCommand::UpdateComponent;
        let body = request_body(command, &request, image.version.wire_bytes())?;
        let (code, body) =
            call(endpoint, command, &body, &mut self.recv_buf, Duration::ZERO)
                .await?;
        if !code.is_success() {
            return Err(UpdateError::UpdateComponentFailed {
                component: index,
                err: CommandFailure::Completion(code),
            });
        }
        let response = decode_exact_body::<UpdateComponentResponse>(body)
            .map_err(|e| UpdateError::UpdateComponentFailed {
                component: index,
                err: e.into(),
            })?;
        if response.compatibility_response != 0 {
            return Err(UpdateError::UpdateComponentWillNotUpdate {
                component: index,
                code: response.compatibility_response_code,
            });
        }
        session.component_in_flight = true;
        self.last_requested = 0;

        let idle = config.fd_idle_timeout
            + Duration::from_millis(u64::from(
                response.time_before_request_fw_data,
            ));
        info!(
            self.log, "transferring component";
            "component" => index,
            "size" => image.size,
            "version" => image.version.as_str(),
        );

        let notice = self
            .serve_device(
                endpoint,
                config,
                progress,
                &image,
                ResultStage::Transfer,
                idle,
            )
            .await?;
        if !notice.result.is_success() {
            return Err(UpdateError::TransferCompleteResultErr {
                component: index,
                result: notice.result,
            });
        }
        let size = u64::from(image.size);
        self.bytes_requested += size - self.last_requested.min(size);
        self.last_requested = size;
        progress.transferred(self.bytes_requested);
        self.stage = TaskStage::ComponentsTransferred;

        let notice = self
            .serve_device(
                endpoint,
                config,
                progress,
                &image,
                ResultStage::Verify,
                idle,
            )
            .await?;
        if !notice.result.is_success() {
            return Err(UpdateError::VerifyCompleteFailed {
                component: index,
                result: notice.result,
            });
        }
        self.stage = TaskStage::Verified;

        let notice = self
            .serve_device(
                endpoint,
                config,
                progress,
                &image,
                ResultStage::Apply,
                idle,
            )
            .await?;
        if !notice.result.is_success() {
            return Err(UpdateError::ApplyCompleteFailed {
                component: index,
                result: notice.result,
            });
        }
        session.component_in_flight = false;
        self.stage = TaskStage::Applied;

        let activation = if notice.result == ResultCode::SuccessModifiedActivation {
            notice.modification
        } else {
            image.requested_activation_method
        };
        debug!(
            self.log, "component applied";
            "component" => index,
            "activation_methods" => ?activation,
        );
        Ok(activation)
    }

    /// Answers the device's requests until it sends the completion notice
    /// for `stage`. Every RequestFirmwareData restarts the `idle` timer.
    async fn serve_device(
        &mut self,
        endpoint: &mut Endpoint,
        config: &UpdateConfig,
        progress: &mut Progress<'_>,
        image: &ComponentImage<'a>,
        stage: ResultStage,
        idle: Duration,
    ) -> Result<Notice> {
        let notice_command = match stage {
            ResultStage::Transfer => FwUpdateCommand::TransferComplete,
            ResultStage::Verify => FwUpdateCommand::VerifyComplete,
            ResultStage::Apply => FwUpdateCommand::ApplyComplete,
        };
        let mut deadline = Instant::now() + idle;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(UpdateError::RequestFwDataTimeout {
                    component: image.index,
                    timeout: idle,
                });
            }
            let received = match endpoint.recv(remaining, &mut self.recv_buf).await {
                Ok(received) => received,
                Err(TransportError::Timeout(_)) => continue,
                Err(err) => return Err(UpdateError::ReceiveFailed(err)),
            };
            let message = &self.recv_buf[..received.len];
            let (header, body) = CommandHeader::read(message)
                .map_err(|_| UpdateError::ReceiveBadLen { len: message.len() })?;
            if header.msg_type() != MessageType::FwUpdate as u8 {
                return Err(UpdateError::ReceiveBadType {
                    msg_type: header.msg_type(),
                });
            }
            if !header.is_request() {
                debug!(
                    self.log, "ignoring response while serving device";
                    "command" => header.command,
                );
                continue;
            }
            let command = FwUpdateCommand::from_repr(header.command)
                .filter(|c| c.is_device_initiated())
                .ok_or(UpdateError::UnsupportedCmd(header.command))?;

            if command == FwUpdateCommand::RequestFirmwareData {
                let request = decode_exact_body::<RequestFirmwareDataRequest>(body);
                let n = match request {
                    Ok(request) => self.firmware_data(
                        config,
                        progress,
                        image,
                        stage == ResultStage::Transfer,
                        header,
                        request,
                    )?,
                    Err(_) => self.response(
                        command,
                        header,
                        CompletionCode::INVALID_LENGTH,
                    )?,
                };
                let message = &self.send_buf[..n];
                respond(endpoint, command, received.tag, message).await?;
                deadline = Instant::now() + idle;
                continue;
            }

            if command != notice_command {
                debug!(
                    self.log, "device notice out of order";
                    "command" => <&'static str>::from(command),
                );
                let n = self.response(
                    command,
                    header,
                    completion::COMMAND_NOT_EXPECTED,
                )?;
                respond(endpoint, command, received.tag, &self.send_buf[..n]).await?;
                continue;
            }

            let notice = decode_notice(stage, image.index, body);
            let n = self.response(command, header, CompletionCode::SUCCESS)?;
            respond(endpoint, command, received.tag, &self.send_buf[..n]).await?;
            return notice;
        }
    }

    /// Builds the answer to a RequestFirmwareData in `send_buf`, returning
    /// its length.
    fn firmware_data(
        &mut self,
        config: &UpdateConfig,
        progress: &mut Progress<'_>,
        image: &ComponentImage<'a>,
        downloading: bool,
        header: CommandHeader,
        request: RequestFirmwareDataRequest,
    ) -> Result<usize> {
        let command = FwUpdateCommand::RequestFirmwareData;
        let offset = u64::from(request.offset);
        let length = u64::from(request.length);
        let end = offset + length;
        let size = u64::from(image.size);

        trace!(
            self.log, "firmware data requested";
            "offset" => offset,
            "length" => length,
        );
        let code = if !downloading {
            completion::COMMAND_NOT_EXPECTED
        } else if request.length > config.max_transfer_size {
            completion::INVALID_TRANSFER_LENGTH
        } else if end > size + u64::from(config.baseline_transfer_size) {
            completion::DATA_OUT_OF_RANGE
        } else {
            CompletionCode::SUCCESS
        };
        let n = self.response(command, header, code)?;
        if !code.is_success() {
            debug!(self.log, "refusing firmware data request"; "code" => %code);
            return Ok(n);
        }

        if end <= self.last_requested {
            warn!(
                self.log, "device re-requested firmware data";
                "offset" => offset,
                "length" => length,
            );
        } else {
            let last = self.last_requested.min(size);
            self.bytes_requested += end.min(size).saturating_sub(last);
            self.last_requested = end;
            progress.transferred(self.bytes_requested);
        }

        let length = request.length as usize;
        let out = self
            .send_buf
            .get_mut(n..n + length)
            .ok_or(UpdateError::SendReqFailed {
                command: command.into(),
                err: CommunicationError::Command(CommandError::OutputTooSmall),
            })?;
        self.package.read_image(image, request.offset as usize, out);
        Ok(n + length)
    }

    /// Encodes a bodiless response into `send_buf`.
    fn response(
        &mut self,
        command: FwUpdateCommand,
        header: CommandHeader,
        code: CompletionCode,
    ) -> Result<usize> {
        encode_response(&mut self.send_buf, header, code, &(), &[])
            .map_err(|e| send_failure(command, e.into()))
    }

    async fn cancel(&mut self, endpoint: &mut Endpoint, session: &Session) {
        if session.component_in_flight {
            let command = FwUpdateCommand::CancelUpdateComponent;
            match call(endpoint, command, &[], &mut self.recv_buf, Duration::ZERO)
                .await
            {
                Ok((code, _)) if code.is_success() => {
                    debug!(self.log, "component update cancelled");
                }
                Ok((code, _)) => {
                    warn!(self.log, "cancel update component refused"; "code" => %code);
                }
                Err(err) => {
                    warn!(
                        self.log, "cancel update component failed";
                        InlineErrorChain::new(&err),
                    );
                }
            }
        }

        let command = FwUpdateCommand::CancelUpdate;
        match call(endpoint, command, &[], &mut self.recv_buf, Duration::ZERO).await {
            Ok((code, body)) if code.is_success() => {
                match decode_body::<CancelUpdateResponse>(body) {
                    Ok(response) => info!(
                        self.log, "update cancelled";
                        "non_functioning" =>
                            response.non_functioning_component_indication,
                        "non_functioning_bitmap" =>
                            response.non_functioning_component_bitmap,
                    ),
                    Err(err) => warn!(
                        self.log, "malformed cancel update response";
                        InlineErrorChain::new(&err),
                    ),
                }
            }
            Ok((code, _)) => {
                warn!(self.log, "cancel update refused"; "code" => %code);
            }
            Err(err) => {
                warn!(self.log, "cancel update failed"; InlineErrorChain::new(&err));
            }
        }
    }
}

fn send_failure(command: FwUpdateCommand, err: CommunicationError) -> UpdateError {
    UpdateError::SendReqFailed { command: command.into(), err }
}

fn request_body<T: Serialize + SerializedSize>(
    command: FwUpdateCommand,
    fixed: &T,
    trailing: &[u8],
) -> Result<Vec<u8>> {
    let mut body = vec![0; T::MAX_SIZE];
    let n = erot_messages::serialize(&mut body, fixed)
        .map_err(|e| send_failure(command, CommandError::from(e).into()))?;
    body.truncate(n);
    body.extend_from_slice(trailing);
    Ok(body)
}

/// Issues `command` and splits the response into its completion code and
/// body.
async fn call<'b>(
    endpoint: &mut Endpoint,
    command: FwUpdateCommand,
    body: &[u8],
    buf: &'b mut [u8],
    extra_wait: Duration,
) -> Result<(CompletionCode, &'b [u8])> {
    let n = endpoint
        .rpc_call(MessageType::FwUpdate, command as u8, body, buf, extra_wait)
        .await
        .map_err(|err| match err {
            CommunicationError::ExhaustedNumAttempts(attempts) => {
                UpdateError::ReqRetriesExhausted {
                    command: command.into(),
                    attempts,
                }
            }
            err => send_failure(command, err),
        })?;
    let (_, code, body) = CommandHeader::read_response(&buf[..n])
        .map_err(|_| UpdateError::ReceiveBadLen { len: n })?;
    Ok((code, body))
}

async fn respond(
    endpoint: &mut Endpoint,
    command: FwUpdateCommand,
    tag: MessageTag,
    message: &[u8],
) -> Result<()> {
    endpoint
        .send(Direction::Response(tag), message)
        .await
        .map(|_| ())
        .map_err(|err| send_failure(command, err.into()))
}

fn decode_notice(
    stage: ResultStage,
    component: usize,
    body: &[u8],
) -> Result<Notice> {
    let len = body.len();
    match stage {
        ResultStage::Transfer => decode_exact_body::<TransferCompleteRequest>(body)
            .map(|r| Notice {
                result: ResultCode::classify(stage, r.transfer_result),
                modification: ActivationMethods::empty(),
            })
            .map_err(|_| UpdateError::TransferCompleteBadLen { component, len }),
        ResultStage::Verify => decode_exact_body::<VerifyCompleteRequest>(body)
            .map(|r| Notice {
                result: ResultCode::classify(stage, r.verify_result),
                modification: ActivationMethods::empty(),
            })
            .map_err(|_| UpdateError::VerifyCompleteBadLen { component, len }),
        ResultStage::Apply => decode_exact_body::<ApplyCompleteRequest>(body)
            .map(|r| Notice {
                result: ResultCode::classify(stage, r.apply_result),
                modification: r.activation_methods_modification,
            })
            .map_err(|_| UpdateError::ApplyCompleteBadLen { component, len }),
    }
}

/// Owns the firmware update tasks and runs them one after another.
pub struct TaskEngine<'a> {
    config: UpdateConfig,
    tasks: Vec<UpdateTask<'a>>,
    progress: Progress<'a>,
    log: Logger,
}

impl<'a> TaskEngine<'a> {
    /// `progress`, if given, is called with each new overall percentage.
    pub fn init(
        config: UpdateConfig,
        progress: Option<ProgressFn<'a>>,
        log: &Logger,
    ) -> Self {
        Self {
            config,
            tasks: Vec::new(),
            progress: Progress {
                callback: progress,
                reported: 0,
                total: 0,
                finished: 0,
            },
            log: log.new(o!("component" => "TaskEngine")),
        }
    }

    pub fn deinit(self) {
        debug!(self.log, "deinit"; "tasks" => self.tasks.len());
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Creates a task updating `endpoint` from `package`, which is
    /// validated here.
    pub fn create_task(
        &mut self,
        registry: &EndpointRegistry,
        endpoint: EndpointHandle,
        package: &'a [u8],
    ) -> Result<TaskHandle, TaskCreateError> {
        let attributes = registry
            .get(endpoint)
            .ok_or(TaskCreateError::UnknownEndpoint(endpoint.index()))?
            .attributes();
        let package = Package::parse(package)?;
        let handle = TaskHandle(self.tasks.len());
        let log = self.log.new(o!(
            "task" => handle.index(),
            "erot" => attributes.name.clone(),
        ));
        debug!(log, "task created"; "package_len" => package.len());

        self.progress.total += package.len() as u64;
        self.tasks.push(UpdateTask {
            endpoint,
            name: attributes.name.clone(),
            socket: attributes.socket,
            package,
            stage: TaskStage::Created,
            outcome: None,
            fw_params: Vec::with_capacity(self.config.fw_params_capacity),
            bytes_requested: 0,
            last_requested: 0,
            recv_buf: vec![0; self.config.receive_capacity],
            send_buf: vec![
                0;
                RESPONSE_HEADER_SIZE + self.config.max_transfer_size as usize
            ],
            log,
        });
        Ok(handle)
    }

    pub fn tasks(&self) -> &[UpdateTask<'a>] {
        &self.tasks
    }

    pub fn task(&self, handle: TaskHandle) -> Option<&UpdateTask<'a>> {
        self.tasks.get(handle.0)
    }

    /// Runs every task that has not run yet. A failed task does not stop
    /// the others.
    pub async fn execute_all(
        &mut self,
        registry: &mut EndpointRegistry,
    ) -> ExecuteSummary {
        let mut first_error = None;
        let mut activation_methods = ActivationMethods::empty();

        for task in self.tasks.iter_mut().filter(|t| t.outcome.is_none()) {
            let result = match registry.get_mut(task.endpoint) {
                Some(endpoint) => {
                    task.run(endpoint, &self.config, &mut self.progress).await
                }
                None => Err(UpdateError::UnknownEndpoint(task.endpoint.index())),
            };
            self.progress.finished += task.bytes_requested;
            match &result {
                Ok(methods) => activation_methods |= *methods,
                Err(err) => {
                    first_error.get_or_insert_with(|| err.clone());
                }
            }
            task.outcome = Some(result);
        }

        let outcomes: Vec<TaskOutcome> = self
            .tasks
            .iter()
            .filter_map(|task| {
                Some(TaskOutcome {
                    name: task.name.clone(),
                    socket: task.socket,
                    stage: task.stage,
                    result: task.outcome.clone()?,
                })
            })
            .collect();
        if !outcomes.is_empty() && outcomes.iter().all(|o| o.result.is_ok()) {
            self.progress.report(100);
        }
        info!(
            self.log, "all tasks complete";
            "tasks" => outcomes.len(),
            "failed" => outcomes.iter().filter(|o| o.result.is_err()).count(),
            "activation_methods" => ?activation_methods,
        );

        ExecuteSummary { first_error, activation_methods, outcomes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(reports: &mut Vec<u8>) -> Progress<'_> {
        Progress {
            callback: Some(Box::new(move |p| reports.push(p))),
            reported: 0,
            total: 1000,
            finished: 0,
        }
    }

    #[test]
    fn progress_only_increases() {
        let mut reports = Vec::new();
        let mut p = progress(&mut reports);
        p.transferred(100);
        p.transferred(100);
        p.transferred(50);
        p.finished = 500;
        p.transferred(500);
        p.report(100);
        drop(p);
        assert_eq!(reports, vec![9, 99, 100]);
    }

    #[test]
    fn notices_are_classified() {
        let notice = decode_notice(ResultStage::Apply, 0, &[1, 0x08, 0x00]).unwrap();
        assert_eq!(notice.result, ResultCode::SuccessModifiedActivation);
        assert_eq!(notice.modification, ActivationMethods::SYSTEM_REBOOT);

        let notice = decode_notice(ResultStage::Verify, 0, &[0x91]).unwrap();
        assert_eq!(notice.result, ResultCode::Vendor(1));

        assert!(matches!(
            decode_notice(ResultStage::Transfer, 2, &[0, 0]),
            Err(UpdateError::TransferCompleteBadLen { component: 2, len: 2 })
        ));
        assert!(matches!(
            decode_notice(ResultStage::Apply, 1, &[0]),
            Err(UpdateError::ApplyCompleteBadLen { component: 1, len: 1 })
        ));
    }

    #[test]
    fn request_bodies_carry_version() {
        let request = ActivateFirmwareRequest { self_contained_activation_request: 1 };
        let body =
            request_body(FwUpdateCommand::ActivateFirmware, &request, &[0xaa])
                .unwrap();
        assert_eq!(body, vec![1, 0xaa]);
    }
}
