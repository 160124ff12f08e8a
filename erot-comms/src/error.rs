// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use erot_messages::command::CommandError;
use erot_messages::command::ResponseMismatch;
use erot_messages::fw_update::ResultCode;
use erot_messages::package::PackageError;
use erot_messages::transport::HeaderError;
use erot_messages::transport::ReassemblyError;
use erot_messages::CompletionCode;
use erot_messages::MessageTag;
use slog_error_chain::SlogInlineError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, SlogInlineError)]
pub enum BusError {
    #[error("bus transaction on chip select {chip_select} failed: {reason}")]
    Transaction { chip_select: u8, reason: String },
    #[error("no device behind chip select {0}")]
    NoDevice(u8),
}

#[derive(Debug, Clone, Error, SlogInlineError)]
pub enum TransportError {
    #[error("bus transaction failed")]
    Bus(#[from] BusError),
    #[error("malformed packet")]
    Header(#[from] HeaderError),
    #[error("message reassembly failed")]
    Reassembly(#[from] ReassemblyError),
    #[error("no complete message within {0:?}")]
    Timeout(Duration),
    #[error("response tag {got} does not match request tag {expected}")]
    TagMismatch { expected: MessageTag, got: MessageTag },
    #[error("set endpoint ID failed: {0}")]
    SetEndpointIdRejected(CompletionCode),
    #[error("malformed set endpoint ID response")]
    BadSetEndpointIdResponse(#[source] CommandError),
    #[error("set endpoint ID response does not match request")]
    SetEndpointIdMismatch(#[source] ResponseMismatch),
}

#[derive(Debug, Clone, Error, SlogInlineError)]
pub enum CommunicationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("response does not match request")]
    ResponseMismatch(#[from] ResponseMismatch),
    #[error("malformed message")]
    Command(#[from] CommandError),
    #[error("every instance ID is awaiting a response")]
    InstanceIdsExhausted,
    #[error("RPC call failed (gave up after {0} attempts)")]
    ExhaustedNumAttempts(usize),
}

#[derive(Debug, Clone, Error, SlogInlineError)]
pub enum RegistryError {
    #[error("registry is full ({capacity} endpoints)")]
    Full { capacity: usize },
    #[error("socket {0} already has an endpoint")]
    DuplicateSocket(u8),
    #[error("failed to probe EROT on socket {socket}")]
    Probe {
        socket: u8,
        #[source]
        err: TransportError,
    },
}

#[derive(Debug, Clone, Error, SlogInlineError)]
pub enum BroadcastError {
    #[error(transparent)]
    Communication(#[from] CommunicationError),
    #[error("response rejected by validator")]
    Rejected,
}

/// Why a device answered a command unsuccessfully.
#[derive(Debug, Clone, Error, SlogInlineError)]
pub enum CommandFailure {
    #[error("device returned {0}")]
    Completion(CompletionCode),
    #[error("malformed response body")]
    Malformed(#[from] CommandError),
}

#[derive(Debug, Clone, Error, SlogInlineError)]
pub enum BadResponse {
    #[error("malformed response body")]
    Malformed(#[from] CommandError),
    #[error("device refused component (response {response}, code {code:#x})")]
    Refused { response: u8, code: u8 },
}

/// Terminal failure of one firmware update task.
#[derive(Debug, Clone, Error, SlogInlineError)]
pub enum UpdateError {
    #[error("no device identifier record in the package matches the device")]
    NoMatchInPackage,
    #[error("query device identifiers failed")]
    QueryDeviceIdsFailed(#[source] CommandFailure),
    #[error("get firmware parameters failed")]
    GetParamsFailed(#[source] CommandFailure),
    #[error("firmware parameters are {len} bytes, buffer holds {capacity}")]
    BufferTooSmall { len: usize, capacity: usize },
    #[error("package has no components applicable to the device")]
    NoUpdateComponents,
    #[error("device does not support this update request")]
    RequestUpdateUnsupported,
    #[error("request update failed")]
    RequestUpdateFailed(#[source] CommandFailure),
    #[error("bad pass component table response for component {component}")]
    PassComponentTableBadRsp {
        component: usize,
        #[source]
        err: BadResponse,
    },
    #[error("pass component table failed for component {component}")]
    PassComponentTableFailed {
        component: usize,
        #[source]
        err: CommandFailure,
    },
    #[error("device will not update component {component} (code {code:#x})")]
    UpdateComponentWillNotUpdate { component: usize, code: u8 },
    #[error("update component failed for component {component}")]
    UpdateComponentFailed {
        component: usize,
        #[source]
        err: CommandFailure,
    },
    #[error("transfer complete for component {component} has bad length {len}")]
    TransferCompleteBadLen { component: usize, len: usize },
    #[error("transfer of component {component} failed: {result:?}")]
    TransferCompleteResultErr { component: usize, result: ResultCode },
    #[error("verify complete for component {component} has bad length {len}")]
    VerifyCompleteBadLen { component: usize, len: usize },
    #[error("verify of component {component} failed: {result:?}")]
    VerifyCompleteFailed { component: usize, result: ResultCode },
    #[error("apply complete for component {component} has bad length {len}")]
    ApplyCompleteBadLen { component: usize, len: usize },
    #[error("apply of component {component} failed: {result:?}")]
    ApplyCompleteFailed { component: usize, result: ResultCode },
    #[error("activate firmware failed")]
    ActivateFwFailed(#[source] CommandFailure),
    #[error("received message of {len} bytes is too short")]
    ReceiveBadLen { len: usize },
    #[error("received message of unexpected type {msg_type:#x}")]
    ReceiveBadType { msg_type: u8 },
    #[error("failed to receive from device")]
    ReceiveFailed(#[source] TransportError),
    #[error("failed to send {command}")]
    SendReqFailed {
        command: &'static str,
        #[source]
        err: CommunicationError,
    },
    #[error("{command} failed after {attempts} attempts")]
    ReqRetriesExhausted { command: &'static str, attempts: usize },
    #[error("device sent unsupported command {0:#x}")]
    UnsupportedCmd(u8),
    #[error("no request from device for component {component} within {timeout:?}")]
    RequestFwDataTimeout { component: usize, timeout: Duration },
    #[error("endpoint {0} is not registered")]
    UnknownEndpoint(usize),
}

#[derive(Debug, Clone, Error, SlogInlineError)]
pub enum TaskCreateError {
    #[error("endpoint {0} is not registered")]
    UnknownEndpoint(usize),
    #[error("invalid firmware update package")]
    Package(#[from] PackageError),
}
