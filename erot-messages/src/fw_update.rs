// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware update command set.
//!
//! Every body here follows the command header (and, for responses, the
//! completion code). Fixed-width fields are little-endian; several bodies
//! end in a version string whose type and length are the last two fixed
//! fields, see [`VersionedBody`].

use crate::command::put_bytes;
use crate::command::CommandError;
use crate::command::CompletionCode;
use crate::HubpackError;
use core::ops::RangeInclusive;
use hubpack::SerializedSize;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

/// Smallest transfer size every firmware device must support.
pub const BASELINE_TRANSFER_SIZE: u32 = 32;

/// Largest chunk we let a device pull with one firmware-data request.
pub const MAX_TRANSFER_SIZE: u32 = 4096;

/// We never allow more than one outstanding firmware-data request.
pub const MAX_OUTSTANDING_TRANSFER_REQUESTS: u8 = 1;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::FromRepr,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum FwUpdateCommand {
    QueryDeviceIdentifiers = 0x01,
    GetFirmwareParameters = 0x02,
    RequestUpdate = 0x10,
    PassComponentTable = 0x13,
    UpdateComponent = 0x14,
    RequestFirmwareData = 0x15,
    TransferComplete = 0x16,
    VerifyComplete = 0x17,
    ApplyComplete = 0x18,
    ActivateFirmware = 0x1a,
    GetStatus = 0x1b,
    CancelUpdateComponent = 0x1c,
    CancelUpdate = 0x1d,
}

impl FwUpdateCommand {
    /// Commands the firmware device sends to us during an update.
    pub fn is_device_initiated(self) -> bool {
        matches!(
            self,
            Self::RequestFirmwareData
                | Self::TransferComplete
                | Self::VerifyComplete
                | Self::ApplyComplete
        )
    }
}

/// Completion codes specific to the firmware update command set.
pub mod completion {
    use crate::command::CompletionCode;

    pub const NOT_IN_UPDATE_MODE: CompletionCode = CompletionCode(0x80);
    pub const ALREADY_IN_UPDATE_MODE: CompletionCode = CompletionCode(0x81);
    pub const DATA_OUT_OF_RANGE: CompletionCode = CompletionCode(0x82);
    pub const INVALID_TRANSFER_LENGTH: CompletionCode = CompletionCode(0x83);
    pub const INVALID_STATE_FOR_COMMAND: CompletionCode = CompletionCode(0x84);
    pub const COMMAND_NOT_EXPECTED: CompletionCode = CompletionCode(0x88);
    pub const RETRY_REQUEST_FW_DATA: CompletionCode = CompletionCode(0x89);
}

/// Version string encodings.
pub mod string_type {
    pub const UNKNOWN: u8 = 0;
    pub const ASCII: u8 = 1;
    pub const UTF8: u8 = 2;
    pub const UTF16: u8 = 3;
    pub const UTF16LE: u8 = 4;
    pub const UTF16BE: u8 = 5;
}

/// Descriptor types we know how to name.
pub mod descriptor_type {
    pub const PCI_VENDOR_ID: u16 = 0x0000;
    pub const IANA_ENTERPRISE_ID: u16 = 0x0001;
    pub const UUID: u16 = 0x0002;
    pub const PNP_VENDOR_ID: u16 = 0x0003;
    pub const ACPI_VENDOR_ID: u16 = 0x0004;
    pub const PCI_DEVICE_ID: u16 = 0x0100;
    pub const PCI_SUBSYSTEM_VENDOR_ID: u16 = 0x0101;
    pub const PCI_SUBSYSTEM_ID: u16 = 0x0102;
    pub const PCI_REVISION_ID: u16 = 0x0103;
    pub const VENDOR_DEFINED: u16 = 0xffff;
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(transparent)]
pub struct ActivationMethods(u16);

bitflags::bitflags! {
    impl ActivationMethods: u16 {
        const AUTOMATIC = 1 << 0;
        const SELF_CONTAINED = 1 << 1;
        const MEDIUM_SPECIFIC_RESET = 1 << 2;
        const SYSTEM_REBOOT = 1 << 3;
        const DC_POWER_CYCLE = 1 << 4;
        const AC_POWER_CYCLE = 1 << 5;
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(transparent)]
pub struct TransferFlag(u8);

bitflags::bitflags! {
    impl TransferFlag: u8 {
        const START = 1 << 0;
        const MIDDLE = 1 << 1;
        const END = 1 << 2;
    }
}

impl TransferFlag {
    /// Position flag for component `index` of `count` in a component table.
    pub fn for_position(index: usize, count: usize) -> Self {
        let mut flag = Self::empty();
        if index == 0 {
            flag |= Self::START;
        }
        if index + 1 == count {
            flag |= Self::END;
        }
        if flag.is_empty() {
            flag = Self::MIDDLE;
        }
        flag
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(transparent)]
pub struct UpdateOptionFlags(u32);

bitflags::bitflags! {
    impl UpdateOptionFlags: u32 {
        const FORCE_UPDATE = 1 << 0;
    }
}

/// Firmware device states reported by GetStatus.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum_macros::FromRepr,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum FdState {
    Idle = 0,
    LearnComponents = 1,
    ReadyXfer = 2,
    Download = 3,
    Verify = 4,
    Apply = 5,
    Activate = 6,
}

/// Which completion notice a result code came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStage {
    Transfer,
    Verify,
    Apply,
}

impl ResultStage {
    const STANDARD_RANGE: RangeInclusive<u8> = 0x00..=0x1f;

    fn vendor_range(self) -> RangeInclusive<u8> {
        match self {
            Self::Transfer => 0x70..=0x8f,
            Self::Verify => 0x90..=0xaf,
            Self::Apply => 0xb0..=0xcf,
        }
    }
}

/// Classified result byte of a transfer, verify or apply completion notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    /// Apply succeeded and the device reports changed activation methods.
    SuccessModifiedActivation,
    /// Failure defined by the command set; offset from the start of the
    /// range.
    Standard(u8),
    /// Vendor-defined failure; offset from the start of the stage's vendor
    /// range.
    Vendor(u8),
    /// Value outside every defined range.
    Unknown(u8),
}

impl ResultCode {
    pub const APPLY_SUCCESS_WITH_ACTIVATION_METHOD: u8 = 0x01;

    pub fn classify(stage: ResultStage, result: u8) -> Self {
        if result == 0 {
            return Self::Success;
        }
        if stage == ResultStage::Apply
            && result == Self::APPLY_SUCCESS_WITH_ACTIVATION_METHOD
        {
            return Self::SuccessModifiedActivation;
        }
        let vendor = stage.vendor_range();
        if ResultStage::STANDARD_RANGE.contains(&result) {
            Self::Standard(result - ResultStage::STANDARD_RANGE.start())
        } else if vendor.contains(&result) {
            Self::Vendor(result - vendor.start())
        } else {
            Self::Unknown(result)
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::SuccessModifiedActivation)
    }
}

/// Type-tagged version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionString<'a> {
    pub string_type: u8,
    pub bytes: &'a [u8],
}

impl<'a> VersionString<'a> {
    pub fn ascii(s: &'a str) -> Self {
        Self { string_type: string_type::ASCII, bytes: s.as_bytes() }
    }

    /// Length as carried on the wire; strings longer than 255 bytes are
    /// truncated.
    pub fn wire_len(&self) -> u8 {
        self.bytes.len().min(usize::from(u8::MAX)) as u8
    }

    pub fn wire_bytes(&self) -> &'a [u8] {
        &self.bytes[..usize::from(self.wire_len())]
    }

    /// Best-effort text form for logging.
    pub fn as_str(&self) -> &'a str {
        core::str::from_utf8(self.bytes).unwrap_or("<non-utf8>")
    }
}

fn take(data: &[u8], n: usize) -> Result<(&[u8], &[u8]), CommandError> {
    if data.len() < n {
        return Err(CommandError::BodyTruncated);
    }
    Ok(data.split_at(n))
}

/// A fixed-width body followed by a version string whose length is one of
/// the fixed fields.
pub trait VersionedBody: Sized + DeserializeOwned {
    fn version_type(&self) -> u8;
    fn version_len(&self) -> u8;

    /// Splits the fixed fields and the version string off `body`, returning
    /// whatever follows the string.
    fn decode_versioned(
        body: &[u8],
    ) -> Result<(Self, VersionString<'_>, &[u8]), CommandError> {
        let (fixed, rest) = hubpack::deserialize::<Self>(body)?;
        let (bytes, rest) = take(rest, usize::from(fixed.version_len()))?;
        let version = VersionString { string_type: fixed.version_type(), bytes };
        Ok((fixed, version, rest))
    }
}

macro_rules! versioned_body {
    ($name:ident) => {
        impl VersionedBody for $name {
            fn version_type(&self) -> u8 {
                self.version_type
            }

            fn version_len(&self) -> u8 {
                self.version_len
            }
        }
    };
}

/// One device or package descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor<'a> {
    pub descriptor_type: u16,
    pub data: &'a [u8],
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
struct DescriptorHeader {
    descriptor_type: u16,
    length: u16,
}

impl Descriptor<'_> {
    pub fn encoded_len(&self) -> usize {
        DescriptorHeader::MAX_SIZE + self.data.len()
    }

    /// Appends this descriptor at `offset` in `out`, returning the new
    /// offset.
    pub fn encode(
        &self,
        out: &mut [u8],
        offset: usize,
    ) -> Result<usize, CommandError> {
        let length = u16::try_from(self.data.len())
            .map_err(|_| CommandError::InvalidBody)?;
        let header =
            DescriptorHeader { descriptor_type: self.descriptor_type, length };
        let n = offset
            + hubpack::serialize(
                out.get_mut(offset..).ok_or(CommandError::OutputTooSmall)?,
                &header,
            )?;
        put_bytes(out, n, self.data)
    }
}

/// Lazily decodes a run of `count` descriptors.
#[derive(Debug, Clone)]
pub struct Descriptors<'a> {
    data: &'a [u8],
    remaining: usize,
}

impl<'a> Descriptors<'a> {
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self { data, remaining: count }
    }

    /// Bytes following the last descriptor, once iteration has finished.
    pub fn rest(&self) -> &'a [u8] {
        self.data
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = Result<Descriptor<'a>, CommandError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let result = hubpack::deserialize::<DescriptorHeader>(self.data)
            .map_err(CommandError::from)
            .and_then(|(header, rest)| {
                let (data, rest) = take(rest, usize::from(header.length))?;
                Ok((Descriptor { descriptor_type: header.descriptor_type, data }, rest))
            });
        match result {
            Ok((descriptor, rest)) => {
                self.data = rest;
                Some(Ok(descriptor))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
struct DeviceIdentifiersHeader {
    length: u32,
    count: u8,
}

/// Body of a QueryDeviceIdentifiers response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentifiers<'a> {
    pub count: u8,
    descriptors: &'a [u8],
}

impl<'a> DeviceIdentifiers<'a> {
    /// Decodes the body, requiring its descriptor length field to cover
    /// exactly the remaining bytes.
    pub fn decode(body: &'a [u8]) -> Result<Self, CommandError> {
        let (header, rest) =
            hubpack::deserialize::<DeviceIdentifiersHeader>(body)?;
        if header.length as usize != rest.len() {
            return Err(CommandError::LengthMismatch {
                expected: DeviceIdentifiersHeader::MAX_SIZE
                    + header.length as usize,
                got: body.len(),
            });
        }
        let ids = Self { count: header.count, descriptors: rest };
        for descriptor in ids.iter() {
            descriptor?;
        }
        Ok(ids)
    }

    pub fn iter(&self) -> Descriptors<'a> {
        Descriptors::new(self.descriptors, usize::from(self.count))
    }

    pub fn contains(&self, needle: &Descriptor<'_>) -> bool {
        self.iter().any(|d| d.map(|d| d == *needle).unwrap_or(false))
    }

    pub fn encode(
        descriptors: &[Descriptor<'_>],
        out: &mut [u8],
    ) -> Result<usize, CommandError> {
        let length: usize = descriptors.iter().map(Descriptor::encoded_len).sum();
        let header = DeviceIdentifiersHeader {
            length: u32::try_from(length).map_err(|_| CommandError::InvalidBody)?,
            count: u8::try_from(descriptors.len())
                .map_err(|_| CommandError::InvalidBody)?,
        };
        let mut n = hubpack::serialize(out, &header)?;
        for descriptor in descriptors {
            n = descriptor.encode(out, n)?;
        }
        Ok(n)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct FirmwareParametersHeader {
    pub capabilities_during_update: u32,
    pub component_count: u16,
    pub active_version_type: u8,
    pub active_version_len: u8,
    pub pending_version_type: u8,
    pub pending_version_len: u8,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct ComponentParametersHeader {
    pub classification: u16,
    pub identifier: u16,
    pub classification_index: u8,
    pub active_comparison_stamp: u32,
    pub active_version_type: u8,
    pub active_version_len: u8,
    pub active_release_date: [u8; 8],
    pub pending_comparison_stamp: u32,
    pub pending_version_type: u8,
    pub pending_version_len: u8,
    pub pending_release_date: [u8; 8],
    pub activation_methods: ActivationMethods,
    pub capabilities_during_update: u32,
}

/// One component entry of a GetFirmwareParameters response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentParameters<'a> {
    pub header: ComponentParametersHeader,
    pub active_version: &'a [u8],
    pub pending_version: &'a [u8],
}

impl ComponentParameters<'_> {
    fn decode(data: &[u8]) -> Result<(ComponentParameters<'_>, &[u8]), CommandError> {
        let (header, rest) =
            hubpack::deserialize::<ComponentParametersHeader>(data)?;
        let (active_version, rest) =
            take(rest, usize::from(header.active_version_len))?;
        let (pending_version, rest) =
            take(rest, usize::from(header.pending_version_len))?;
        Ok((ComponentParameters { header, active_version, pending_version }, rest))
    }

    fn encode(&self, out: &mut [u8], offset: usize) -> Result<usize, CommandError> {
        let mut header = self.header;
        header.active_version_len = wire_len(self.active_version)?;
        header.pending_version_len = wire_len(self.pending_version)?;
        let n = offset
            + hubpack::serialize(
                out.get_mut(offset..).ok_or(CommandError::OutputTooSmall)?,
                &header,
            )?;
        let n = put_bytes(out, n, self.active_version)?;
        put_bytes(out, n, self.pending_version)
    }
}

fn wire_len(bytes: &[u8]) -> Result<u8, CommandError> {
    u8::try_from(bytes.len()).map_err(|_| CommandError::InvalidBody)
}

/// Body of a GetFirmwareParameters response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareParameters<'a> {
    pub header: FirmwareParametersHeader,
    pub active_version: &'a [u8],
    pub pending_version: &'a [u8],
    components: &'a [u8],
}

impl<'a> FirmwareParameters<'a> {
    /// Decodes the body, requiring the component table to end exactly at
    /// the end of `body`.
    pub fn decode(body: &'a [u8]) -> Result<Self, CommandError> {
        let (header, rest) =
            hubpack::deserialize::<FirmwareParametersHeader>(body)?;
        let (active_version, rest) =
            take(rest, usize::from(header.active_version_len))?;
        let (pending_version, components) =
            take(rest, usize::from(header.pending_version_len))?;

        let mut tail = components;
        for _ in 0..header.component_count {
            let (_, rest) = ComponentParameters::decode(tail)?;
            tail = rest;
        }
        if !tail.is_empty() {
            return Err(CommandError::LengthMismatch {
                expected: body.len() - tail.len(),
                got: body.len(),
            });
        }

        Ok(Self { header, active_version, pending_version, components })
    }

    pub fn components(&self) -> impl Iterator<Item = ComponentParameters<'a>> {
        let mut data = self.components;
        (0..self.header.component_count).map_while(move |_| {
            // decode() already walked every entry successfully
            let (component, rest) = ComponentParameters::decode(data).ok()?;
            data = rest;
            Some(component)
        })
    }

    /// The entry for the component with the given classification and
    /// identifier, if the device reported one.
    pub fn find(
        &self,
        classification: u16,
        identifier: u16,
    ) -> Option<ComponentParameters<'a>> {
        self.components().find(|c| {
            c.header.classification == classification
                && c.header.identifier == identifier
        })
    }

    pub fn encode(
        capabilities_during_update: u32,
        active: VersionString<'_>,
        pending: VersionString<'_>,
        components: &[ComponentParameters<'_>],
        out: &mut [u8],
    ) -> Result<usize, CommandError> {
        let header = FirmwareParametersHeader {
            capabilities_during_update,
            component_count: u16::try_from(components.len())
                .map_err(|_| CommandError::InvalidBody)?,
            active_version_type: active.string_type,
            active_version_len: active.wire_len(),
            pending_version_type: pending.string_type,
            pending_version_len: pending.wire_len(),
        };
        let n = hubpack::serialize(out, &header)?;
        let n = put_bytes(out, n, active.wire_bytes())?;
        let mut n = put_bytes(out, n, pending.wire_bytes())?;
        for component in components {
            n = component.encode(out, n)?;
        }
        Ok(n)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct RequestUpdateRequest {
    pub max_transfer_size: u32,
    pub num_components: u16,
    pub max_outstanding_transfer_requests: u8,
    pub package_data_length: u16,
    pub version_type: u8,
    pub version_len: u8,
}
versioned_body!(RequestUpdateRequest);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct RequestUpdateResponse {
    pub fd_metadata_length: u16,
    pub fd_will_send_get_package_data: u8,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct PassComponentTableRequest {
    pub transfer_flag: TransferFlag,
    pub classification: u16,
    pub identifier: u16,
    pub classification_index: u8,
    pub comparison_stamp: u32,
    pub version_type: u8,
    pub version_len: u8,
}
versioned_body!(PassComponentTableRequest);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct PassComponentTableResponse {
    /// Zero if the component can be updated.
    pub component_response: u8,
    pub component_response_code: u8,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct UpdateComponentRequest {
    pub classification: u16,
    pub identifier: u16,
    pub classification_index: u8,
    pub comparison_stamp: u32,
    pub image_size: u32,
    pub update_option_flags: UpdateOptionFlags,
    pub version_type: u8,
    pub version_len: u8,
}
versioned_body!(UpdateComponentRequest);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct UpdateComponentResponse {
    /// Zero if the device will update the component.
    pub compatibility_response: u8,
    pub compatibility_response_code: u8,
    pub update_option_flags_enabled: UpdateOptionFlags,
    /// Milliseconds the device may wait before its first data request.
    pub time_before_request_fw_data: u16,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct RequestFirmwareDataRequest {
    pub offset: u32,
    pub length: u32,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct TransferCompleteRequest {
    pub transfer_result: u8,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct VerifyCompleteRequest {
    pub verify_result: u8,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct ApplyCompleteRequest {
    pub apply_result: u8,
    pub activation_methods_modification: ActivationMethods,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct ActivateFirmwareRequest {
    pub self_contained_activation_request: u8,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct ActivateFirmwareResponse {
    /// Seconds.
    pub estimated_time_for_self_contained_activation: u16,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct GetStatusResponse {
    pub current_state: u8,
    pub previous_state: u8,
    pub aux_state: u8,
    pub aux_state_status: u8,
    pub progress_percent: u8,
    pub reason_code: u8,
    pub update_option_flags_enabled: UpdateOptionFlags,
}

impl GetStatusResponse {
    pub fn current_state(&self) -> Option<FdState> {
        FdState::from_repr(self.current_state)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct CancelUpdateResponse {
    pub non_functioning_component_indication: u8,
    pub non_functioning_component_bitmap: u64,
}

/// Decodes a fixed-width body, requiring at least `T::MAX_SIZE` bytes.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, CommandError> {
    let (value, _) = hubpack::deserialize::<T>(body)?;
    Ok(value)
}

/// Decodes a fixed-width body that must be exactly `T::MAX_SIZE` bytes.
pub fn decode_exact_body<T: DeserializeOwned + SerializedSize>(
    body: &[u8],
) -> Result<T, CommandError> {
    if body.len() != T::MAX_SIZE {
        return Err(CommandError::LengthMismatch {
            expected: T::MAX_SIZE,
            got: body.len(),
        });
    }
    decode_body(body)
}

/// Maps a hubpack failure on a body we produced ourselves.
pub(crate) fn encode_failure(err: HubpackError) -> CompletionCode {
    match err {
        HubpackError::Overrun => CompletionCode::INVALID_LENGTH,
        _ => CompletionCode::ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_round_trip() {
        assert_eq!(
            FwUpdateCommand::from_repr(0x15),
            Some(FwUpdateCommand::RequestFirmwareData)
        );
        assert_eq!(FwUpdateCommand::from_repr(0x11), None);
        assert!(FwUpdateCommand::ApplyComplete.is_device_initiated());
        assert!(!FwUpdateCommand::ActivateFirmware.is_device_initiated());
        let name: &'static str = FwUpdateCommand::PassComponentTable.into();
        assert_eq!(name, "pass_component_table");
    }

    #[test]
    fn result_classification() {
        use ResultCode::*;
        assert_eq!(ResultCode::classify(ResultStage::Transfer, 0), Success);
        assert_eq!(ResultCode::classify(ResultStage::Transfer, 1), Standard(1));
        assert_eq!(
            ResultCode::classify(ResultStage::Apply, 1),
            SuccessModifiedActivation
        );
        assert_eq!(ResultCode::classify(ResultStage::Transfer, 0x72), Vendor(2));
        assert_eq!(ResultCode::classify(ResultStage::Verify, 0x72), Unknown(0x72));
        assert_eq!(ResultCode::classify(ResultStage::Verify, 0x91), Vendor(1));
        assert_eq!(ResultCode::classify(ResultStage::Apply, 0xcf), Vendor(0x1f));
        assert!(!Standard(3).is_success());
    }

    #[test]
    fn transfer_flag_positions() {
        assert_eq!(
            TransferFlag::for_position(0, 1),
            TransferFlag::START | TransferFlag::END
        );
        assert_eq!(TransferFlag::for_position(0, 3), TransferFlag::START);
        assert_eq!(TransferFlag::for_position(1, 3), TransferFlag::MIDDLE);
        assert_eq!(TransferFlag::for_position(2, 3), TransferFlag::END);
    }

    #[test]
    fn versioned_body_layout() {
        let body = RequestUpdateRequest {
            max_transfer_size: 4096,
            num_components: 2,
            max_outstanding_transfer_requests: 1,
            package_data_length: 0,
            version_type: string_type::ASCII,
            version_len: 3,
        };
        let mut buf = [0; 32];
        let n = hubpack::serialize(&mut buf, &body).unwrap();
        assert_eq!(n, RequestUpdateRequest::MAX_SIZE);
        assert_eq!(&buf[..n], &[0, 0x10, 0, 0, 2, 0, 1, 0, 0, 1, 3]);
        buf[n..n + 4].copy_from_slice(b"1.2x");

        let (decoded, version, rest) =
            RequestUpdateRequest::decode_versioned(&buf[..n + 4]).unwrap();
        assert_eq!(decoded, body);
        assert_eq!(version.bytes, b"1.2");
        assert_eq!(rest, b"x");

        assert_eq!(
            RequestUpdateRequest::decode_versioned(&buf[..n + 2]),
            Err(CommandError::BodyTruncated)
        );
    }

    #[test]
    fn device_identifiers_length_is_exact() {
        let descriptors = [
            Descriptor { descriptor_type: descriptor_type::PCI_VENDOR_ID, data: &[0xde, 0x10] },
            Descriptor { descriptor_type: descriptor_type::VENDOR_DEFINED, data: b"EROT" },
        ];
        let mut buf = [0; 64];
        let n = DeviceIdentifiers::encode(&descriptors, &mut buf).unwrap();
        assert_eq!(n, 5 + 6 + 8);

        let ids = DeviceIdentifiers::decode(&buf[..n]).unwrap();
        assert_eq!(ids.count, 2);
        assert!(ids.contains(&descriptors[1]));
        assert!(!ids.contains(&Descriptor {
            descriptor_type: descriptor_type::PCI_VENDOR_ID,
            data: &[0xde, 0x11],
        }));

        assert!(matches!(
            DeviceIdentifiers::decode(&buf[..n + 1]),
            Err(CommandError::LengthMismatch { .. })
        ));
    }

    fn component(id: u16, active: &'static [u8]) -> ComponentParameters<'static> {
        ComponentParameters {
            header: ComponentParametersHeader {
                classification: 0x000a,
                identifier: id,
                classification_index: 0,
                active_comparison_stamp: 1,
                active_version_type: string_type::ASCII,
                active_version_len: 0,
                active_release_date: [0; 8],
                pending_comparison_stamp: 0,
                pending_version_type: string_type::UNKNOWN,
                pending_version_len: 0,
                pending_release_date: [0; 8],
                activation_methods: ActivationMethods::SYSTEM_REBOOT,
                capabilities_during_update: 0,
            },
            active_version: active,
            pending_version: &[],
        }
    }

    #[test]
    fn firmware_parameters_walk() {
        let components = [component(1, b"v1"), component(2, b"v22")];
        let mut buf = [0; 256];
        let n = FirmwareParameters::encode(
            0,
            VersionString::ascii("set-1"),
            VersionString { string_type: string_type::UNKNOWN, bytes: &[] },
            &components,
            &mut buf,
        )
        .unwrap();

        let params = FirmwareParameters::decode(&buf[..n]).unwrap();
        assert_eq!(params.active_version, b"set-1");
        assert_eq!(params.components().count(), 2);
        let found = params.find(0x000a, 2).unwrap();
        assert_eq!(found.active_version, b"v22");
        assert_eq!(found.header.active_version_len, 3);
        assert!(params.find(0x000a, 3).is_none());

        assert!(matches!(
            FirmwareParameters::decode(&buf[..n + 2]),
            Err(CommandError::LengthMismatch { .. })
        ));
        assert!(FirmwareParameters::decode(&buf[..n - 1]).is_err());
    }

    #[test]
    fn exact_body_length() {
        let mut buf = [0; 8];
        let n = hubpack::serialize(
            &mut buf,
            &ActivateFirmwareResponse {
                estimated_time_for_self_contained_activation: 30,
            },
        )
        .unwrap();
        assert_eq!(n, 2);
        assert!(decode_exact_body::<ActivateFirmwareResponse>(&buf[..2]).is_ok());
        assert_eq!(
            decode_exact_body::<ActivateFirmwareResponse>(&buf[..3]),
            Err(CommandError::LengthMismatch { expected: 2, got: 3 })
        );
    }
}
