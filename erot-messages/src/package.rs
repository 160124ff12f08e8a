// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware update package parsing and validation.
//!
//! A package is a header (identifier, revision, version, device-identifier
//! records, component image table, checksum) followed by the component
//! images themselves. [`Package::parse`] validates the whole layout up
//! front so later accessors can walk it without re-checking bounds.

use crate::fw_update::ActivationMethods;
use crate::fw_update::Descriptor;
use crate::fw_update::Descriptors;
use crate::fw_update::DeviceIdentifiers;
use crate::fw_update::VersionString;
use core::fmt;
use core::mem;
use static_assertions::const_assert_eq;
use uuid::Uuid;
use zerocopy::byteorder::LittleEndian;
use zerocopy::byteorder::U16;
use zerocopy::byteorder::U32;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const FORMAT_REVISION_1: u8 = 1;
pub const FORMAT_REVISION_2: u8 = 2;

/// Package identifier for format revision 1.
pub const IDENTIFIER_V1_0: Uuid = Uuid::from_bytes([
    0xf0, 0x18, 0x87, 0x8c, 0xcb, 0x7d, 0x49, 0x43, 0x98, 0x00, 0xa0, 0x2f,
    0x05, 0x9a, 0xca, 0x02,
]);

/// Package identifier for format revision 2.
pub const IDENTIFIER_V1_1: Uuid = Uuid::from_bytes([
    0x12, 0x44, 0xd2, 0x64, 0x8d, 0x7d, 0x47, 0x18, 0xa0, 0x30, 0xfc, 0x8a,
    0x56, 0x58, 0x7d, 0x5a,
]);

const CHECKSUM_SIZE: usize = mem::size_of::<u32>();

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
struct RawHeader {
    identifier: [u8; 16],
    format_revision: u8,
    size: U16<LittleEndian>,
    release_date_time: [u8; 13],
    component_bitmap_bit_length: U16<LittleEndian>,
    version_type: u8,
    version_len: u8,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
struct RawDeviceRecord {
    length: U16<LittleEndian>,
    descriptor_count: u8,
    update_option_flags: U32<LittleEndian>,
    version_type: u8,
    version_len: u8,
    package_data_length: U16<LittleEndian>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
struct RawComponentImage {
    classification: U16<LittleEndian>,
    identifier: U16<LittleEndian>,
    comparison_stamp: U32<LittleEndian>,
    options: U16<LittleEndian>,
    requested_activation_method: U16<LittleEndian>,
    location_offset: U32<LittleEndian>,
    size: U32<LittleEndian>,
    version_type: u8,
    version_len: u8,
}

const_assert_eq!(mem::size_of::<RawHeader>(), 36);
const_assert_eq!(mem::size_of::<RawDeviceRecord>(), 11);
const_assert_eq!(mem::size_of::<RawComponentImage>(), 22);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct ComponentOptions(u16);

bitflags::bitflags! {
    impl ComponentOptions: u16 {
        const FORCE_UPDATE = 1 << 0;
        const USE_COMPARISON_STAMP = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageError {
    /// Fewer bytes than the header (or its declared size) needs.
    TooShort { len: usize, needed: usize },
    UnsupportedRevision(u8),
    /// Identifier does not match the one for the declared revision.
    BadIdentifier,
    ChecksumMismatch { stored: u32, computed: u32 },
    /// Component bitmap length is not a whole number of bytes.
    BadBitmapLength(u16),
    /// Header areas do not add up to the declared header size.
    HeaderSizeMismatch { computed: usize, declared: usize },
    /// Header plus component images do not add up to the package length.
    PackageSizeMismatch { computed: usize, actual: usize },
    MalformedDeviceRecord { index: usize },
    MalformedComponent { index: usize },
    /// A component image lies (partly) outside the package.
    ImageOutOfBounds { index: usize },
}

impl fmt::Display for PackageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len, needed } => {
                write!(f, "package is {len} bytes, need at least {needed}")
            }
            Self::UnsupportedRevision(rev) => {
                write!(f, "unsupported package format revision {rev}")
            }
            Self::BadIdentifier => write!(f, "invalid package identifier"),
            Self::ChecksumMismatch { stored, computed } => write!(
                f,
                "header checksum {stored:#010x} != computed {computed:#010x}"
            ),
            Self::BadBitmapLength(len) => {
                write!(f, "invalid component bitmap length {len}")
            }
            Self::HeaderSizeMismatch { computed, declared } => {
                write!(f, "header size {computed} != declared {declared}")
            }
            Self::PackageSizeMismatch { computed, actual } => {
                write!(f, "package size {computed} != actual {actual}")
            }
            Self::MalformedDeviceRecord { index } => {
                write!(f, "malformed device identifier record {index}")
            }
            Self::MalformedComponent { index } => {
                write!(f, "malformed component image entry {index}")
            }
            Self::ImageOutOfBounds { index } => {
                write!(f, "component image {index} lies outside the package")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PackageError {}

/// CRC-32 (IEEE 802.3, reflected) as used for the package header checksum.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn split(data: &[u8], n: usize) -> Option<(&[u8], &[u8])> {
    if data.len() < n {
        None
    } else {
        Some(data.split_at(n))
    }
}

/// One device-identifier record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdRecord<'a> {
    pub descriptor_count: u8,
    pub update_option_flags: u32,
    pub image_set_version: VersionString<'a>,
    pub package_data: &'a [u8],
    applicable_components: &'a [u8],
    descriptors: &'a [u8],
}

impl<'a> DeviceIdRecord<'a> {
    fn parse(data: &'a [u8], bitmap_len: usize) -> Option<(Self, &'a [u8])> {
        let (raw, _) = RawDeviceRecord::read_from_prefix(data).ok()?;
        let (record, rest) = split(data, usize::from(raw.length.get()))?;
        let (_, body) = split(record, mem::size_of::<RawDeviceRecord>())?;
        let (applicable_components, body) = split(body, bitmap_len)?;
        let (version, body) = split(body, usize::from(raw.version_len))?;

        // descriptors are variable length; walk them to find where the
        // package data starts
        let mut walk = Descriptors::new(body, usize::from(raw.descriptor_count));
        for descriptor in walk.by_ref() {
            descriptor.ok()?;
        }
        let after = walk.rest();
        let descriptors = &body[..body.len() - after.len()];
        let (package_data, _) =
            split(after, usize::from(raw.package_data_length.get()))?;

        let parsed = Self {
            descriptor_count: raw.descriptor_count,
            update_option_flags: raw.update_option_flags.get(),
            image_set_version: VersionString {
                string_type: raw.version_type,
                bytes: version,
            },
            package_data,
            applicable_components,
            descriptors,
        };
        Some((parsed, rest))
    }

    pub fn descriptors(&self) -> Descriptors<'a> {
        Descriptors::new(self.descriptors, usize::from(self.descriptor_count))
    }

    /// Whether component `index` of the package applies to devices matching
    /// this record.
    pub fn is_applicable(&self, index: usize) -> bool {
        self.applicable_components
            .get(index / 8)
            .map(|byte| byte & (1 << (index % 8)) != 0)
            .unwrap_or(false)
    }

    /// A record matches a device when every one of its descriptors appears
    /// in the device's identifier list.
    pub fn matches(&self, device: &DeviceIdentifiers<'_>) -> bool {
        self.descriptors().all(|d| match d {
            Ok(d) => device.contains(&d),
            Err(_) => false,
        })
    }
}

/// Iterator over the records of one device-identifier area.
#[derive(Debug, Clone)]
pub struct DeviceIdRecords<'a> {
    data: &'a [u8],
    remaining: usize,
    bitmap_len: usize,
}

impl<'a> Iterator for DeviceIdRecords<'a> {
    type Item = DeviceIdRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        // every record was validated by `Package::parse`
        let (record, rest) = DeviceIdRecord::parse(self.data, self.bitmap_len)?;
        self.data = rest;
        Some(record)
    }
}

/// One entry of the component image table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentImage<'a> {
    /// Position in the component image table.
    pub index: usize,
    pub classification: u16,
    pub identifier: u16,
    pub comparison_stamp: u32,
    pub options: ComponentOptions,
    pub requested_activation_method: ActivationMethods,
    pub location_offset: u32,
    pub size: u32,
    pub version: VersionString<'a>,
}

impl<'a> ComponentImage<'a> {
    fn parse(data: &'a [u8], index: usize) -> Option<(Self, &'a [u8])> {
        let (raw, rest) = RawComponentImage::read_from_prefix(data).ok()?;
        let (version, rest) = split(rest, usize::from(raw.version_len))?;
        let image = Self {
            index,
            classification: raw.classification.get(),
            identifier: raw.identifier.get(),
            comparison_stamp: raw.comparison_stamp.get(),
            options: ComponentOptions::from_bits_retain(raw.options.get()),
            requested_activation_method: ActivationMethods::from_bits_retain(
                raw.requested_activation_method.get(),
            ),
            location_offset: raw.location_offset.get(),
            size: raw.size.get(),
            version: VersionString { string_type: raw.version_type, bytes: version },
        };
        Some((image, rest))
    }
}

#[derive(Debug, Clone)]
pub struct ComponentImages<'a> {
    data: &'a [u8],
    index: usize,
    count: usize,
}

impl<'a> Iterator for ComponentImages<'a> {
    type Item = ComponentImage<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index == self.count {
            return None;
        }
        let (image, rest) = ComponentImage::parse(self.data, self.index)?;
        self.data = rest;
        self.index += 1;
        Some(image)
    }
}

fn area_len(
    data: &[u8],
    bitmap_len: usize,
) -> Result<(usize, usize), usize> {
    let (&count, mut rest) = data.split_first().ok_or(0usize)?;
    let count = usize::from(count);
    for index in 0..count {
        let (_, next) = DeviceIdRecord::parse(rest, bitmap_len).ok_or(index)?;
        rest = next;
    }
    Ok((count, data.len() - rest.len()))
}

/// A validated firmware update package.
#[derive(Debug, Clone, Copy)]
pub struct Package<'a> {
    data: &'a [u8],
    identifier: Uuid,
    format_revision: u8,
    header_size: usize,
    release_date_time: [u8; 13],
    bitmap_len: usize,
    version: VersionString<'a>,
    fw_device_area: &'a [u8],
    fw_device_count: usize,
    downstream_area: Option<(&'a [u8], usize)>,
    component_area: &'a [u8],
    component_count: usize,
}

impl<'a> Package<'a> {
    /// Parses `data` and checks identifier, checksum, bitmap length and that
    /// every area adds up to both the declared header size and the total
    /// package length.
    pub fn parse(data: &'a [u8]) -> Result<Self, PackageError> {
        let (raw, _) = RawHeader::read_from_prefix(data).map_err(|_| {
            PackageError::TooShort {
                len: data.len(),
                needed: mem::size_of::<RawHeader>(),
            }
        })?;
        let header_size = usize::from(raw.size.get());
        if data.len() < header_size
            || header_size < mem::size_of::<RawHeader>() + CHECKSUM_SIZE
        {
            return Err(PackageError::TooShort {
                len: data.len(),
                needed: header_size.max(mem::size_of::<RawHeader>()),
            });
        }

        let expected_identifier = match raw.format_revision {
            FORMAT_REVISION_1 => IDENTIFIER_V1_0,
            FORMAT_REVISION_2 => IDENTIFIER_V1_1,
            other => return Err(PackageError::UnsupportedRevision(other)),
        };
        let identifier = Uuid::from_bytes(raw.identifier);
        if identifier != expected_identifier {
            return Err(PackageError::BadIdentifier);
        }

        let crc_offset = header_size - CHECKSUM_SIZE;
        let crc_bytes = &data[crc_offset..header_size];
        let stored = u32::from_le_bytes([
            crc_bytes[0],
            crc_bytes[1],
            crc_bytes[2],
            crc_bytes[3],
        ]);
        let computed = crc32(&data[..crc_offset]);
        if stored != computed {
            return Err(PackageError::ChecksumMismatch { stored, computed });
        }

        let bit_length = raw.component_bitmap_bit_length.get();
        if bit_length % 8 != 0 {
            return Err(PackageError::BadBitmapLength(bit_length));
        }
        let bitmap_len = usize::from(bit_length / 8);

        // everything between the fixed header and the checksum
        let areas = &data[mem::size_of::<RawHeader>()..crc_offset];
        let (version, areas) = split(areas, usize::from(raw.version_len))
            .ok_or(PackageError::HeaderSizeMismatch {
                computed: mem::size_of::<RawHeader>()
                    + usize::from(raw.version_len)
                    + CHECKSUM_SIZE,
                declared: header_size,
            })?;

        let mut offset = 0;
        let (fw_device_count, len) = area_len(areas, bitmap_len)
            .map_err(|index| PackageError::MalformedDeviceRecord { index })?;
        let fw_device_area = &areas[..len];
        offset += len;

        let downstream_area = if raw.format_revision >= FORMAT_REVISION_2 {
            let (count, len) = area_len(&areas[offset..], bitmap_len)
                .map_err(|index| PackageError::MalformedDeviceRecord {
                    index: fw_device_count + index,
                })?;
            let area = &areas[offset..offset + len];
            offset += len;
            Some((area, count))
        } else {
            None
        };

        let component_area = &areas[offset..];
        let (count_bytes, mut rest) = split(component_area, 2)
            .ok_or(PackageError::MalformedComponent { index: 0 })?;
        let component_count =
            usize::from(u16::from_le_bytes([count_bytes[0], count_bytes[1]]));
        let mut images_len = 0usize;
        for index in 0..component_count {
            let (image, next) = ComponentImage::parse(rest, index)
                .ok_or(PackageError::MalformedComponent { index })?;
            let start = image.location_offset as usize;
            let end = start.checked_add(image.size as usize);
            if end.map(|end| end > data.len()).unwrap_or(true) {
                return Err(PackageError::ImageOutOfBounds { index });
            }
            images_len += image.size as usize;
            rest = next;
        }

        let computed_header = header_size - rest.len();
        if !rest.is_empty() {
            return Err(PackageError::HeaderSizeMismatch {
                computed: computed_header,
                declared: header_size,
            });
        }
        if header_size + images_len != data.len() {
            return Err(PackageError::PackageSizeMismatch {
                computed: header_size + images_len,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            identifier,
            format_revision: raw.format_revision,
            header_size,
            release_date_time: raw.release_date_time,
            bitmap_len,
            version: VersionString { string_type: raw.version_type, bytes: version },
            fw_device_area: &fw_device_area[1..],
            fw_device_count,
            downstream_area: downstream_area.map(|(area, count)| (&area[1..], count)),
            component_area: &component_area[2..],
            component_count,
        })
    }

    pub fn identifier(&self) -> Uuid {
        self.identifier
    }

    pub fn format_revision(&self) -> u8 {
        self.format_revision
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn release_date_time(&self) -> &[u8; 13] {
        &self.release_date_time
    }

    pub fn version(&self) -> VersionString<'a> {
        self.version
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of components the applicability bitmaps can describe.
    pub fn component_bitmap_bit_length(&self) -> usize {
        self.bitmap_len * 8
    }

    pub fn device_records(&self) -> DeviceIdRecords<'a> {
        DeviceIdRecords {
            data: self.fw_device_area,
            remaining: self.fw_device_count,
            bitmap_len: self.bitmap_len,
        }
    }

    pub fn downstream_records(&self) -> Option<DeviceIdRecords<'a>> {
        self.downstream_area.map(|(data, remaining)| DeviceIdRecords {
            data,
            remaining,
            bitmap_len: self.bitmap_len,
        })
    }

    pub fn components(&self) -> ComponentImages<'a> {
        ComponentImages {
            data: self.component_area,
            index: 0,
            count: self.component_count,
        }
    }

    pub fn component_count(&self) -> usize {
        self.component_count
    }

    /// First device-identifier record whose descriptors all appear in
    /// `device`.
    pub fn find_matching_record(
        &self,
        device: &DeviceIdentifiers<'_>,
    ) -> Option<DeviceIdRecord<'a>> {
        self.device_records().find(|record| record.matches(device))
    }

    /// Copies image bytes for `component` starting at `offset` into `out`.
    /// Bytes past the end of the image are zero-filled. Returns the number
    /// of bytes that came from the image.
    pub fn read_image(
        &self,
        component: &ComponentImage<'_>,
        offset: usize,
        out: &mut [u8],
    ) -> usize {
        let start = component.location_offset as usize;
        // bounds were checked in `parse`
        let image = &self.data[start..start + component.size as usize];
        let available = image.get(offset..).unwrap_or(&[]);
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        out[n..].fill(0);
        n
    }

    /// All of `component`'s image.
    pub fn image(&self, component: &ComponentImage<'_>) -> &'a [u8] {
        let start = component.location_offset as usize;
        &self.data[start..start + component.size as usize]
    }
}

/// Iterates descriptors of a record for display.
pub fn descriptor_list<'a>(
    record: &DeviceIdRecord<'a>,
) -> impl Iterator<Item = Descriptor<'a>> {
    record.descriptors().filter_map(|d| d.ok())
}

#[cfg(any(test, feature = "std"))]
pub use builder::*;

#[cfg(any(test, feature = "std"))]
mod builder {
    use super::*;

    /// Device-identifier record to place in a built package.
    #[derive(Debug, Clone, Default)]
    pub struct DeviceRecordTemplate {
        pub descriptors: Vec<(u16, Vec<u8>)>,
        /// Indices of applicable components.
        pub applicable_components: Vec<usize>,
        pub update_option_flags: u32,
        pub image_set_version: String,
        pub package_data: Vec<u8>,
    }

    #[derive(Debug, Clone, Default)]
    pub struct ComponentTemplate {
        pub classification: u16,
        pub identifier: u16,
        pub comparison_stamp: u32,
        pub options: ComponentOptions,
        pub requested_activation_method: ActivationMethods,
        pub version: String,
        pub image: Vec<u8>,
    }

    /// Assembles a well-formed package with a valid checksum.
    #[derive(Debug, Clone)]
    pub struct PackageBuilder {
        pub format_revision: u8,
        pub release_date_time: [u8; 13],
        pub version: String,
        pub device_records: Vec<DeviceRecordTemplate>,
        pub components: Vec<ComponentTemplate>,
    }

    impl Default for PackageBuilder {
        fn default() -> Self {
            Self {
                format_revision: FORMAT_REVISION_1,
                release_date_time: [0; 13],
                version: String::new(),
                device_records: Vec::new(),
                components: Vec::new(),
            }
        }
    }

    fn push_u16(out: &mut Vec<u8>, value: u16) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn push_u32(out: &mut Vec<u8>, value: u32) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    impl PackageBuilder {
        fn bitmap_len(&self) -> usize {
            self.components.len().div_ceil(8).max(1)
        }

        fn device_area(&self, records: &[DeviceRecordTemplate]) -> Vec<u8> {
            let bitmap_len = self.bitmap_len();
            let mut area = vec![records.len() as u8];
            for record in records {
                let mut body = Vec::new();
                let mut bitmap = vec![0u8; bitmap_len];
                for &index in &record.applicable_components {
                    bitmap[index / 8] |= 1 << (index % 8);
                }
                body.extend_from_slice(&bitmap);
                body.extend_from_slice(record.image_set_version.as_bytes());
                for (descriptor_type, data) in &record.descriptors {
                    push_u16(&mut body, *descriptor_type);
                    push_u16(&mut body, data.len() as u16);
                    body.extend_from_slice(data);
                }
                body.extend_from_slice(&record.package_data);

                let length = mem::size_of::<RawDeviceRecord>() + body.len();
                push_u16(&mut area, length as u16);
                area.push(record.descriptors.len() as u8);
                push_u32(&mut area, record.update_option_flags);
                area.push(crate::fw_update::string_type::ASCII);
                area.push(record.image_set_version.len() as u8);
                push_u16(&mut area, record.package_data.len() as u16);
                area.extend_from_slice(&body);
            }
            area
        }

        pub fn build(&self) -> Vec<u8> {
            let identifier = if self.format_revision >= FORMAT_REVISION_2 {
                IDENTIFIER_V1_1
            } else {
                IDENTIFIER_V1_0
            };

            let mut areas = self.device_area(&self.device_records);
            if self.format_revision >= FORMAT_REVISION_2 {
                areas.extend_from_slice(&self.device_area(&[]));
            }

            let component_table_len: usize = 2 + self
                .components
                .iter()
                .map(|c| mem::size_of::<RawComponentImage>() + c.version.len())
                .sum::<usize>();
            let header_size = mem::size_of::<RawHeader>()
                + self.version.len()
                + areas.len()
                + component_table_len
                + CHECKSUM_SIZE;

            push_u16(&mut areas, self.components.len() as u16);
            let mut location = header_size;
            for component in &self.components {
                push_u16(&mut areas, component.classification);
                push_u16(&mut areas, component.identifier);
                push_u32(&mut areas, component.comparison_stamp);
                push_u16(&mut areas, component.options.bits());
                push_u16(&mut areas, component.requested_activation_method.bits());
                push_u32(&mut areas, location as u32);
                push_u32(&mut areas, component.image.len() as u32);
                areas.push(crate::fw_update::string_type::ASCII);
                areas.push(component.version.len() as u8);
                areas.extend_from_slice(component.version.as_bytes());
                location += component.image.len();
            }

            let mut out = Vec::with_capacity(location);
            out.extend_from_slice(identifier.as_bytes());
            out.push(self.format_revision);
            push_u16(&mut out, header_size as u16);
            out.extend_from_slice(&self.release_date_time);
            push_u16(&mut out, (self.bitmap_len() * 8) as u16);
            out.push(crate::fw_update::string_type::ASCII);
            out.push(self.version.len() as u8);
            out.extend_from_slice(self.version.as_bytes());
            out.extend_from_slice(&areas);
            let crc = crc32(&out);
            push_u32(&mut out, crc);
            for component in &self.components {
                out.extend_from_slice(&component.image);
            }
            out
        }
    }
}
