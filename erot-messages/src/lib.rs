// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire formats shared by the host-side EROT stack and (simulated) EROT
//! firmware: transport packets, command headers, the control and firmware
//! update command sets, and firmware update packages.

#![cfg_attr(all(not(test), not(feature = "std")), no_std)]

pub mod command;
pub mod control;
pub mod fd_impl;
pub mod fw_update;
pub mod package;
pub mod transport;

pub use hubpack::error::Error as HubpackError;
pub use hubpack::{deserialize, serialize, SerializedSize};

pub use command::CommandHeader;
pub use command::CompletionCode;
pub use command::InstanceId;
pub use command::MessageType;
pub use transport::MessageTag;

/// Largest message (command header included) either side sends.
pub const MAX_MESSAGE_SIZE: usize = 4096 + 64;

/// Largest firmware parameters response body the host will accept.
pub const FW_PARAMS_BUFFER_SIZE: usize = 512;
