// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side communication with EROTs over their serial bus binding.
//!
//! [`EndpointRegistry`] owns one [`ErotBinding`] per attached EROT and issues
//! commands through a [`RequestEngine`]; [`TaskEngine`] runs firmware updates
//! against registered endpoints. [`sim::SimulatedErot`] stands in for real
//! hardware.

mod binding;
mod bus;
mod engine;
mod registry;
mod update;

pub mod error;
pub mod sim;

pub use binding::BindingConfig;
pub use binding::DeviceAttributes;
pub use binding::DeviceClass;
pub use binding::Direction;
pub use binding::ErotBinding;
pub use binding::MctpTransport;
pub use binding::Received;
pub use binding::DEFAULT_EROT_EID;
pub use binding::DEFAULT_HOST_EID;
pub use bus::ReadySignal;
pub use bus::SpiBus;
pub use engine::InstanceIdAllocator;
pub use engine::RequestEngine;
pub use engine::RetryConfig;
pub use registry::BroadcastResult;
pub use registry::Endpoint;
pub use registry::EndpointHandle;
pub use registry::EndpointRegistry;
pub use update::ExecuteSummary;
pub use update::ProgressFn;
pub use update::TaskEngine;
pub use update::TaskHandle;
pub use update::TaskOutcome;
pub use update::TaskStage;
pub use update::UpdateConfig;
pub use update::UpdateTask;
