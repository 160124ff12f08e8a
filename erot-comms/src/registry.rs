// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The set of EROTs attached to this host.

use crate::binding::BindingConfig;
use crate::binding::DeviceAttributes;
use crate::binding::Direction;
use crate::binding::ErotBinding;
use crate::binding::MctpTransport;
use crate::binding::Received;
use crate::bus::ReadySignal;
use crate::bus::SpiBus;
use crate::engine::RequestEngine;
use crate::engine::RetryConfig;
use crate::error::BroadcastError;
use crate::error::CommunicationError;
use crate::error::RegistryError;
use crate::error::TransportError;
use erot_messages::MessageTag;
use erot_messages::MessageType;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::time::Duration;

/// Handle to an endpoint, returned by [`EndpointRegistry::add_endpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointHandle(usize);

impl EndpointHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One registered EROT: its transport plus the request engine that owns
/// its instance ID space.
pub struct Endpoint {
    transport: Box<dyn MctpTransport>,
    engine: RequestEngine,
}

impl Endpoint {
    pub fn attributes(&self) -> &DeviceAttributes {
        self.transport.device_attributes()
    }

    pub fn retry_config(&self) -> &RetryConfig {
        self.engine.config()
    }

    /// See [`RequestEngine::rpc_call`].
    pub async fn rpc_call(
        &mut self,
        msg_type: MessageType,
        command: u8,
        body: &[u8],
        response: &mut [u8],
        extra_wait: Duration,
    ) -> Result<usize, CommunicationError> {
        self.engine
            .rpc_call(
                self.transport.as_mut(),
                msg_type,
                command,
                body,
                response,
                extra_wait,
            )
            .await
    }

    pub async fn send(
        &mut self,
        direction: Direction,
        message: &[u8],
    ) -> Result<MessageTag, TransportError> {
        self.transport.send(direction, message).await
    }

    pub async fn recv(
        &mut self,
        timeout: Duration,
        buf: &mut [u8],
    ) -> Result<Received, TransportError> {
        self.transport.recv(timeout, buf).await
    }
}

/// Outcome of a broadcast for one endpoint.
#[derive(Debug)]
pub struct BroadcastResult {
    pub endpoint: EndpointHandle,
    pub name: String,
    pub socket: u8,
    /// The whole response message on success.
    pub result: Result<Vec<u8>, BroadcastError>,
}

/// Owns every registered endpoint. Endpoints live until the registry is
/// torn down with [`EndpointRegistry::deinit`].
pub struct EndpointRegistry {
    endpoints: Vec<Endpoint>,
    capacity: usize,
    binding_config: BindingConfig,
    retry_config: RetryConfig,
    log: Logger,
}

impl EndpointRegistry {
    pub fn init(
        capacity: usize,
        binding_config: BindingConfig,
        retry_config: RetryConfig,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!("component" => "EndpointRegistry"));
        debug!(log, "init"; "capacity" => capacity);
        Self {
            endpoints: Vec::with_capacity(capacity),
            capacity,
            binding_config,
            retry_config,
            log,
        }
    }

    pub fn deinit(self) {
        info!(self.log, "deinit"; "endpoints" => self.endpoints.len());
    }

    /// Probes the EROT behind `chip_select` and registers it on success.
    pub async fn add_endpoint(
        &mut self,
        bus: Box<dyn SpiBus>,
        chip_select: u8,
        socket: u8,
        ready: Box<dyn ReadySignal>,
    ) -> Result<EndpointHandle, RegistryError> {
        self.check_room(socket)?;
        let mut binding = ErotBinding::new(
            bus,
            chip_select,
            socket,
            ready,
            self.binding_config,
            &self.log,
        );
        if let Err(err) = binding.initialize().await {
            warn!(
                self.log, "probe failed";
                "socket" => socket,
                InlineErrorChain::new(&err),
            );
            return Err(RegistryError::Probe { socket, err });
        }
        Ok(self.push(Box::new(binding)))
    }

    /// Registers an already-initialized transport.
    pub fn add_transport(
        &mut self,
        transport: Box<dyn MctpTransport>,
    ) -> Result<EndpointHandle, RegistryError> {
        self.check_room(transport.device_attributes().socket)?;
        Ok(self.push(transport))
    }

    fn check_room(&self, socket: u8) -> Result<(), RegistryError> {
        if self.endpoints.len() >= self.capacity {
            return Err(RegistryError::Full { capacity: self.capacity });
        }
        if self.get_by_socket(socket).is_some() {
            return Err(RegistryError::DuplicateSocket(socket));
        }
        Ok(())
    }

    fn push(&mut self, transport: Box<dyn MctpTransport>) -> EndpointHandle {
        let attributes = transport.device_attributes();
        let handle = EndpointHandle(self.endpoints.len());
        let log = self.log.new(o!(
            "erot" => attributes.name.clone(),
            "socket" => attributes.socket,
        ));
        info!(log, "endpoint added"; "index" => handle.index());
        self.endpoints.push(Endpoint {
            transport,
            engine: RequestEngine::new(self.retry_config, log),
        });
        handle
    }

    pub fn count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn handles(&self) -> impl Iterator<Item = EndpointHandle> {
        (0..self.endpoints.len()).map(EndpointHandle)
    }

    /// Handle of the `index`th registered endpoint.
    pub fn get_by_index(&self, index: usize) -> Option<EndpointHandle> {
        (index < self.endpoints.len()).then_some(EndpointHandle(index))
    }

    pub fn get(&self, handle: EndpointHandle) -> Option<&Endpoint> {
        self.endpoints.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: EndpointHandle) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(handle.0)
    }

    pub fn get_by_socket(&self, socket: u8) -> Option<EndpointHandle> {
        self.endpoints
            .iter()
            .position(|e| e.attributes().socket == socket)
            .map(EndpointHandle)
    }

    /// Sends the same command to every endpoint in turn. `validator` sees
    /// the request body and each whole response and decides whether the
    /// reply is acceptable. A failure on one endpoint is recorded in its
    /// result and does not stop the broadcast.
    pub async fn broadcast_request<F>(
        &mut self,
        msg_type: MessageType,
        command: u8,
        body: &[u8],
        response_capacity: usize,
        mut validator: F,
    ) -> Vec<BroadcastResult>
    where
        F: FnMut(&DeviceAttributes, &[u8], &[u8]) -> bool,
    {
        let mut results = Vec::with_capacity(self.endpoints.len());
        let mut response = vec![0; response_capacity];

        for (index, endpoint) in self.endpoints.iter_mut().enumerate() {
            let attributes = endpoint.attributes().clone();
            let result = match endpoint
                .rpc_call(msg_type, command, body, &mut response, Duration::ZERO)
                .await
            {
                Ok(n) => {
                    if validator(&attributes, body, &response[..n]) {
                        Ok(response[..n].to_vec())
                    } else {
                        Err(BroadcastError::Rejected)
                    }
                }
                Err(err) => Err(BroadcastError::from(err)),
            };
            if let Err(err) = &result {
                warn!(
                    self.log, "broadcast to endpoint failed";
                    "erot" => &attributes.name,
                    InlineErrorChain::new(err),
                );
            }
            results.push(BroadcastResult {
                endpoint: EndpointHandle(index),
                name: attributes.name,
                socket: attributes.socket,
                result,
            });
        }
        results
    }
}
