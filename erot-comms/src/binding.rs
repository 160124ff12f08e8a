// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message framing over the physical link to one EROT.

use crate::bus::ReadySignal;
use crate::bus::SpiBus;
use crate::error::TransportError;
use async_trait::async_trait;
use erot_messages::command::validate_response;
use erot_messages::control::decode_set_endpoint_id_response;
use erot_messages::control::encode_set_endpoint_id;
use erot_messages::control::SetEndpointIdResponse;
use erot_messages::transport::decode_packet;
use erot_messages::transport::encode_packet;
use erot_messages::transport::Fragments;
use erot_messages::transport::Reassembler;
use erot_messages::transport::MAX_PACKET_SIZE;
use erot_messages::CommandHeader;
use erot_messages::InstanceId;
use erot_messages::MessageTag;
use erot_messages::SerializedSize;
use slog::debug;
use slog::info;
use slog::o;
use slog::trace;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_HOST_EID: u8 = 0x08;
pub const DEFAULT_EROT_EID: u8 = 0x09;

/// Upper bound on stale packets discarded while initializing.
const MAX_STALE_PACKETS: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct BindingConfig {
    /// How often the ready signal is sampled while waiting for a packet.
    pub ready_poll_interval: Duration,
    /// Longest wait between two packets of the same message.
    pub packet_timeout: Duration,
    /// Response wait used by [`MctpTransport::do_request`].
    pub response_timeout: Duration,
    pub local_eid: u8,
    /// EID requested for the EROT; the EROT may assign a different one.
    pub remote_eid: u8,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            ready_poll_interval: Duration::from_millis(1),
            packet_timeout: Duration::from_millis(100),
            response_timeout: Duration::from_millis(100),
            local_eid: DEFAULT_HOST_EID,
            remote_eid: DEFAULT_EROT_EID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Erot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttributes {
    pub name: String,
    pub socket: u8,
    pub class: DeviceClass,
}

impl DeviceAttributes {
    pub fn erot(socket: u8) -> Self {
        Self { name: format!("Erot{socket}"), socket, class: DeviceClass::Erot }
    }
}

impl fmt::Display for DeviceAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Who owns the tag of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// A new request; the binding allocates the tag.
    Request,
    /// A response to the device's request carrying `tag`.
    Response(MessageTag),
}

/// Description of a message returned by [`MctpTransport::recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub len: usize,
    pub tag: MessageTag,
    pub tag_owner: bool,
}

/// Message-level access to one endpoint.
///
/// Only one call may be in flight per transport; `&mut self` enforces that.
#[async_trait]
pub trait MctpTransport: Send {
    fn device_attributes(&self) -> &DeviceAttributes;

    /// Sends `request` and waits for the response carrying the same tag,
    /// returning its length in `response`.
    async fn do_request(
        &mut self,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<usize, TransportError>;

    /// Sends one message, returning the tag it was sent with.
    async fn send(
        &mut self,
        direction: Direction,
        message: &[u8],
    ) -> Result<MessageTag, TransportError>;

    /// Waits up to `timeout` for the next complete message.
    async fn recv(
        &mut self,
        timeout: Duration,
        buf: &mut [u8],
    ) -> Result<Received, TransportError>;
}

/// Binding to one EROT behind a chip select and ready line.
pub struct ErotBinding {
    bus: Box<dyn SpiBus>,
    ready: Box<dyn ReadySignal>,
    chip_select: u8,
    attributes: DeviceAttributes,
    config: BindingConfig,
    local_eid: u8,
    remote_eid: u8,
    next_tag: MessageTag,
    initialized: bool,
    packet: [u8; MAX_PACKET_SIZE],
    log: Logger,
}

impl fmt::Debug for ErotBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErotBinding")
            .field("chip_select", &self.chip_select)
            .field("attributes", &self.attributes)
            .field("local_eid", &self.local_eid)
            .field("remote_eid", &self.remote_eid)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl ErotBinding {
    pub fn new(
        bus: Box<dyn SpiBus>,
        chip_select: u8,
        socket: u8,
        ready: Box<dyn ReadySignal>,
        config: BindingConfig,
        log: &Logger,
    ) -> Self {
        let attributes = DeviceAttributes::erot(socket);
        let log = log.new(o!(
            "erot" => attributes.name.clone(),
            "chip_select" => chip_select,
        ));
        Self {
            bus,
            ready,
            chip_select,
            attributes,
            config,
            local_eid: config.local_eid,
            remote_eid: config.remote_eid,
            next_tag: MessageTag::default(),
            initialized: false,
            packet: [0; MAX_PACKET_SIZE],
            log,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// EID the EROT answers to (as assigned during initialization).
    pub fn remote_eid(&self) -> u8 {
        self.remote_eid
    }

    async fn ensure_initialized(&mut self) -> Result<(), TransportError> {
        if self.initialized {
            return Ok(());
        }
        self.initialize().await
    }

    /// Drains stale packets and assigns the EROT its endpoint ID.
    ///
    /// Initialization is attempted once: the binding counts as initialized
    /// as soon as the exchange starts, whether or not it succeeds.
    pub async fn initialize(&mut self) -> Result<(), TransportError> {
        self.initialized = true;
        self.drain_stale_packets().await?;

        let mut request = [0; 8];
        let n = encode_set_endpoint_id(
            &mut request,
            InstanceId::default(),
            self.config.remote_eid,
        )
        .map_err(TransportError::BadSetEndpointIdResponse)?;
        let request = &request[..n];

        let tag = self.send_message(Direction::Request, request).await?;
        let mut response = [0; 16];
        let received = self
            .recv_message(self.config.response_timeout, &mut response)
            .await?;

        let (request_header, _) = CommandHeader::read(request)
            .map_err(TransportError::BadSetEndpointIdResponse)?;
        let (response_header, code, body) =
            CommandHeader::read_response(&response[..received.len])
                .map_err(TransportError::BadSetEndpointIdResponse)?;
        validate_response(&request_header, &response_header, tag, received.tag)
            .map_err(TransportError::SetEndpointIdMismatch)?;
        if !code.is_success() {
            return Err(TransportError::SetEndpointIdRejected(code));
        }
        if body.len() != SetEndpointIdResponse::MAX_SIZE {
            return Err(TransportError::BadSetEndpointIdResponse(
                erot_messages::command::CommandError::LengthMismatch {
                    expected: SetEndpointIdResponse::MAX_SIZE,
                    got: body.len(),
                },
            ));
        }
        let reply = decode_set_endpoint_id_response(body)
            .map_err(TransportError::BadSetEndpointIdResponse)?;
        if reply.status != 0 {
            warn!(
                self.log, "set endpoint ID returned nonzero status";
                "status" => reply.status,
                "eid" => reply.endpoint_id,
            );
        }
        self.remote_eid = reply.endpoint_id;

        info!(self.log, "init complete"; "remote_eid" => self.remote_eid);
        Ok(())
    }

    async fn drain_stale_packets(&mut self) -> Result<(), TransportError> {
        let mut drained = 0;
        while drained < MAX_STALE_PACKETS && self.ready.is_asserted() {
            let n = self
                .bus
                .transact(self.chip_select, &[], &mut self.packet)
                .await?;
            debug!(self.log, "discarding stale packet"; "len" => n);
            drained += 1;
        }
        Ok(())
    }

    async fn wait_ready(
        &mut self,
        deadline: Instant,
        waited: Duration,
    ) -> Result<(), TransportError> {
        loop {
            if self.ready.is_asserted() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout(waited));
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
    }

    async fn send_message(
        &mut self,
        direction: Direction,
        message: &[u8],
    ) -> Result<MessageTag, TransportError> {
        let (tag, tag_owner) = match direction {
            Direction::Request => {
                let tag = self.next_tag;
                self.next_tag = tag.next();
                (tag, true)
            }
            Direction::Response(tag) => (tag, false),
        };

        trace!(
            self.log, "sending message";
            "len" => message.len(),
            "tag" => tag.get(),
            "tag_owner" => tag_owner,
        );
        let fragments = Fragments::new(
            message,
            self.local_eid,
            self.remote_eid,
            tag,
            tag_owner,
        );
        for (header, payload) in fragments {
            let n = encode_packet(&header, payload, &mut self.packet)?;
            self.bus
                .transact(self.chip_select, &self.packet[..n], &mut [])
                .await?;
        }
        Ok(tag)
    }

    async fn recv_message(
        &mut self,
        timeout: Duration,
        buf: &mut [u8],
    ) -> Result<Received, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut reassembler = Reassembler::new(buf);

        loop {
            if reassembler.in_progress() {
                let packet_deadline = Instant::now() + self.config.packet_timeout;
                self.wait_ready(packet_deadline, self.config.packet_timeout)
                    .await?;
            } else {
                self.wait_ready(deadline, timeout).await?;
            }

            let n = self
                .bus
                .transact(self.chip_select, &[], &mut self.packet)
                .await?;
            let packet = match self.packet.get(..n).map(decode_packet) {
                Some(Ok(packet)) => packet,
                Some(Err(err)) => {
                    warn!(
                        self.log, "dropping packet";
                        "len" => n,
                        "msg_len" => reassembler.len(),
                        InlineErrorChain::new(&err),
                    );
                    continue;
                }
                None => {
                    warn!(self.log, "dropping oversized packet"; "len" => n);
                    continue;
                }
            };

            if reassembler.push(&packet)? {
                let received = Received {
                    len: reassembler.len(),
                    // complete messages always have a tag
                    tag: reassembler.tag().unwrap_or(packet.header.tag),
                    tag_owner: reassembler.tag_owner(),
                };
                trace!(
                    self.log, "received message";
                    "len" => received.len,
                    "tag" => received.tag.get(),
                );
                return Ok(received);
            }
        }
    }
}

#[async_trait]
impl MctpTransport for ErotBinding {
    fn device_attributes(&self) -> &DeviceAttributes {
        &self.attributes
    }

    async fn do_request(
        &mut self,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<usize, TransportError> {
        self.ensure_initialized().await?;
        let tag = self.send_message(Direction::Request, request).await?;
        let received =
            self.recv_message(self.config.response_timeout, response).await?;
        if received.tag != tag {
            return Err(TransportError::TagMismatch {
                expected: tag,
                got: received.tag,
            });
        }
        Ok(received.len)
    }

    async fn send(
        &mut self,
        direction: Direction,
        message: &[u8],
    ) -> Result<MessageTag, TransportError> {
        self.ensure_initialized().await?;
        self.send_message(direction, message).await
    }

    async fn recv(
        &mut self,
        timeout: Duration,
        buf: &mut [u8],
    ) -> Result<Received, TransportError> {
        self.ensure_initialized().await?;
        self.recv_message(timeout, buf).await
    }
}
