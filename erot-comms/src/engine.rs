// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request/response exchanges with bounded retries.

use crate::binding::Direction;
use crate::binding::MctpTransport;
use crate::error::CommunicationError;
use crate::error::TransportError;
use erot_messages::command::validate_response;
use erot_messages::CommandHeader;
use erot_messages::InstanceId;
use erot_messages::MessageTag;
use erot_messages::MessageType;
use slog::debug;
use slog::trace;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::time::Duration;
use tokio::time::Instant;
use zerocopy::IntoBytes;

type Result<T, E = CommunicationError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// How long each attempt waits for the response.
    pub per_attempt_timeout: Duration,

    /// Total attempts (initial send included) before giving up.
    pub max_attempts: usize,

    /// How long an instance ID stays reserved for a request that never got
    /// its response.
    pub instance_id_expiration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            per_attempt_timeout: Duration::from_millis(100),
            max_attempts: 3,
            instance_id_expiration: Duration::from_secs(6),
        }
    }
}

/// Hands out instance IDs, skipping any still awaiting a response inside
/// the expiration window.
#[derive(Debug, Clone)]
pub struct InstanceIdAllocator {
    next: InstanceId,
    issued: [Option<Instant>; InstanceId::COUNT],
    expiration: Duration,
}

impl InstanceIdAllocator {
    pub fn new(expiration: Duration) -> Self {
        Self {
            next: InstanceId::default(),
            issued: [None; InstanceId::COUNT],
            expiration,
        }
    }

    /// Whether `id` was issued less than the expiration window before `now`
    /// and has not been released.
    pub fn is_reserved(&self, id: InstanceId, now: Instant) -> bool {
        self.issued[usize::from(id.get())]
            .map(|issued| now.saturating_duration_since(issued) < self.expiration)
            .unwrap_or(false)
    }

    pub fn allocate(&mut self, now: Instant) -> Option<InstanceId> {
        for _ in 0..InstanceId::COUNT {
            let id = self.next;
            self.next = id.next();
            if !self.is_reserved(id, now) {
                self.issued[usize::from(id.get())] = Some(now);
                return Some(id);
            }
        }
        None
    }

    /// Frees `id` once its response has been matched.
    pub fn release(&mut self, id: InstanceId) {
        self.issued[usize::from(id.get())] = None;
    }
}

/// Issues commands to one endpoint and matches their responses.
#[derive(Debug)]
pub struct RequestEngine {
    config: RetryConfig,
    instance_ids: InstanceIdAllocator,
    log: Logger,
}

impl RequestEngine {
    pub fn new(config: RetryConfig, log: Logger) -> Self {
        Self {
            config,
            instance_ids: InstanceIdAllocator::new(config.instance_id_expiration),
            log,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Sends `command` with `body` and waits for the matching response,
    /// retrying on send failure, timeout or mismatch. The same instance ID is
    /// used for every attempt. On success the whole response message
    /// (header included) is in `response[..n]`.
    ///
    /// `extra_wait` is added to every attempt's response timeout, for
    /// commands the device needs longer to answer.
    pub async fn rpc_call<T: MctpTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        msg_type: MessageType,
        command: u8,
        body: &[u8],
        response: &mut [u8],
        extra_wait: Duration,
    ) -> Result<usize> {
        let instance_id = self
            .instance_ids
            .allocate(Instant::now())
            .ok_or(CommunicationError::InstanceIdsExhausted)?;
        let header = CommandHeader::request(msg_type, instance_id, command);
        let mut request = Vec::with_capacity(header.as_bytes().len() + body.len());
        request.extend_from_slice(header.as_bytes());
        request.extend_from_slice(body);

        let max_attempts = self.config.max_attempts;
        let timeout = self.config.per_attempt_timeout + extra_wait;

        for attempt in 1..=max_attempts {
            trace!(
                self.log, "sending request";
                "command" => command,
                "instance_id" => instance_id.get(),
                "attempt" => attempt,
            );

            let tag = match transport.send(Direction::Request, &request).await {
                Ok(tag) => tag,
                Err(err) => {
                    debug!(
                        self.log, "send failed";
                        "attempt" => attempt,
                        InlineErrorChain::new(&err),
                    );
                    continue;
                }
            };

            match self
                .await_response(transport, &header, tag, timeout, response)
                .await
            {
                Ok(n) => {
                    self.instance_ids.release(instance_id);
                    return Ok(n);
                }
                Err(err) => {
                    debug!(
                        self.log, "no usable response";
                        "attempt" => attempt,
                        InlineErrorChain::new(&err),
                    );
                }
            }
        }

        Err(CommunicationError::ExhaustedNumAttempts(max_attempts))
    }

    async fn await_response<T: MctpTransport + ?Sized>(
        &self,
        transport: &mut T,
        request: &CommandHeader,
        tag: MessageTag,
        timeout: Duration,
        response: &mut [u8],
    ) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(timeout).into());
            }
            let received = transport.recv(remaining, response).await?;
            let (header, _) = CommandHeader::read(&response[..received.len])?;
            if header.is_request() {
                debug!(
                    self.log, "ignoring request from device while awaiting response";
                    "command" => header.command,
                    "instance_id" => header.instance_id().get(),
                );
                continue;
            }
            validate_response(request, &header, tag, received.tag)?;
            return Ok(received.len);
        }
    }
}
