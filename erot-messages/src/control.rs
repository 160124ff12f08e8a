// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MCTP control messages used while bringing up a link.

use crate::command::encode_request;
use crate::command::encode_response;
use crate::command::CommandError;
use crate::command::CommandHeader;
use crate::command::CompletionCode;
use crate::command::InstanceId;
use crate::command::MessageType;
use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;

pub const SET_ENDPOINT_ID: u8 = 0x01;

/// Operation field of a Set Endpoint ID request.
pub mod set_eid_operation {
    pub const SET: u8 = 0x00;
    pub const FORCE: u8 = 0x01;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct SetEndpointIdRequest {
    pub operation: u8,
    pub endpoint_id: u8,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct SetEndpointIdResponse {
    /// Assignment status; zero means the requested EID was accepted.
    pub status: u8,
    pub endpoint_id: u8,
    pub pool_size: u8,
}

pub fn encode_set_endpoint_id(
    out: &mut [u8],
    instance_id: InstanceId,
    endpoint_id: u8,
) -> Result<usize, CommandError> {
    let header = CommandHeader::request(
        MessageType::Control,
        instance_id,
        SET_ENDPOINT_ID,
    );
    let body =
        SetEndpointIdRequest { operation: set_eid_operation::SET, endpoint_id };
    encode_request(out, header, &body, &[])
}

/// Decodes the body of a Set Endpoint ID reply (everything after the
/// completion code).
pub fn decode_set_endpoint_id_response(
    body: &[u8],
) -> Result<SetEndpointIdResponse, CommandError> {
    let (response, _) = hubpack::deserialize(body)?;
    Ok(response)
}

/// Answers a Set Endpoint ID request on the device side, accepting the
/// requested EID.
pub fn answer_set_endpoint_id(
    request: &[u8],
    out: &mut [u8],
) -> Result<(u8, usize), CommandError> {
    let (header, body) = CommandHeader::read(request)?;
    let (req, _) = hubpack::deserialize::<SetEndpointIdRequest>(body)?;
    let response =
        SetEndpointIdResponse { status: 0, endpoint_id: req.endpoint_id, pool_size: 0 };
    let n = encode_response(out, header, CompletionCode::SUCCESS, &response, &[])?;
    Ok((req.endpoint_id, n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_eid_exchange() {
        let mut req = [0; 8];
        let n = encode_set_endpoint_id(&mut req, InstanceId::new(3), 0x1d).unwrap();
        assert_eq!(&req[..n], &[0x00, 0x83, SET_ENDPOINT_ID, 0x00, 0x1d]);

        let mut rsp = [0; 8];
        let (eid, m) = answer_set_endpoint_id(&req[..n], &mut rsp).unwrap();
        assert_eq!(eid, 0x1d);
        let (header, code, body) = CommandHeader::read_response(&rsp[..m]).unwrap();
        assert_eq!(header.instance_id(), InstanceId::new(3));
        assert!(code.is_success());
        let response = decode_set_endpoint_id_response(body).unwrap();
        assert_eq!(response.endpoint_id, 0x1d);
        assert_eq!(response.status, 0);
    }

    #[test]
    fn short_reply_body() {
        assert!(decode_set_endpoint_id_response(&[0, 1]).is_err());
    }
}
