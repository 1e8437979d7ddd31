//! Binary opcode frames (spec §4.1 / §6). All multibyte integers are
//! little-endian; the first byte of every binary frame is the opcode.

use std::io::{Cursor, Write};

use crate::error::ProtocolError;

/// The closed set of server→client binary opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerBinaryOpcode {
    MessageData = 0x01,
    Time = 0x02,
    ServiceCallResponse = 0x03,
    FetchAssetResponse = 0x04,
}

impl ServerBinaryOpcode {
    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Self::MessageData),
            0x02 => Ok(Self::Time),
            0x03 => Ok(Self::ServiceCallResponse),
            0x04 => Ok(Self::FetchAssetResponse),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// The closed set of client→server binary opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientBinaryOpcode {
    ClientMessageData = 0x01,
    ServiceCallRequest = 0x02,
}

impl ClientBinaryOpcode {
    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Self::ClientMessageData),
            0x02 => Ok(Self::ServiceCallRequest),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

fn need(data: &[u8], n: usize, what: &str) -> Result<(), ProtocolError> {
    if data.len() < n {
        Err(ProtocolError::ParseError(format!(
            "binary frame too short for {what}: need {n} bytes, have {}",
            data.len()
        )))
    } else {
        Ok(())
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
}

/// `0x01` server→client: a message on a subscribed channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageData {
    pub subscription_id: u32,
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
}

impl MessageData {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 1 + 4 + 8 + self.payload.len()];
        {
            let mut w = Cursor::new(&mut buf);
            w.write_all(&[ServerBinaryOpcode::MessageData as u8]).ok();
            w.write_all(&self.subscription_id.to_le_bytes()).ok();
            w.write_all(&self.timestamp_ns.to_le_bytes()).ok();
            w.write_all(&self.payload).ok();
        }
        buf
    }

    /// Encodes the frame with a placeholder subscription id of 0 for
    /// later patching, returning the full buffer and the byte offset of
    /// the subscription-id field. Used by the broadcast fast path (spec
    /// §5/§9) to assemble the opcode+timestamp+payload bytes once and
    /// patch only the subscription-id slot per recipient.
    pub fn encode_template(timestamp_ns: u64, payload: &[u8]) -> (Vec<u8>, usize) {
        let mut buf = vec![0u8; 1 + 4 + 8 + payload.len()];
        {
            let mut w = Cursor::new(&mut buf);
            w.write_all(&[ServerBinaryOpcode::MessageData as u8]).ok();
            w.write_all(&0u32.to_le_bytes()).ok();
            w.write_all(&timestamp_ns.to_le_bytes()).ok();
            w.write_all(payload).ok();
        }
        (buf, 1)
    }

    /// Patches the subscription-id slot of a buffer produced by
    /// [`Self::encode_template`] in place.
    pub fn patch_subscription_id(buf: &mut [u8], offset: usize, subscription_id: u32) {
        buf[offset..offset + 4].copy_from_slice(&subscription_id.to_le_bytes());
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(data, 12, "MessageData")?;
        Ok(Self {
            subscription_id: read_u32(data, 0),
            timestamp_ns: read_u64(data, 4),
            payload: data[12..].to_vec(),
        })
    }
}

/// `0x02` server→client: a wall-clock time broadcast, gated by capability
/// `time`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Time {
    pub timestamp_ns: u64,
}

impl Time {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 1 + 8];
        buf[0] = ServerBinaryOpcode::Time as u8;
        buf[1..9].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(data, 8, "Time")?;
        Ok(Self {
            timestamp_ns: read_u64(data, 0),
        })
    }
}

fn encode_with_encoding(opcode: u8, service_id: u32, call_id: u32, encoding: &str, payload: &[u8]) -> Vec<u8> {
    let encoding_bytes = encoding.as_bytes();
    let mut buf = vec![0u8; 1 + 4 + 4 + 4 + encoding_bytes.len() + payload.len()];
    let mut w = Cursor::new(&mut buf);
    w.write_all(&[opcode]).ok();
    w.write_all(&service_id.to_le_bytes()).ok();
    w.write_all(&call_id.to_le_bytes()).ok();
    w.write_all(&(encoding_bytes.len() as u32).to_le_bytes()).ok();
    w.write_all(encoding_bytes).ok();
    w.write_all(payload).ok();
    buf
}

fn decode_with_encoding(data: &[u8], what: &str) -> Result<(u32, u32, String, Vec<u8>), ProtocolError> {
    need(data, 12, what)?;
    let service_id = read_u32(data, 0);
    let call_id = read_u32(data, 4);
    let encoding_len = read_u32(data, 8) as usize;
    need(data, 12 + encoding_len, what)?;
    let encoding = String::from_utf8(data[12..12 + encoding_len].to_vec())
        .map_err(|e| ProtocolError::ParseError(format!("invalid utf8 encoding in {what}: {e}")))?;
    let payload = data[12 + encoding_len..].to_vec();
    Ok((service_id, call_id, encoding, payload))
}

/// `0x03` server→client: the result of a service call, gated by
/// capability `services`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceCallResponse {
    pub service_id: u32,
    pub call_id: u32,
    pub encoding: String,
    pub payload: Vec<u8>,
}

impl ServiceCallResponse {
    pub fn encode(&self) -> Vec<u8> {
        encode_with_encoding(
            ServerBinaryOpcode::ServiceCallResponse as u8,
            self.service_id,
            self.call_id,
            &self.encoding,
            &self.payload,
        )
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (service_id, call_id, encoding, payload) =
            decode_with_encoding(data, "ServiceCallResponse")?;
        Ok(Self {
            service_id,
            call_id,
            encoding,
            payload,
        })
    }
}

/// `0x04` server→client: the result of a `fetchAsset` request, gated by
/// capability `assets`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchAssetResponse {
    pub request_id: u32,
    pub status: FetchAssetStatus,
    pub error_message: String,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchAssetStatus {
    Success,
    Error,
}

impl FetchAssetResponse {
    pub fn success(request_id: u32, data: Vec<u8>) -> Self {
        Self {
            request_id,
            status: FetchAssetStatus::Success,
            error_message: String::new(),
            data,
        }
    }

    pub fn error(request_id: u32, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: FetchAssetStatus::Error,
            error_message: message.into(),
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let error_bytes = self.error_message.as_bytes();
        let status_byte = match self.status {
            FetchAssetStatus::Success => 0u8,
            FetchAssetStatus::Error => 1u8,
        };
        let asset = match self.status {
            FetchAssetStatus::Success => self.data.as_slice(),
            FetchAssetStatus::Error => &[],
        };
        let mut buf = vec![0u8; 1 + 4 + 1 + 4 + error_bytes.len() + asset.len()];
        let mut w = Cursor::new(&mut buf);
        w.write_all(&[ServerBinaryOpcode::FetchAssetResponse as u8])
            .ok();
        w.write_all(&self.request_id.to_le_bytes()).ok();
        w.write_all(&[status_byte]).ok();
        w.write_all(&(error_bytes.len() as u32).to_le_bytes()).ok();
        w.write_all(error_bytes).ok();
        w.write_all(asset).ok();
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(data, 9, "FetchAssetResponse")?;
        let request_id = read_u32(data, 0);
        let status_byte = data[4];
        let error_len = read_u32(data, 5) as usize;
        need(data, 9 + error_len, "FetchAssetResponse")?;
        let error_message = String::from_utf8(data[9..9 + error_len].to_vec())
            .map_err(|e| ProtocolError::ParseError(format!("invalid utf8 error message: {e}")))?;
        let rest = &data[9 + error_len..];
        let status = match status_byte {
            0 => FetchAssetStatus::Success,
            1 => FetchAssetStatus::Error,
            other => return Err(ProtocolError::UnknownStatus(other)),
        };
        let data = match status {
            FetchAssetStatus::Success => rest.to_vec(),
            FetchAssetStatus::Error => Vec::new(),
        };
        Ok(Self {
            request_id,
            status,
            error_message,
            data,
        })
    }
}

/// `0x01` client→server: a published message on a client-advertised
/// channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientMessageData {
    pub channel_id: u32,
    pub payload: Vec<u8>,
}

impl ClientMessageData {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 1 + 4 + self.payload.len()];
        let mut w = Cursor::new(&mut buf);
        w.write_all(&[ClientBinaryOpcode::ClientMessageData as u8])
            .ok();
        w.write_all(&self.channel_id.to_le_bytes()).ok();
        w.write_all(&self.payload).ok();
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        need(data, 4, "ClientMessageData")?;
        Ok(Self {
            channel_id: read_u32(data, 0),
            payload: data[4..].to_vec(),
        })
    }
}

/// `0x02` client→server: invoke a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceCallRequest {
    pub service_id: u32,
    pub call_id: u32,
    pub encoding: String,
    pub payload: Vec<u8>,
}

impl ServiceCallRequest {
    pub fn encode(&self) -> Vec<u8> {
        encode_with_encoding(
            ClientBinaryOpcode::ServiceCallRequest as u8,
            self.service_id,
            self.call_id,
            &self.encoding,
            &self.payload,
        )
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (service_id, call_id, encoding, payload) =
            decode_with_encoding(data, "ServiceCallRequest")?;
        Ok(Self {
            service_id,
            call_id,
            encoding,
            payload,
        })
    }
}

/// A parsed server→client binary frame, dispatched on its leading opcode
/// byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerBinaryFrame {
    MessageData(MessageData),
    Time(Time),
    ServiceCallResponse(ServiceCallResponse),
    FetchAssetResponse(FetchAssetResponse),
}

impl ServerBinaryFrame {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::ParseError("empty binary frame".into()));
        }
        match ServerBinaryOpcode::from_byte(data[0])? {
            ServerBinaryOpcode::MessageData => {
                MessageData::decode(&data[1..]).map(ServerBinaryFrame::MessageData)
            }
            ServerBinaryOpcode::Time => Time::decode(&data[1..]).map(ServerBinaryFrame::Time),
            ServerBinaryOpcode::ServiceCallResponse => {
                ServiceCallResponse::decode(&data[1..]).map(ServerBinaryFrame::ServiceCallResponse)
            }
            ServerBinaryOpcode::FetchAssetResponse => {
                FetchAssetResponse::decode(&data[1..]).map(ServerBinaryFrame::FetchAssetResponse)
            }
        }
    }
}

/// A parsed client→server binary frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientBinaryFrame {
    ClientMessageData(ClientMessageData),
    ServiceCallRequest(ServiceCallRequest),
}

impl ClientBinaryFrame {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::ParseError("empty binary frame".into()));
        }
        match ClientBinaryOpcode::from_byte(data[0])? {
            ClientBinaryOpcode::ClientMessageData => {
                ClientMessageData::decode(&data[1..]).map(ClientBinaryFrame::ClientMessageData)
            }
            ClientBinaryOpcode::ServiceCallRequest => {
                ServiceCallRequest::decode(&data[1..]).map(ClientBinaryFrame::ServiceCallRequest)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_data_round_trips() {
        let m = MessageData {
            subscription_id: 1,
            timestamp_ns: 42,
            payload: vec![1, 2, 3],
        };
        let encoded = m.encode();
        assert_eq!(
            encoded,
            vec![0x01, 1, 0, 0, 0, 42, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3]
        );
        let decoded = ServerBinaryFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, ServerBinaryFrame::MessageData(m));
    }

    #[test]
    fn broadcast_template_patches_subscription_id_only() {
        let (mut buf, offset) = MessageData::encode_template(42, &[1, 2, 3]);
        MessageData::patch_subscription_id(&mut buf, offset, 7);
        let decoded = MessageData::decode(&buf[1..]).unwrap();
        assert_eq!(decoded.subscription_id, 7);
        assert_eq!(decoded.timestamp_ns, 42);
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[test]
    fn time_round_trips() {
        let t = Time { timestamp_ns: 42 };
        assert_eq!(t.encode(), vec![0x02, 42, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn service_call_request_response_scenario_s6() {
        let req = ServiceCallRequest {
            service_id: 1,
            call_id: 123,
            encoding: "json".into(),
            payload: vec![1, 2, 3],
        };
        assert_eq!(
            req.encode(),
            vec![
                0x02, 1, 0, 0, 0, 123, 0, 0, 0, 4, 0, 0, 0, b'j', b's', b'o', b'n', 1, 2, 3
            ]
        );
        let resp = ServiceCallResponse {
            service_id: 1,
            call_id: 123,
            encoding: "json".into(),
            payload: vec![4, 5, 6],
        };
        assert_eq!(
            resp.encode(),
            vec![
                0x03, 1, 0, 0, 0, 123, 0, 0, 0, 4, 0, 0, 0, b'j', b's', b'o', b'n', 4, 5, 6
            ]
        );
    }

    #[test]
    fn fetch_asset_response_success_scenario_s7() {
        let resp = FetchAssetResponse::success(123, vec![4, 5, 6]);
        assert_eq!(
            resp.encode(),
            vec![0x04, 123, 0, 0, 0, 0, 0, 0, 0, 0, 4, 5, 6]
        );
    }

    #[test]
    fn fetch_asset_response_error_scenario_s7() {
        let resp = FetchAssetResponse::error(200, "not found");
        let encoded = resp.encode();
        assert_eq!(encoded[0], 0x04);
        assert_eq!(&encoded[1..5], &200u32.to_le_bytes());
        assert_eq!(encoded[5], 1);
        assert_eq!(&encoded[6..10], &9u32.to_le_bytes());
        assert_eq!(&encoded[10..], b"not found");
    }

    #[test]
    fn unknown_binary_opcode_is_rejected() {
        let err = ServerBinaryFrame::decode(&[0xFF]).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOpcode(0xFF)));
    }

    #[test]
    fn reserved_fetch_asset_status_is_rejected() {
        let mut buf = FetchAssetResponse::success(1, vec![]).encode();
        buf[5] = 2; // status byte, opcode occupies buf[0]
        let err = FetchAssetResponse::decode(&buf[1..]).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownStatus(2)));
    }

    #[test]
    fn truncated_frame_is_parse_error_not_panic() {
        let err = MessageData::decode(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::ParseError(_)));
    }
}
