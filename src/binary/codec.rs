//! Bit-exact framing of the binary protocol, classic and alt-magic forms

use std::collections::HashSet;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use crate::binary::leb128;
use crate::binary::opcode::{
    DurabilityLevel, HelloFeature, Magic, Opcode, datatype, request_frame, response_frame,
};
use crate::binary::packet::{DurabilityFrame, Packet, UnsupportedFrame};
use crate::binary::server_duration::{decode_server_duration, encode_server_duration};
use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 24;

/// Compress the value only when it shrinks below this fraction of the input.
const SNAPPY_MIN_RATIO: f64 = 0.83;

#[derive(Debug, Clone)]
pub struct Codec {
    features: HashSet<HelloFeature>,
    collections: bool,
}

impl Default for Codec {
    fn default() -> Self {
        Codec::new(HashSet::new())
    }
}

impl Codec {
    pub fn new(features: HashSet<HelloFeature>) -> Codec {
        let collections = features.contains(&HelloFeature::Collections);
        Codec { features, collections }
    }

    pub fn enable_feature(&mut self, feature: HelloFeature) {
        if feature == HelloFeature::Collections {
            self.collections = true;
        }
        self.features.insert(feature);
    }

    pub fn is_feature_enabled(&self, feature: HelloFeature) -> bool {
        self.features.contains(&feature)
    }

    /// Try to Snappy-compress `value`. Returns the compressed bytes only when
    /// compression pays for itself, per the ratio rule.
    pub fn maybe_compress(&self, value: &[u8]) -> Option<Vec<u8>> {
        if !self.is_feature_enabled(HelloFeature::Snappy) || value.is_empty() {
            return None;
        }
        let compressed = snap::raw::Encoder::new().compress_vec(value).ok()?;
        if (compressed.len() as f64) < (value.len() as f64) * SNAPPY_MIN_RATIO {
            Some(compressed)
        } else {
            None
        }
    }

    pub fn encode_packet(&self, packet: &Packet) -> Result<Vec<u8>> {
        let mut encoded_key = packet.key.clone();
        let mut extras = packet.extras.clone();

        if self.collections {
            if packet.opcode == Opcode::Observe {
                // the observe key hides inside the value, which the collection
                // prefix scheme cannot express
                debug!("the observe operation is not supported with collections enabled");
                return Err(Error::UnsupportedOperation("observe with collections".into()));
            }
            if packet.opcode.supports_collection_id() {
                // an empty key takes no prefix; there is nothing to scope
                if !encoded_key.is_empty() {
                    let prefix = leb128::encode(u64::from(packet.collection_id));
                    let mut prefixed = Vec::with_capacity(prefix.len() + encoded_key.len());
                    prefixed.extend_from_slice(&prefix);
                    prefixed.extend_from_slice(&encoded_key);
                    encoded_key = prefixed;
                }
            } else if packet.opcode == Opcode::GetRandomKey {
                // GetRandomKey carries the collection id as plain BE32 extras
                extras = packet.collection_id.to_be_bytes().to_vec();
            } else if packet.collection_id > 0 {
                debug!("cannot encode collection id with a non-collection command");
                return Err(Error::InvalidArgument(
                    "collection id set on an opcode without collection support".into(),
                ));
            }
        }

        let frames_len = self.frame_extras_len(packet)?;

        let mut magic = packet.magic;
        if frames_len > 0 {
            match magic {
                Magic::ClientRequest => {
                    if !self.is_feature_enabled(HelloFeature::AltRequestSupport) {
                        debug!("cannot use frames in request packets without enabling the feature");
                        return Err(Error::UnsupportedOperation(
                            "frame extras without alt-request support".into(),
                        ));
                    }
                    magic = Magic::AltClientRequest;
                }
                Magic::ClientResponse => magic = Magic::AltClientResponse,
                _ => {
                    debug!("cannot use frames with an unsupported magic");
                    return Err(Error::UnsupportedOperation("frame extras with alt magic input".into()));
                }
            }
        }

        let total_body =
            frames_len + extras.len() + encoded_key.len() + packet.value.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + total_body);
        buf.put_u8(magic as u8);
        buf.put_u8(packet.opcode as u8);
        if frames_len > 0 {
            buf.put_u8(frames_len as u8);
            buf.put_u8(encoded_key.len() as u8);
        } else {
            buf.put_u16(encoded_key.len() as u16);
        }
        buf.put_u8(extras.len() as u8);
        buf.put_u8(packet.datatype);
        match packet.magic {
            Magic::ClientRequest | Magic::AltClientRequest => {
                if packet.status != 0 {
                    debug!("cannot specify status in a request packet");
                    return Err(Error::InvalidArgument("status set on a request packet".into()));
                }
                buf.put_u16(packet.vbucket);
            }
            Magic::ClientResponse | Magic::AltClientResponse => {
                if packet.vbucket != 0 {
                    debug!("cannot specify vbucket in a response packet");
                    return Err(Error::InvalidArgument("vbucket set on a response packet".into()));
                }
                buf.put_u16(packet.status);
            }
        }
        buf.put_u32(total_body as u32);
        buf.put_u32(packet.opaque);
        buf.put_u64(packet.cas);

        self.encode_frame_extras(packet, &mut buf)?;

        buf.put_slice(&extras);
        buf.put_slice(&encoded_key);
        buf.put_slice(&packet.value);

        Ok(buf.to_vec())
    }

    fn frame_extras_len(&self, packet: &Packet) -> Result<usize> {
        let mut frames_len = 0usize;
        if packet.barrier {
            frames_len += 1;
        }
        if let Some(durability) = &packet.durability {
            frames_len += if durability.timeout.is_some() { 4 } else { 2 };
        }
        if packet.stream_id.is_some() {
            frames_len += 3;
        }
        if let Some(context) = &packet.open_tracing_context {
            frames_len += context.len() + if context.len() < 15 { 1 } else { 2 };
        }
        if packet.server_duration.is_some() {
            frames_len += 3;
        }
        if let Some(user) = &packet.user_impersonation {
            frames_len += user.len() + if user.len() < 15 { 1 } else { 2 };
        }
        if packet.preserve_expiry {
            frames_len += 1;
        }
        if !packet.unsupported_frames.is_empty() {
            debug!("cannot send packets with unsupported frames");
            return Err(Error::InvalidArgument("unsupported frames on an outgoing packet".into()));
        }
        Ok(frames_len)
    }

    fn encode_frame_extras(&self, packet: &Packet, buf: &mut BytesMut) -> Result<()> {
        if packet.barrier {
            require_request(packet, "barrier")?;
            write_frame_header(buf, request_frame::BARRIER, 0);
        }
        if let Some(durability) = &packet.durability {
            require_request(packet, "durability level")?;
            if !self.is_feature_enabled(HelloFeature::SyncReplication) {
                debug!("cannot use sync replication frames without enabling the feature");
                return Err(Error::FeatureNotAvailable("sync replication".into()));
            }
            match durability.timeout {
                Some(timeout) => {
                    let millis = timeout.as_millis().min(65535) as u16;
                    write_frame_header(buf, request_frame::SYNC_DURABILITY, 3);
                    buf.put_u8(durability.level as u8);
                    buf.put_u16(millis);
                }
                None => {
                    write_frame_header(buf, request_frame::SYNC_DURABILITY, 1);
                    buf.put_u8(durability.level as u8);
                }
            }
        }
        if let Some(stream_id) = packet.stream_id {
            require_request(packet, "stream id")?;
            write_frame_header(buf, request_frame::STREAM_ID, 2);
            buf.put_u16(stream_id);
        }
        if let Some(context) = &packet.open_tracing_context {
            require_request(packet, "open tracing")?;
            if !self.is_feature_enabled(HelloFeature::OpenTracing) {
                debug!("cannot use open tracing frames without enabling the feature");
                return Err(Error::FeatureNotAvailable("open tracing".into()));
            }
            write_escaped_frame(buf, request_frame::OPEN_TRACING, context);
        }
        if let Some(duration) = packet.server_duration {
            if packet.magic != Magic::ClientResponse {
                debug!("cannot use server duration frame in non-response packets");
                return Err(Error::InvalidArgument("server duration on a request packet".into()));
            }
            write_frame_header(buf, response_frame::SERVER_DURATION, 2);
            buf.put_u16(encode_server_duration(duration));
        }
        if let Some(user) = &packet.user_impersonation {
            require_request(packet, "user impersonation")?;
            write_escaped_frame(buf, request_frame::USER_IMPERSONATION, user);
        }
        if packet.preserve_expiry {
            require_request(packet, "preserve expiry")?;
            if !self.is_feature_enabled(HelloFeature::PreserveTtl) {
                debug!("cannot use preserve expiry frame without enabling the feature");
                return Err(Error::FeatureNotAvailable("preserve expiry".into()));
            }
            write_frame_header(buf, request_frame::PRESERVE_EXPIRY, 0);
        }
        Ok(())
    }

    /// Decode one packet from `input`. Returns the packet and the number of
    /// bytes consumed.
    pub fn decode_packet(&self, input: &[u8]) -> Result<(Packet, usize)> {
        if input.is_empty() {
            return Err(Error::EndOfStream);
        }
        if input.len() < HEADER_LEN {
            return Err(Error::NeedMoreData);
        }
        let body_len = u32::from_be_bytes([input[8], input[9], input[10], input[11]]) as usize;
        if input.len() < HEADER_LEN + body_len {
            return Err(Error::NeedMoreData);
        }
        self.decode_parts(&input[..HEADER_LEN], &input[HEADER_LEN..HEADER_LEN + body_len])
    }

    fn decode_parts(&self, header: &[u8], body: &[u8]) -> Result<(Packet, usize)> {
        let wire_magic = Magic::from_u8(header[0]).ok_or_else(|| {
            debug!("cannot decode status/vbucket for unknown packet magic");
            Error::ProtocolError(format!("unknown magic {:#04x}", header[0]))
        })?;
        let opcode = Opcode::from_u8(header[1]);

        let mut packet = if wire_magic.is_request() {
            let mut p = Packet::request(opcode);
            p.vbucket = u16::from_be_bytes([header[6], header[7]]);
            p
        } else {
            let mut p = Packet::response(opcode);
            p.status = u16::from_be_bytes([header[6], header[7]]);
            p
        };
        packet.datatype = header[5];
        packet.opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
        packet.cas = u64::from_be_bytes(header[16..24].try_into().expect("8-byte cas field"));

        let ext_len = header[4] as usize;
        let (key_len, frames_len) = match wire_magic {
            Magic::AltClientRequest | Magic::AltClientResponse => {
                (header[3] as usize, header[2] as usize)
            }
            _ => (u16::from_be_bytes([header[2], header[3]]) as usize, 0),
        };

        if frames_len + ext_len + key_len > body.len() {
            debug!(
                frames_len,
                ext_len,
                key_len,
                body_len = body.len(),
                "section lengths exceed the body"
            );
            return Err(Error::ProtocolError("section lengths exceed body".into()));
        }
        let value_len = body.len() - frames_len - ext_len - key_len;

        if frames_len > 0 {
            self.decode_frame_extras(wire_magic, &body[..frames_len], &mut packet)?;
        }
        if ext_len > 0 {
            packet.extras = body[frames_len..frames_len + ext_len].to_vec();
        }
        if key_len > 0 {
            packet.key = body[frames_len + ext_len..frames_len + ext_len + key_len].to_vec();
        }
        if value_len > 0 {
            packet.value = body[frames_len + ext_len + key_len..].to_vec();
        }

        if self.collections {
            if packet.opcode == Opcode::Observe {
                debug!("the observe operation is not supported with collections enabled");
                return Err(Error::FeatureNotAvailable("observe with collections".into()));
            }
            if !packet.key.is_empty() && packet.opcode.supports_collection_id() {
                let Some((id, consumed)) = leb128::decode(&packet.key) else {
                    debug!("unable to decode collection id");
                    return Err(Error::ProtocolError("truncated collection id prefix".into()));
                };
                packet.collection_id = id as u32;
                packet.key.drain(..consumed);
            }
        }

        if packet.magic.is_response() && packet.datatype & datatype::SNAPPY != 0 {
            let decompressed = snap::raw::Decoder::new()
                .decompress_vec(&packet.value)
                .map_err(|err| Error::DecodingFailure(format!("snappy: {err}")))?;
            packet.value = decompressed;
            packet.datatype &= !datatype::SNAPPY;
        }

        Ok((packet, HEADER_LEN + body.len()))
    }

    fn decode_frame_extras(&self, magic: Magic, frames: &[u8], packet: &mut Packet) -> Result<()> {
        let mut buf = frames;
        while buf.has_remaining() {
            let frame_header = buf.get_u8();
            let mut frame_type = (frame_header & 0xf0) >> 4;
            if frame_type == 0x0f {
                if !buf.has_remaining() {
                    return Err(Error::ProtocolError("truncated frame type escape".into()));
                }
                frame_type += buf.get_u8();
            }
            let mut frame_len = (frame_header & 0x0f) as usize;
            if frame_len == 0x0f {
                if !buf.has_remaining() {
                    return Err(Error::ProtocolError("truncated frame length escape".into()));
                }
                frame_len += buf.get_u8() as usize;
            }
            if buf.remaining() < frame_len {
                return Err(Error::ProtocolError("truncated frame payload".into()));
            }
            let payload = &buf.chunk()[..frame_len];

            match magic {
                Magic::AltClientRequest => match (frame_type, frame_len) {
                    (request_frame::BARRIER, 0) => packet.barrier = true,
                    (request_frame::SYNC_DURABILITY, 1 | 3) => {
                        let level = DurabilityLevel::from_u8(payload[0]).ok_or_else(|| {
                            Error::ProtocolError(format!("invalid durability level {}", payload[0]))
                        })?;
                        // duplicate frames overwrite previous ones; the timeout
                        // is virtual here, so a short frame clears it
                        let timeout = if frame_len == 3 {
                            Some(Duration::from_millis(u64::from(u16::from_be_bytes([
                                payload[1], payload[2],
                            ]))))
                        } else {
                            None
                        };
                        packet.durability = Some(DurabilityFrame { level, timeout });
                    }
                    (request_frame::STREAM_ID, 2) => {
                        packet.stream_id = Some(u16::from_be_bytes([payload[0], payload[1]]));
                    }
                    (request_frame::OPEN_TRACING, n) if n > 0 => {
                        packet.open_tracing_context = Some(payload.to_vec());
                    }
                    (request_frame::PRESERVE_EXPIRY, 0) => packet.preserve_expiry = true,
                    (request_frame::USER_IMPERSONATION, n) if n > 0 => {
                        packet.user_impersonation = Some(payload.to_vec());
                    }
                    _ => packet.unsupported_frames.push(UnsupportedFrame {
                        frame_type,
                        data: payload.to_vec(),
                    }),
                },
                Magic::AltClientResponse => match (frame_type, frame_len) {
                    (response_frame::SERVER_DURATION, 2) => {
                        packet.server_duration = Some(decode_server_duration(u16::from_be_bytes([
                            payload[0], payload[1],
                        ])));
                    }
                    (response_frame::READ_UNITS, 2) => {
                        packet.read_units = Some(u16::from_be_bytes([payload[0], payload[1]]));
                    }
                    (response_frame::WRITE_UNITS, 2) => {
                        packet.write_units = Some(u16::from_be_bytes([payload[0], payload[1]]));
                    }
                    _ => packet.unsupported_frames.push(UnsupportedFrame {
                        frame_type,
                        data: payload.to_vec(),
                    }),
                },
                _ => {
                    debug!("got unexpected magic when decoding frames");
                    return Err(Error::ProtocolError("frame extras on classic magic".into()));
                }
            }
            buf.advance(frame_len);
        }
        Ok(())
    }
}

fn require_request(packet: &Packet, frame: &str) -> Result<()> {
    if packet.magic != Magic::ClientRequest {
        debug!("cannot use {frame} frame in non-request packets");
        return Err(Error::InvalidArgument(format!("{frame} frame on a non-request packet")));
    }
    Ok(())
}

fn write_frame_header(buf: &mut BytesMut, frame_type: u8, frame_len: usize) {
    buf.put_u8((frame_type << 4) | frame_len as u8);
}

fn write_escaped_frame(buf: &mut BytesMut, frame_type: u8, payload: &[u8]) {
    if payload.len() < 15 {
        write_frame_header(buf, frame_type, payload.len());
    } else {
        write_frame_header(buf, frame_type, 15);
        buf.put_u8((payload.len() - 15) as u8);
    }
    buf.put_slice(payload);
}
