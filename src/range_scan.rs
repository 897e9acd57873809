//! Range-scan option types and wire parsing

use std::time::Duration;

use serde_json::json;
use typed_builder::TypedBuilder;

use crate::binary::leb128;
use crate::binary::opcode::datatype;
use crate::error::{Error, Result};

/// Default upper bound: the highest key the server will serve.
const MAXIMUM_TERM: &[u8] = b"\xf4\x8f\xfb\xfb";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTerm {
    pub term: Vec<u8>,
    pub exclusive: bool,
}

impl ScanTerm {
    pub fn inclusive(term: impl Into<Vec<u8>>) -> ScanTerm {
        ScanTerm { term: term.into(), exclusive: false }
    }

    pub fn exclusive(term: impl Into<Vec<u8>>) -> ScanTerm {
        ScanTerm { term: term.into(), exclusive: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeScan {
    pub from: Option<ScanTerm>,
    pub to: Option<ScanTerm>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixScan {
    pub prefix: Vec<u8>,
}

impl PrefixScan {
    /// A prefix scan is a range scan from the prefix to prefix + 0xff.
    pub fn to_range_scan(&self) -> RangeScan {
        let mut upper = self.prefix.clone();
        upper.push(0xff);
        RangeScan {
            from: Some(ScanTerm::inclusive(self.prefix.clone())),
            to: Some(ScanTerm::exclusive(upper)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingScan {
    pub limit: u64,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanType {
    Range(RangeScan),
    Prefix(PrefixScan),
    Sampling(SamplingScan),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequirements {
    pub vbucket_uuid: u64,
    pub sequence_number: u64,
    pub sequence_number_exists: bool,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct RangeScanCreateOptions {
    pub scan_type: ScanType,
    #[builder(default)]
    pub scope_name: String,
    #[builder(default)]
    pub collection_name: String,
    #[builder(default = 0)]
    pub collection_id: u32,
    #[builder(default = false)]
    pub ids_only: bool,
    #[builder(default)]
    pub snapshot_requirements: Option<SnapshotRequirements>,
    #[builder(default)]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct RangeScanContinueOptions {
    #[builder(default = 0)]
    pub batch_item_limit: u32,
    #[builder(default = 0)]
    pub batch_byte_limit: u32,
    #[builder(default = Duration::ZERO)]
    pub batch_time_limit: Duration,
    #[builder(default)]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeScanCreateResult {
    /// 16-byte scan identifier echoed in continue/cancel.
    pub scan_uuid: Vec<u8>,
    pub ids_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeScanContinueResult {
    pub more: bool,
    pub complete: bool,
    pub ids_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeScanItemBody {
    pub flags: u32,
    pub expiry: u32,
    pub sequence_number: u64,
    pub cas: u64,
    pub datatype: u8,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeScanItem {
    pub key: Vec<u8>,
    pub body: Option<RangeScanItemBody>,
}

pub type ItemCallback = Box<dyn FnMut(RangeScanItem) + Send>;

/// Serialize the create-options body. Sampling requires a positive limit and
/// receives a random seed when none was given.
pub fn serialize_create_options(
    options: &RangeScanCreateOptions,
    default_scan_timeout: Duration,
) -> Result<Vec<u8>> {
    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD;

    let mut body = serde_json::Map::new();
    if options.ids_only {
        body.insert("key_only".into(), json!(true));
    }
    if options.collection_id != 0 {
        body.insert("collection".into(), json!(format!("{:x}", options.collection_id)));
    }

    match &options.scan_type {
        ScanType::Range(_) | ScanType::Prefix(_) => {
            let range = match &options.scan_type {
                ScanType::Range(range) => range.clone(),
                ScanType::Prefix(prefix) => prefix.to_range_scan(),
                ScanType::Sampling(_) => unreachable!(),
            };
            let from = range.from.unwrap_or_else(|| ScanTerm::inclusive(Vec::new()));
            let to = range.to.unwrap_or_else(|| ScanTerm::inclusive(MAXIMUM_TERM.to_vec()));
            body.insert(
                "range".into(),
                json!({
                    (if from.exclusive { "excl_start" } else { "start" }): b64.encode(&from.term),
                    (if to.exclusive { "excl_end" } else { "end" }): b64.encode(&to.term),
                }),
            );
        }
        ScanType::Sampling(sampling) => {
            if sampling.limit == 0 {
                return Err(Error::InvalidArgument("sampling scan requires limit > 0".into()));
            }
            let seed = sampling.seed.unwrap_or_else(rand::random::<u64>);
            body.insert("sampling".into(), json!({ "samples": sampling.limit, "seed": seed }));
        }
    }

    if let Some(snapshot) = &options.snapshot_requirements {
        let timeout = options.timeout.unwrap_or(default_scan_timeout);
        let mut requirements = serde_json::Map::new();
        requirements.insert("vb_uuid".into(), json!(snapshot.vbucket_uuid.to_string()));
        requirements.insert("seqno".into(), json!(snapshot.sequence_number));
        requirements.insert("timeout_ms".into(), json!(timeout.as_millis() as u64));
        if snapshot.sequence_number_exists {
            requirements.insert("seqno_exists".into(), json!(true));
        }
        body.insert("snapshot_requirements".into(), json!(requirements));
    }

    serde_json::to_vec(&body).map_err(|err| Error::EncodingFailure(err.to_string()))
}

/// Continue extras: scan uuid, item limit, time limit (ms), byte limit.
pub fn continue_extras(scan_uuid: &[u8], options: &RangeScanContinueOptions) -> Vec<u8> {
    let mut extras = Vec::with_capacity(scan_uuid.len() + 12);
    extras.extend_from_slice(scan_uuid);
    extras.extend_from_slice(&options.batch_item_limit.to_be_bytes());
    extras.extend_from_slice(&(options.batch_time_limit.as_millis() as u32).to_be_bytes());
    extras.extend_from_slice(&options.batch_byte_limit.to_be_bytes());
    extras
}

/// Parse an ids-only continue payload: leb128-length-prefixed keys.
pub fn parse_keys(mut data: &[u8], items: &mut ItemCallback) -> Result<()> {
    while !data.is_empty() {
        let Some((key_length, consumed)) = leb128::decode(data) else {
            return Err(Error::ProtocolError("truncated key length".into()));
        };
        let key_length = key_length as usize;
        data = &data[consumed..];
        if data.len() < key_length {
            return Err(Error::ProtocolError("truncated key".into()));
        }
        items(RangeScanItem { key: data[..key_length].to_vec(), body: None });
        data = &data[key_length..];
    }
    Ok(())
}

/// Parse a documents continue payload: fixed item header, then key and value,
/// each leb128-length-prefixed. Snappy values are decompressed transparently.
pub fn parse_documents(mut data: &[u8], items: &mut ItemCallback) -> Result<()> {
    const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 1;
    while !data.is_empty() {
        if data.len() < HEADER_LEN {
            return Err(Error::ProtocolError("truncated item header".into()));
        }
        let flags = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let expiry = u32::from_be_bytes(data[4..8].try_into().unwrap());
        let sequence_number = u64::from_be_bytes(data[8..16].try_into().unwrap());
        let cas = u64::from_be_bytes(data[16..24].try_into().unwrap());
        let mut item_datatype = data[24];
        data = &data[HEADER_LEN..];

        let Some((key_length, consumed)) = leb128::decode(data) else {
            return Err(Error::ProtocolError("truncated key length".into()));
        };
        let key_length = key_length as usize;
        data = &data[consumed..];
        if data.len() < key_length {
            return Err(Error::ProtocolError("truncated key".into()));
        }
        let key = data[..key_length].to_vec();
        data = &data[key_length..];

        let Some((value_length, consumed)) = leb128::decode(data) else {
            return Err(Error::ProtocolError("truncated value length".into()));
        };
        let value_length = value_length as usize;
        data = &data[consumed..];
        if data.len() < value_length {
            return Err(Error::ProtocolError("truncated value".into()));
        }
        let mut value = data[..value_length].to_vec();
        data = &data[value_length..];

        if item_datatype & datatype::SNAPPY != 0 {
            if let Ok(decompressed) = snap::raw::Decoder::new().decompress_vec(&value) {
                value = decompressed;
                item_datatype &= !datatype::SNAPPY;
            }
        }

        items(RangeScanItem {
            key,
            body: Some(RangeScanItemBody {
                flags,
                expiry,
                sequence_number,
                cas,
                datatype: item_datatype,
                value,
            }),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collector() -> (Arc<Mutex<Vec<RangeScanItem>>>, ItemCallback) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        let callback: ItemCallback = Box::new(move |item| sink.lock().unwrap().push(item));
        (collected, callback)
    }

    #[test]
    fn range_body_encodes_terms_base64() {
        let options = RangeScanCreateOptions::builder()
            .scan_type(ScanType::Range(RangeScan {
                from: Some(ScanTerm::inclusive(b"aaa".to_vec())),
                to: Some(ScanTerm::exclusive(b"zzz".to_vec())),
            }))
            .ids_only(true)
            .build();
        let body = serialize_create_options(&options, Duration::from_secs(75)).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["key_only"], true);
        assert_eq!(parsed["range"]["start"], "YWFh");
        assert_eq!(parsed["range"]["excl_end"], "enp6");
    }

    #[test]
    fn default_range_covers_the_full_keyspace() {
        let options = RangeScanCreateOptions::builder()
            .scan_type(ScanType::Range(RangeScan::default()))
            .build();
        let body = serialize_create_options(&options, Duration::from_secs(75)).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["range"]["start"], "");
        assert_eq!(parsed["range"]["end"], "9I/7+w==");
    }

    #[test]
    fn sampling_requires_positive_limit() {
        let options = RangeScanCreateOptions::builder()
            .scan_type(ScanType::Sampling(SamplingScan { limit: 0, seed: None }))
            .build();
        let result = serialize_create_options(&options, Duration::from_secs(75));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn sampling_generates_a_seed_when_absent() {
        let options = RangeScanCreateOptions::builder()
            .scan_type(ScanType::Sampling(SamplingScan { limit: 32, seed: None }))
            .build();
        let body = serialize_create_options(&options, Duration::from_secs(75)).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["sampling"]["samples"], 32);
        assert!(parsed["sampling"]["seed"].is_u64());
    }

    #[test]
    fn snapshot_requirements_serialize_with_string_uuid() {
        let options = RangeScanCreateOptions::builder()
            .scan_type(ScanType::Prefix(PrefixScan { prefix: b"user::".to_vec() }))
            .snapshot_requirements(Some(SnapshotRequirements {
                vbucket_uuid: 0xdead_beef,
                sequence_number: 42,
                sequence_number_exists: true,
            }))
            .timeout(Some(Duration::from_secs(10)))
            .build();
        let body = serialize_create_options(&options, Duration::from_secs(75)).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["snapshot_requirements"]["vb_uuid"], "3735928559");
        assert_eq!(parsed["snapshot_requirements"]["seqno"], 42);
        assert_eq!(parsed["snapshot_requirements"]["timeout_ms"], 10_000);
        assert_eq!(parsed["snapshot_requirements"]["seqno_exists"], true);
    }

    #[test]
    fn continue_extras_layout() {
        let uuid = [7u8; 16];
        let options = RangeScanContinueOptions::builder()
            .batch_item_limit(100)
            .batch_byte_limit(1 << 20)
            .batch_time_limit(Duration::from_millis(250))
            .build();
        let extras = continue_extras(&uuid, &options);
        assert_eq!(extras.len(), 28);
        assert_eq!(&extras[..16], &uuid);
        assert_eq!(u32::from_be_bytes(extras[16..20].try_into().unwrap()), 100);
        assert_eq!(u32::from_be_bytes(extras[20..24].try_into().unwrap()), 250);
        assert_eq!(u32::from_be_bytes(extras[24..28].try_into().unwrap()), 1 << 20);
    }

    #[test]
    fn parses_ids_only_payload() {
        let mut payload = Vec::new();
        for key in [b"alpha".as_slice(), b"beta", b"gamma"] {
            payload.extend_from_slice(&leb128::encode(key.len() as u64));
            payload.extend_from_slice(key);
        }
        let (collected, mut callback) = collector();
        parse_keys(&payload, &mut callback).unwrap();
        let items = collected.lock().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].key, b"alpha");
        assert!(items[2].body.is_none());
    }

    #[test]
    fn parses_document_payload_with_snappy_value() {
        let value = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let compressed = snap::raw::Encoder::new().compress_vec(&value).unwrap();

        let mut payload = Vec::new();
        payload.extend_from_slice(&7u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&99u64.to_be_bytes());
        payload.extend_from_slice(&0xabcdu64.to_be_bytes());
        payload.push(datatype::JSON | datatype::SNAPPY);
        payload.extend_from_slice(&leb128::encode(3));
        payload.extend_from_slice(b"doc");
        payload.extend_from_slice(&leb128::encode(compressed.len() as u64));
        payload.extend_from_slice(&compressed);

        let (collected, mut callback) = collector();
        parse_documents(&payload, &mut callback).unwrap();
        let items = collected.lock().unwrap();
        assert_eq!(items.len(), 1);
        let body = items[0].body.as_ref().unwrap();
        assert_eq!(body.flags, 7);
        assert_eq!(body.sequence_number, 99);
        assert_eq!(body.cas, 0xabcd);
        assert_eq!(body.value, value);
        assert_eq!(body.datatype & datatype::SNAPPY, 0);
    }

    #[test]
    fn truncated_document_payload_is_a_protocol_error() {
        let (_, mut callback) = collector();
        assert!(parse_documents(&[0u8; 10], &mut callback).is_err());
    }
}
