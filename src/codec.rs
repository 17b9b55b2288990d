//! Transport Codec collaborator interface.
//!
//! Binary encoding of command sets and datasets lives outside this crate;
//! the exchange layer only requires something that can turn typed values
//! into bytes and back. [`JsonCodec`] is the built-in implementation used by
//! the loopback transport and by tests.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use dicom_core::{Tag, VR};
use serde_json::{json, Value as Json};

use crate::error::{DimseError, Result};
use crate::record::{Element, Record, Value};
use crate::types::CommandSet;

/// Encodes and decodes command sets and dataset records
pub trait Codec: Send + Sync {
    /// Encode a command set into bytes
    fn encode_command(&self, command: &CommandSet) -> Result<Bytes>;

    /// Decode a command set from bytes
    fn decode_command(&self, data: &[u8]) -> Result<CommandSet>;

    /// Encode a record using the given transfer syntax
    fn encode_record(&self, record: &Record, transfer_syntax: &str) -> Result<Bytes>;

    /// Decode a record using the given transfer syntax
    fn decode_record(&self, data: &[u8], transfer_syntax: &str) -> Result<Record>;
}

/// JSON-backed codec for in-process transports and tests
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_command(&self, command: &CommandSet) -> Result<Bytes> {
        let data = serde_json::to_vec(command)?;
        Ok(Bytes::from(data))
    }

    fn decode_command(&self, data: &[u8]) -> Result<CommandSet> {
        Ok(serde_json::from_slice(data)?)
    }

    fn encode_record(&self, record: &Record, _transfer_syntax: &str) -> Result<Bytes> {
        let data = serde_json::to_vec(&record_to_json(record))?;
        Ok(Bytes::from(data))
    }

    fn decode_record(&self, data: &[u8], _transfer_syntax: &str) -> Result<Record> {
        let json: Json = serde_json::from_slice(data)?;
        record_from_json(&json)
    }
}

fn record_to_json(record: &Record) -> Json {
    let elements: Vec<Json> = record
        .iter()
        .map(|(tag, element)| {
            let mut entry = serde_json::Map::new();
            entry.insert(
                "tag".to_string(),
                json!(format!("{:04X}{:04X}", tag.group(), tag.element())),
            );
            entry.insert("vr".to_string(), json!(vr_symbol(element.vr)));
            match &element.value {
                Value::Strings(values) => {
                    entry.insert("values".to_string(), json!(values));
                }
                Value::Bytes(data) => {
                    entry.insert("bytes".to_string(), json!(BASE64.encode(data)));
                }
                Value::Items(items) => {
                    let items: Vec<Json> = items.iter().map(record_to_json).collect();
                    entry.insert("items".to_string(), json!(items));
                }
            }
            Json::Object(entry)
        })
        .collect();
    Json::Array(elements)
}

fn record_from_json(json: &Json) -> Result<Record> {
    let elements = json
        .as_array()
        .ok_or_else(|| DimseError::Codec("record is not an array".into()))?;

    let mut record = Record::new();
    for entry in elements {
        let tag = entry
            .get("tag")
            .and_then(Json::as_str)
            .ok_or_else(|| DimseError::Codec("element without tag".into()))?;
        let tag = parse_tag(tag)?;
        let vr = entry
            .get("vr")
            .and_then(Json::as_str)
            .map(vr_from_symbol)
            .unwrap_or(VR::UN);

        let element = if let Some(values) = entry.get("values").and_then(Json::as_array) {
            let values: Vec<String> = values
                .iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect();
            Element {
                vr,
                value: Value::Strings(values),
            }
        } else if let Some(data) = entry.get("bytes").and_then(Json::as_str) {
            let data = BASE64
                .decode(data)
                .map_err(|e| DimseError::Codec(format!("invalid binary value: {}", e)))?;
            Element {
                vr,
                value: Value::Bytes(Bytes::from(data)),
            }
        } else if let Some(items) = entry.get("items").and_then(Json::as_array) {
            let items: Vec<Record> = items
                .iter()
                .map(record_from_json)
                .collect::<Result<_>>()?;
            Element {
                vr,
                value: Value::Items(items),
            }
        } else {
            return Err(DimseError::Codec(format!("element {} without value", tag)));
        };
        record.put(tag, element);
    }
    Ok(record)
}

fn parse_tag(s: &str) -> Result<Tag> {
    if s.len() != 8 {
        return Err(DimseError::Codec(format!("invalid tag: {}", s)));
    }
    let group = u16::from_str_radix(&s[0..4], 16)
        .map_err(|_| DimseError::Codec(format!("invalid tag: {}", s)))?;
    let element = u16::from_str_radix(&s[4..8], 16)
        .map_err(|_| DimseError::Codec(format!("invalid tag: {}", s)))?;
    Ok(Tag(group, element))
}

fn vr_symbol(vr: VR) -> &'static str {
    match vr {
        VR::AE => "AE",
        VR::AS => "AS",
        VR::AT => "AT",
        VR::CS => "CS",
        VR::DA => "DA",
        VR::DS => "DS",
        VR::DT => "DT",
        VR::FL => "FL",
        VR::FD => "FD",
        VR::IS => "IS",
        VR::LO => "LO",
        VR::LT => "LT",
        VR::OB => "OB",
        VR::OD => "OD",
        VR::OF => "OF",
        VR::OL => "OL",
        VR::OW => "OW",
        VR::PN => "PN",
        VR::SH => "SH",
        VR::SL => "SL",
        VR::SQ => "SQ",
        VR::SS => "SS",
        VR::ST => "ST",
        VR::TM => "TM",
        VR::UC => "UC",
        VR::UI => "UI",
        VR::UL => "UL",
        VR::UR => "UR",
        VR::US => "US",
        VR::UT => "UT",
        _ => "UN",
    }
}

fn vr_from_symbol(s: &str) -> VR {
    match s {
        "AE" => VR::AE,
        "AS" => VR::AS,
        "AT" => VR::AT,
        "CS" => VR::CS,
        "DA" => VR::DA,
        "DS" => VR::DS,
        "DT" => VR::DT,
        "FL" => VR::FL,
        "FD" => VR::FD,
        "IS" => VR::IS,
        "LO" => VR::LO,
        "LT" => VR::LT,
        "OB" => VR::OB,
        "OD" => VR::OD,
        "OF" => VR::OF,
        "OL" => VR::OL,
        "OW" => VR::OW,
        "PN" => VR::PN,
        "SH" => VR::SH,
        "SL" => VR::SL,
        "SQ" => VR::SQ,
        "SS" => VR::SS,
        "ST" => VR::ST,
        "TM" => VR::TM,
        "UC" => VR::UC,
        "UI" => VR::UI,
        "UL" => VR::UL,
        "UR" => VR::UR,
        "US" => VR::US,
        "UT" => VR::UT,
        _ => VR::UN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommandField, Status};
    use dicom_dictionary_std::tags;

    #[test]
    fn test_command_codec() {
        let codec = JsonCodec;
        let command = CommandSet::request(CommandField::CFindRq, 3)
            .with_sop_class("1.2.840.10008.5.1.4.1.2.2.1")
            .with_dataset();
        let bytes = codec.encode_command(&command).unwrap();
        let decoded = codec.decode_command(&bytes).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_command_codec_response() {
        let codec = JsonCodec;
        let rq = CommandSet::request(CommandField::CEchoRq, 1);
        let rsp = CommandSet::response(&rq, Status::SUCCESS);
        let decoded = codec
            .decode_command(&codec.encode_command(&rsp).unwrap())
            .unwrap();
        assert_eq!(decoded.responded_to, Some(1));
        assert_eq!(decoded.status, Some(Status::SUCCESS));
    }

    #[test]
    fn test_record_codec_nested() {
        let codec = JsonCodec;

        let mut item = Record::new();
        item.put_str(tags::CODE_VALUE, VR::SH, "BP");

        let mut record = Record::new();
        record.put_str(tags::PATIENT_ID, VR::LO, "PAT001");
        record.put_str(tags::PATIENT_NAME, VR::PN, "DOE^JOHN");
        record.put_bytes(tags::PIXEL_DATA, VR::OB, Bytes::from_static(b"\x00\x01\x02"));
        record.put_items(tags::PROCEDURE_CODE_SEQUENCE, vec![item]);

        let bytes = codec.encode_record(&record, "1.2.840.10008.1.2.1").unwrap();
        let decoded = codec.decode_record(&bytes, "1.2.840.10008.1.2.1").unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = JsonCodec;
        assert!(codec.decode_command(b"not json").is_err());
        assert!(codec.decode_record(b"{}", "ts").is_err());
    }
}
