//! gRPC-JSON transcoding
//!
//! Clusters with a transcoder accept `POST /pkg.Service/Method` with a JSON
//! body, send the protobuf encoding upstream over gRPC and turn the reply
//! back into JSON. Messages are encoded from the cluster's descriptor set
//! with the proto3 JSON mapping; only unary methods are transcoded.

use crate::error::ProxyError;
use crate::forwarder::UpstreamTrailers;
use crate::grpc::{self, GRPC_CONTENT_TYPE, GRPC_MESSAGE, GRPC_STATUS};
use crate::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use edge_api::v1::options::GrpcJsonTranscoder;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Response};
use prost::bytes::{Buf, BufMut};
use prost::encoding::{decode_key, decode_varint, encode_key, encode_varint, WireType};
use prost::Message;
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{DescriptorProto, EnumDescriptorProto, FieldDescriptorProto, FileDescriptorSet};
use serde_json::{json, Map, Number, Value};
use std::collections::HashMap;
use tracing::debug;

const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrpcMethod {
    pub path: String,
    pub input: String,
    pub output: String,
}

#[derive(Debug)]
pub struct Transcoder {
    messages: HashMap<String, DescriptorProto>,
    enums: HashMap<String, EnumDescriptorProto>,
    methods: HashMap<String, GrpcMethod>,
}

impl Transcoder {
    pub fn new(config: &GrpcJsonTranscoder) -> Result<Self> {
        let encoded = config.proto_descriptor_bin.as_deref().ok_or_else(|| {
            ProxyError::InvalidConfiguration("transcoder has no proto descriptor".into())
        })?;
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ProxyError::InvalidConfiguration(format!("proto descriptor is not base64: {}", e)))?;
        let set = FileDescriptorSet::decode(raw.as_slice())
            .map_err(|e| ProxyError::InvalidConfiguration(format!("invalid proto descriptor: {}", e)))?;
        Self::from_descriptor_set(set, &config.services)
    }

    pub fn from_descriptor_set(set: FileDescriptorSet, services: &[String]) -> Result<Self> {
        let mut transcoder = Self {
            messages: HashMap::new(),
            enums: HashMap::new(),
            methods: HashMap::new(),
        };
        let mut found = Vec::new();
        for file in set.file {
            let scope = match file.package() {
                "" => String::new(),
                package => format!(".{}", package),
            };
            for message in file.message_type {
                transcoder.add_message(&scope, message);
            }
            for en in file.enum_type {
                transcoder.enums.insert(format!("{}.{}", scope, en.name()), en);
            }
            for service in &file.service {
                let name = scope
                    .strip_prefix('.')
                    .map(|package| format!("{}.{}", package, service.name()))
                    .unwrap_or_else(|| service.name().to_string());
                if !services.contains(&name) {
                    continue;
                }
                for method in &service.method {
                    if method.client_streaming() || method.server_streaming() {
                        debug!(service = %name, method = %method.name(), "Skipping streaming method");
                        continue;
                    }
                    let path = format!("/{}/{}", name, method.name());
                    transcoder.methods.insert(
                        path.clone(),
                        GrpcMethod {
                            path,
                            input: method.input_type().to_string(),
                            output: method.output_type().to_string(),
                        },
                    );
                }
                found.push(name);
            }
        }
        if let Some(missing) = services.iter().find(|s| !found.contains(s)) {
            return Err(ProxyError::InvalidConfiguration(format!(
                "service {} not in proto descriptor",
                missing
            )));
        }
        Ok(transcoder)
    }

    fn add_message(&mut self, scope: &str, mut message: DescriptorProto) {
        let name = format!("{}.{}", scope, message.name());
        for nested in std::mem::take(&mut message.nested_type) {
            self.add_message(&name, nested);
        }
        for en in std::mem::take(&mut message.enum_type) {
            self.enums.insert(format!("{}.{}", name, en.name()), en);
        }
        self.messages.insert(name, message);
    }

    /// The unary method a JSON request maps to
    pub fn method(&self, method: &Method, path: &str) -> Option<&GrpcMethod> {
        if method != Method::POST {
            return None;
        }
        let path = path.split('?').next().unwrap_or(path);
        self.methods.get(path)
    }

    /// Encode a JSON body as one framed request message and switch the headers to gRPC
    pub fn encode_request(&self, method: &GrpcMethod, headers: &mut HeaderMap, body: &[u8]) -> Result<Bytes> {
        let value: Value = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Object(Map::new())
        } else {
            serde_json::from_slice(body).map_err(|e| ProxyError::Grpc(format!("invalid JSON body: {}", e)))?
        };
        let mut buf = Vec::new();
        self.encode_message(&method.input, &value, &mut buf)?;
        grpc::set_request_headers(headers);
        Ok(grpc::frame(&buf))
    }

    /// Turn a gRPC reply into JSON; replies that are not gRPC pass through
    pub fn decode_response(&self, method: &GrpcMethod, response: Response<Bytes>) -> Result<Response<Bytes>> {
        let is_grpc = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with(GRPC_CONTENT_TYPE));
        if !is_grpc {
            return Ok(response);
        }

        let status = grpc::status(&response);
        let (mut parts, body) = response.into_parts();
        parts.extensions.remove::<UpstreamTrailers>();
        parts.headers.remove(GRPC_STATUS);
        parts.headers.remove(GRPC_MESSAGE);

        let value = match status {
            Some((code, message)) if code != 0 => {
                parts.status = grpc::http_status(code);
                json!({ "code": code, "message": message })
            }
            _ => {
                let frames = grpc::frames(&body)?;
                let Some(frame) = frames.iter().find(|f| !f.is_trailer()) else {
                    return Err(ProxyError::Grpc("reply carried no message".into()));
                };
                if frame.is_compressed() {
                    return Err(ProxyError::Grpc("compressed replies are not supported".into()));
                }
                self.decode_message(&method.output, frame.payload)?
            }
        };

        let body = Bytes::from(value.to_string());
        parts
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Ok(Response::from_parts(parts, body))
    }

    fn message(&self, type_name: &str) -> Result<&DescriptorProto> {
        self.messages
            .get(type_name)
            .ok_or_else(|| ProxyError::Grpc(format!("unknown message type {}", type_name)))
    }

    fn is_map(&self, field: &FieldDescriptorProto) -> bool {
        field.label() == Label::Repeated
            && field.r#type() == Type::Message
            && self
                .messages
                .get(field.type_name())
                .and_then(|m| m.options.as_ref())
                .is_some_and(|o| o.map_entry())
    }

    fn encode_message(&self, type_name: &str, value: &Value, buf: &mut Vec<u8>) -> Result<()> {
        let message = self.message(type_name)?;
        let Value::Object(fields) = value else {
            return Err(ProxyError::Grpc(format!("{} must be a JSON object", type_name)));
        };
        for (key, value) in fields {
            let field = message
                .field
                .iter()
                .find(|f| f.name() == key || json_name(f) == *key)
                .ok_or_else(|| ProxyError::Grpc(format!("unknown field {} in {}", key, type_name)))?;
            if value.is_null() {
                continue;
            }
            if self.is_map(field) {
                self.encode_map(field, value, buf)?;
            } else if field.label() == Label::Repeated {
                let Value::Array(items) = value else {
                    return Err(ProxyError::Grpc(format!("{} must be an array", key)));
                };
                for item in items {
                    self.encode_field(field, item, buf)?;
                }
            } else {
                self.encode_field(field, value, buf)?;
            }
        }
        Ok(())
    }

    fn encode_map(&self, field: &FieldDescriptorProto, value: &Value, buf: &mut Vec<u8>) -> Result<()> {
        let Value::Object(entries) = value else {
            return Err(ProxyError::Grpc(format!("{} must be an object", field.name())));
        };
        let entry = self.message(field.type_name())?;
        let (Some(key_field), Some(value_field)) = (
            entry.field.iter().find(|f| f.number() == 1),
            entry.field.iter().find(|f| f.number() == 2),
        ) else {
            return Err(ProxyError::Grpc(format!("malformed map entry {}", field.type_name())));
        };
        for (key, value) in entries {
            let key = match key_field.r#type() {
                Type::String => Value::String(key.clone()),
                Type::Bool => Value::Bool(key == "true"),
                _ => Value::String(key.clone()),
            };
            let mut encoded = Vec::new();
            self.encode_field(key_field, &key, &mut encoded)?;
            self.encode_field(value_field, value, &mut encoded)?;
            encode_key(field.number() as u32, WireType::LengthDelimited, buf);
            encode_varint(encoded.len() as u64, buf);
            buf.extend_from_slice(&encoded);
        }
        Ok(())
    }

    fn encode_field(&self, field: &FieldDescriptorProto, value: &Value, buf: &mut Vec<u8>) -> Result<()> {
        let tag = field.number() as u32;
        match field.r#type() {
            Type::Double => {
                encode_key(tag, WireType::SixtyFourBit, buf);
                buf.put_f64_le(float(field, value)?);
            }
            Type::Float => {
                encode_key(tag, WireType::ThirtyTwoBit, buf);
                buf.put_f32_le(float(field, value)? as f32);
            }
            Type::Int32 | Type::Int64 => {
                encode_key(tag, WireType::Varint, buf);
                encode_varint(integer(field, value)? as i64 as u64, buf);
            }
            Type::Uint32 | Type::Uint64 => {
                encode_key(tag, WireType::Varint, buf);
                encode_varint(integer(field, value)? as u64, buf);
            }
            Type::Sint32 => {
                let n = integer(field, value)? as i32;
                encode_key(tag, WireType::Varint, buf);
                encode_varint(((n << 1) ^ (n >> 31)) as u32 as u64, buf);
            }
            Type::Sint64 => {
                let n = integer(field, value)? as i64;
                encode_key(tag, WireType::Varint, buf);
                encode_varint(((n << 1) ^ (n >> 63)) as u64, buf);
            }
            Type::Fixed32 | Type::Sfixed32 => {
                encode_key(tag, WireType::ThirtyTwoBit, buf);
                buf.put_u32_le(integer(field, value)? as u32);
            }
            Type::Fixed64 | Type::Sfixed64 => {
                encode_key(tag, WireType::SixtyFourBit, buf);
                buf.put_u64_le(integer(field, value)? as u64);
            }
            Type::Bool => {
                let Value::Bool(b) = value else {
                    return Err(mismatch(field, "a boolean"));
                };
                encode_key(tag, WireType::Varint, buf);
                encode_varint(u64::from(*b), buf);
            }
            Type::Enum => {
                let number = match value {
                    Value::String(name) => self
                        .enums
                        .get(field.type_name())
                        .and_then(|e| e.value.iter().find(|v| v.name() == name))
                        .map(|v| v.number())
                        .ok_or_else(|| mismatch(field, "a known enum value"))?,
                    _ => integer(field, value)? as i32,
                };
                encode_key(tag, WireType::Varint, buf);
                encode_varint(number as i64 as u64, buf);
            }
            Type::String => {
                let Value::String(s) = value else {
                    return Err(mismatch(field, "a string"));
                };
                encode_bytes(tag, s.as_bytes(), buf);
            }
            Type::Bytes => {
                let Value::String(s) = value else {
                    return Err(mismatch(field, "a base64 string"));
                };
                let raw = STANDARD.decode(s).map_err(|_| mismatch(field, "a base64 string"))?;
                encode_bytes(tag, &raw, buf);
            }
            Type::Message => {
                let mut nested = Vec::new();
                self.encode_message(field.type_name(), value, &mut nested)?;
                encode_bytes(tag, &nested, buf);
            }
            Type::Group => return Err(ProxyError::Grpc("groups are not supported".into())),
        }
        Ok(())
    }

    fn decode_message(&self, type_name: &str, mut buf: &[u8]) -> Result<Value> {
        let message = self.message(type_name)?;
        let mut out = Map::new();
        while buf.has_remaining() {
            let (tag, wire_type) = decode_key(&mut buf).map_err(decode_error)?;
            let Some(field) = message.field.iter().find(|f| f.number() as u32 == tag) else {
                skip_field(wire_type, &mut buf)?;
                continue;
            };
            let name = json_name(field);
            if self.is_map(field) {
                let payload = length_delimited(&mut buf)?;
                let entry = self.decode_message(field.type_name(), payload)?;
                let key = match entry.get("key") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                let value = entry.get("value").cloned().unwrap_or(Value::Null);
                if let Value::Object(map) = out.entry(name).or_insert_with(|| Value::Object(Map::new())) {
                    map.insert(key, value);
                }
            } else if field.label() == Label::Repeated {
                let items = out.entry(name).or_insert_with(|| Value::Array(Vec::new()));
                let mut decoded = Vec::new();
                if wire_type == WireType::LengthDelimited && is_packable(field.r#type()) {
                    let mut packed = length_delimited(&mut buf)?;
                    while packed.has_remaining() {
                        decoded.push(self.decode_value(field, packed_wire_type(field.r#type()), &mut packed)?);
                    }
                } else {
                    decoded.push(self.decode_value(field, wire_type, &mut buf)?);
                }
                if let Value::Array(items) = items {
                    items.extend(decoded);
                }
            } else {
                let value = self.decode_value(field, wire_type, &mut buf)?;
                out.insert(name, value);
            }
        }
        Ok(Value::Object(out))
    }

    fn decode_value(&self, field: &FieldDescriptorProto, wire_type: WireType, buf: &mut &[u8]) -> Result<Value> {
        let ty = field.r#type();
        if wire_type != packed_wire_type(ty) {
            return Err(ProxyError::Grpc(format!("wire type mismatch for {}", field.name())));
        }
        let value = match ty {
            Type::Double => number_or_string(f64::from_le_bytes(fixed(buf)?)),
            Type::Float => number_or_string(f64::from(f32::from_le_bytes(fixed(buf)?))),
            Type::Int64 => Value::String((varint(buf)? as i64).to_string()),
            Type::Uint64 => Value::String(varint(buf)?.to_string()),
            Type::Sint64 => {
                let n = varint(buf)?;
                Value::String((((n >> 1) as i64) ^ -((n & 1) as i64)).to_string())
            }
            Type::Fixed64 => Value::String(u64::from_le_bytes(fixed(buf)?).to_string()),
            Type::Sfixed64 => Value::String(i64::from_le_bytes(fixed(buf)?).to_string()),
            Type::Int32 => json!(varint(buf)? as i32),
            Type::Uint32 => json!(varint(buf)? as u32),
            Type::Sint32 => {
                let n = varint(buf)? as u32;
                json!(((n >> 1) as i32) ^ -((n & 1) as i32))
            }
            Type::Fixed32 => json!(u32::from_le_bytes(fixed(buf)?)),
            Type::Sfixed32 => json!(i32::from_le_bytes(fixed(buf)?)),
            Type::Bool => Value::Bool(varint(buf)? != 0),
            Type::Enum => {
                let number = varint(buf)? as i32;
                self.enums
                    .get(field.type_name())
                    .and_then(|e| e.value.iter().find(|v| v.number() == number))
                    .map(|v| Value::String(v.name().to_string()))
                    .unwrap_or_else(|| json!(number))
            }
            Type::String => {
                let raw = length_delimited(buf)?;
                Value::String(
                    String::from_utf8(raw.to_vec())
                        .map_err(|_| ProxyError::Grpc(format!("{} is not UTF-8", field.name())))?,
                )
            }
            Type::Bytes => Value::String(STANDARD.encode(length_delimited(buf)?)),
            Type::Message => {
                let payload = length_delimited(buf)?;
                self.decode_message(field.type_name(), payload)?
            }
            Type::Group => return Err(ProxyError::Grpc("groups are not supported".into())),
        };
        Ok(value)
    }
}

/// `json_name` from the descriptor, else the lowerCamelCase field name
fn json_name(field: &FieldDescriptorProto) -> String {
    if field.json_name.is_some() {
        return field.json_name().to_string();
    }
    let mut out = String::new();
    let mut upper = false;
    for c in field.name().chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn mismatch(field: &FieldDescriptorProto, expected: &str) -> ProxyError {
    ProxyError::Grpc(format!("{} must be {}", field.name(), expected))
}

fn integer(field: &FieldDescriptorProto, value: &Value) -> Result<i128> {
    let parsed = match value {
        Value::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i128)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| mismatch(field, "an integer"))
}

fn float(field: &FieldDescriptorProto, value: &Value) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| mismatch(field, "a number"))
}

fn number_or_string(f: f64) -> Value {
    Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(f.to_string()))
}

fn encode_bytes(tag: u32, bytes: &[u8], buf: &mut Vec<u8>) {
    encode_key(tag, WireType::LengthDelimited, buf);
    encode_varint(bytes.len() as u64, buf);
    buf.extend_from_slice(bytes);
}

fn is_packable(ty: Type) -> bool {
    !matches!(ty, Type::String | Type::Bytes | Type::Message | Type::Group)
}

fn packed_wire_type(ty: Type) -> WireType {
    match ty {
        Type::Double | Type::Fixed64 | Type::Sfixed64 => WireType::SixtyFourBit,
        Type::Float | Type::Fixed32 | Type::Sfixed32 => WireType::ThirtyTwoBit,
        Type::String | Type::Bytes | Type::Message => WireType::LengthDelimited,
        Type::Group => WireType::StartGroup,
        _ => WireType::Varint,
    }
}

fn decode_error(e: prost::DecodeError) -> ProxyError {
    ProxyError::Grpc(format!("invalid protobuf reply: {}", e))
}

fn varint(buf: &mut &[u8]) -> Result<u64> {
    decode_varint(buf).map_err(decode_error)
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if buf.len() < len {
        return Err(ProxyError::Grpc("truncated protobuf reply".into()));
    }
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Ok(head)
}

fn fixed<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(buf, N)?);
    Ok(out)
}

fn length_delimited<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = varint(buf)? as usize;
    take(buf, len)
}

fn skip_field(wire_type: WireType, buf: &mut &[u8]) -> Result<()> {
    match wire_type {
        WireType::Varint => {
            varint(buf)?;
        }
        WireType::SixtyFourBit => {
            take(buf, 8)?;
        }
        WireType::ThirtyTwoBit => {
            take(buf, 4)?;
        }
        WireType::LengthDelimited => {
            length_delimited(buf)?;
        }
        WireType::StartGroup | WireType::EndGroup => {
            return Err(ProxyError::Grpc("groups are not supported".into()))
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use prost_types::{
        EnumValueDescriptorProto, FileDescriptorProto, MessageOptions, MethodDescriptorProto,
        ServiceDescriptorProto,
    };

    fn field(name: &str, number: i32, ty: Type, label: Label, type_name: Option<&str>) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.into()),
            number: Some(number),
            r#type: Some(ty as i32),
            label: Some(label as i32),
            type_name: type_name.map(str::to_string),
            ..Default::default()
        }
    }

    /// `bookstore.Bookstore` with `GetShelf(GetShelfRequest) returns (Shelf)`
    pub(crate) fn bookstore() -> FileDescriptorSet {
        let shelf = DescriptorProto {
            name: Some("Shelf".into()),
            field: vec![
                field("id", 1, Type::Int64, Label::Optional, None),
                field("theme", 2, Type::String, Label::Optional, None),
                field("genre", 3, Type::Enum, Label::Optional, Some(".bookstore.Genre")),
                field("book_ids", 4, Type::Int32, Label::Repeated, None),
                field("labels", 5, Type::Message, Label::Repeated, Some(".bookstore.Shelf.LabelsEntry")),
                field("owner", 6, Type::Message, Label::Optional, Some(".bookstore.Owner")),
                field("cover", 7, Type::Bytes, Label::Optional, None),
            ],
            nested_type: vec![DescriptorProto {
                name: Some("LabelsEntry".into()),
                field: vec![
                    field("key", 1, Type::String, Label::Optional, None),
                    field("value", 2, Type::String, Label::Optional, None),
                ],
                options: Some(MessageOptions {
                    map_entry: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let owner = DescriptorProto {
            name: Some("Owner".into()),
            field: vec![
                field("display_name", 1, Type::String, Label::Optional, None),
                field("balance", 2, Type::Sint32, Label::Optional, None),
            ],
            ..Default::default()
        };
        let request = DescriptorProto {
            name: Some("GetShelfRequest".into()),
            field: vec![field("shelf", 1, Type::Int64, Label::Optional, None)],
            ..Default::default()
        };
        let genre = EnumDescriptorProto {
            name: Some("Genre".into()),
            value: vec![
                EnumValueDescriptorProto {
                    name: Some("UNKNOWN".into()),
                    number: Some(0),
                    ..Default::default()
                },
                EnumValueDescriptorProto {
                    name: Some("FICTION".into()),
                    number: Some(1),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let method = |name: &str, input: &str, output: &str, streaming: bool| MethodDescriptorProto {
            name: Some(name.into()),
            input_type: Some(input.into()),
            output_type: Some(output.into()),
            server_streaming: Some(streaming),
            ..Default::default()
        };
        FileDescriptorSet {
            file: vec![FileDescriptorProto {
                name: Some("bookstore.proto".into()),
                package: Some("bookstore".into()),
                message_type: vec![shelf, owner, request],
                enum_type: vec![genre],
                service: vec![ServiceDescriptorProto {
                    name: Some("Bookstore".into()),
                    method: vec![
                        method("GetShelf", ".bookstore.GetShelfRequest", ".bookstore.Shelf", false),
                        method("PutShelf", ".bookstore.Shelf", ".bookstore.Shelf", false),
                        method("WatchShelves", ".bookstore.GetShelfRequest", ".bookstore.Shelf", true),
                    ],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    pub(crate) fn bookstore_config() -> GrpcJsonTranscoder {
        GrpcJsonTranscoder {
            proto_descriptor_bin: Some(STANDARD.encode(bookstore().encode_to_vec())),
            services: vec!["bookstore.Bookstore".into()],
            ..Default::default()
        }
    }

    fn transcoder() -> Transcoder {
        Transcoder::new(&bookstore_config()).unwrap()
    }

    fn grpc_reply(body: Bytes, status: &str) -> Response<Bytes> {
        let mut response = Response::new(body);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
        let mut trailers = HeaderMap::new();
        trailers.insert(GRPC_STATUS, HeaderValue::from_str(status).unwrap());
        response.extensions_mut().insert(UpstreamTrailers(trailers));
        response
    }

    #[test]
    fn test_methods_from_descriptor() {
        let transcoder = transcoder();
        let get = transcoder.method(&Method::POST, "/bookstore.Bookstore/GetShelf?x=1").unwrap();
        assert_eq!(get.input, ".bookstore.GetShelfRequest");
        assert_eq!(get.output, ".bookstore.Shelf");
        assert!(transcoder.method(&Method::GET, "/bookstore.Bookstore/GetShelf").is_none());
        assert!(transcoder.method(&Method::POST, "/bookstore.Bookstore/WatchShelves").is_none());
        assert!(transcoder.method(&Method::POST, "/other.Svc/GetShelf").is_none());
    }

    #[test]
    fn test_unknown_service_rejected() {
        let err = Transcoder::from_descriptor_set(bookstore(), &["bookstore.Library".to_string()]).unwrap_err();
        assert!(err.to_string().contains("bookstore.Library"));

        let config = GrpcJsonTranscoder {
            proto_descriptor_bin: Some("not base64!".into()),
            services: vec!["bookstore.Bookstore".into()],
            ..Default::default()
        };
        assert!(Transcoder::new(&config).is_err());
        assert!(Transcoder::new(&GrpcJsonTranscoder::default()).is_err());
    }

    #[test]
    fn test_request_encoding() {
        let transcoder = transcoder();
        let get = transcoder.method(&Method::POST, "/bookstore.Bookstore/GetShelf").unwrap().clone();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(14));

        let body = transcoder
            .encode_request(&get, &mut headers, br#"{"shelf": "150"}"#)
            .unwrap();
        // field 1 varint 150
        assert_eq!(body.as_ref(), &[0, 0, 0, 0, 3, 0x08, 0x96, 0x01]);
        assert_eq!(headers[CONTENT_TYPE], GRPC_CONTENT_TYPE);
        assert!(!headers.contains_key(CONTENT_LENGTH));

        let empty = transcoder.encode_request(&get, &mut headers, b"").unwrap();
        assert_eq!(empty.as_ref(), &[0, 0, 0, 0, 0]);

        assert!(transcoder.encode_request(&get, &mut headers, br#"{"nope": 1}"#).is_err());
        assert!(transcoder.encode_request(&get, &mut headers, br#"{"shelf": true}"#).is_err());
        assert!(transcoder.encode_request(&get, &mut headers, b"{").is_err());
    }

    #[test]
    fn test_json_and_protobuf_agree() {
        let transcoder = transcoder();
        let put = transcoder.method(&Method::POST, "/bookstore.Bookstore/PutShelf").unwrap().clone();
        let shelf = json!({
            "id": "-7",
            "theme": "Travel",
            "genre": "FICTION",
            "bookIds": [1, 2, 300],
            "labels": {"floor": "2"},
            "owner": {"displayName": "Ada", "balance": -3},
            "cover": STANDARD.encode(b"png"),
        });

        let framed = transcoder
            .encode_request(&put, &mut HeaderMap::new(), shelf.to_string().as_bytes())
            .unwrap();
        let response = transcoder.decode_response(&put, grpc_reply(framed, "0")).unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], JSON_CONTENT_TYPE);
        assert!(response.extensions().get::<UpstreamTrailers>().is_none());

        let decoded: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(decoded, shelf);
    }

    #[test]
    fn test_packed_repeated_decoded() {
        let transcoder = transcoder();
        let get = transcoder.method(&Method::POST, "/bookstore.Bookstore/GetShelf").unwrap().clone();
        // field 4 packed: [1, 2], field 99 unknown varint
        let message = [0x22, 0x02, 0x01, 0x02, 0x98, 0x06, 0x05];
        let response = transcoder
            .decode_response(&get, grpc_reply(grpc::frame(&message), "0"))
            .unwrap();
        let decoded: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(decoded, json!({"bookIds": [1, 2]}));
    }

    #[test]
    fn test_error_status_becomes_json() {
        let transcoder = transcoder();
        let get = transcoder.method(&Method::POST, "/bookstore.Bookstore/GetShelf").unwrap().clone();
        let mut reply = grpc_reply(Bytes::new(), "5");
        if let Some(trailers) = reply.extensions_mut().get_mut::<UpstreamTrailers>() {
            trailers.0.insert(GRPC_MESSAGE, HeaderValue::from_static("shelf not found"));
        }
        let response = transcoder.decode_response(&get, reply).unwrap();
        assert_eq!(response.status(), 404);
        let decoded: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(decoded, json!({"code": 5, "message": "shelf not found"}));
    }

    #[test]
    fn test_non_grpc_reply_passes_through() {
        let transcoder = transcoder();
        let get = transcoder.method(&Method::POST, "/bookstore.Bookstore/GetShelf").unwrap().clone();
        let mut reply = Response::new(Bytes::from("upstream overloaded"));
        *reply.status_mut() = hyper::StatusCode::SERVICE_UNAVAILABLE;
        let response = transcoder.decode_response(&get, reply).unwrap();
        assert_eq!(response.status(), 503);
        assert_eq!(response.body().as_ref(), b"upstream overloaded");
    }
}
