//! Dynamic RPC invocation.
//!
//! Builds untyped messages from a method descriptor plus a JSON body and
//! drives the RPC in whichever of the four shapes the method declares.
//! Requests and responses use the canonical proto3 JSON mapping: enums by
//! name, default scalars omitted, `Timestamp`/`Duration` in their string
//! forms, `bytes` as base64, 64-bit integers as strings on output and
//! either form on input, and only the selected oneof arm present.

use std::collections::HashMap;

use http::uri::PathAndQuery;
use prost::Message;
use prost_reflect::{
    DeserializeOptions, DynamicMessage, MessageDescriptor, MethodDescriptor, SerializeOptions,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::client::Grpc;
use tonic::codec::{
    BufferSettings, Codec, CompressionEncoding, DecodeBuf, Decoder, EncodeBuf, Encoder,
};
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::transport::Channel;
use tonic::Status;

use crate::error::{Error, Result};
use crate::metadata;

/// Messages buffered per stream before a send awaits the consumer. Keeps a
/// fast server from overwhelming a slow consumer.
const STREAM_BUFFER: usize = 16;

/// A single response message plus the call's response headers, flattened
/// for the host.
#[derive(Debug)]
pub struct CallReply {
    pub body: String,
    pub headers: HashMap<String, Vec<String>>,
}

/// Invokes RPCs over one live transport.
#[derive(Clone)]
pub struct Invoker {
    channel: Channel,
}

impl Invoker {
    pub fn new(channel: Channel) -> Self {
        Invoker { channel }
    }

    fn grpc(&self) -> Grpc<Channel> {
        Grpc::new(self.channel.clone()).accept_compressed(CompressionEncoding::Gzip)
    }

    /// Single request, single response.
    pub async fn unary(
        &self,
        method: &MethodDescriptor,
        json: &str,
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<CallReply> {
        let request = parse_request(&method.input(), json)?;
        let md = metadata::from_pairs(headers)?;
        let mut grpc = self.grpc();
        ready(&mut grpc).await?;

        let call = grpc.unary(
            build_request(request, &md),
            method_path(method)?,
            DynamicCodec::for_method(method),
        );
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = call => result?,
        };

        reply_from_response(response)
    }

    /// Single request, stream of responses.
    ///
    /// A background task pumps the network stream into the returned
    /// channels: every message arrives JSON-encoded on `messages`, then
    /// exactly one value arrives on `errors` (the end-of-stream sentinel on
    /// normal completion) and both channels close.
    pub async fn server_stream(
        &self,
        method: &MethodDescriptor,
        json: &str,
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<ServerStreamCall> {
        let request = parse_request(&method.input(), json)?;
        let md = metadata::from_pairs(headers)?;
        let mut grpc = self.grpc();
        ready(&mut grpc).await?;

        let call = grpc.server_streaming(
            build_request(request, &md),
            method_path(method)?,
            DynamicCodec::for_method(method),
        );
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = call => result?,
        };

        let mut stream = response.into_inner();
        let (message_tx, messages) = mpsc::channel(STREAM_BUFFER);
        let (error_tx, errors) = mpsc::channel(1);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = error_tx.send(Error::Cancelled).await;
                        return;
                    }
                    next = stream.message() => next,
                };
                let body = match next {
                    Ok(Some(msg)) => match render_response(&msg) {
                        Ok(body) => body,
                        Err(e) => {
                            let _ = error_tx.send(e).await;
                            return;
                        }
                    },
                    Ok(None) => {
                        let _ = error_tx.send(Error::EndOfStream).await;
                        return;
                    }
                    Err(status) => {
                        let _ = error_tx.send(Error::Rpc(status)).await;
                        return;
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = error_tx.send(Error::Cancelled).await;
                        return;
                    }
                    sent = message_tx.send(body) => {
                        if sent.is_err() {
                            // Consumer dropped the messages channel.
                            let _ = error_tx.send(Error::Cancelled).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(ServerStreamCall { messages, errors })
    }

    /// Stream of requests, single response. Messages are fed through the
    /// returned handle; the response arrives on `close_and_receive`.
    pub async fn client_stream(
        &self,
        method: &MethodDescriptor,
        headers: &[(String, String)],
    ) -> Result<ClientStreamCall> {
        let md = metadata::from_pairs(headers)?;
        let mut grpc = self.grpc();
        ready(&mut grpc).await?;

        let (sender, rx) = mpsc::channel(STREAM_BUFFER);
        let request = build_request(ReceiverStream::new(rx), &md);
        let path = method_path(method)?;
        let codec = DynamicCodec::for_method(method);
        let reply = tokio::spawn(async move { grpc.client_streaming(request, path, codec).await });

        Ok(ClientStreamCall {
            sender,
            input: method.input(),
            reply,
        })
    }

    /// Stream of requests, stream of responses. Send and receive are
    /// independent; send-ordering is the caller's responsibility.
    pub async fn bidi_stream(
        &self,
        method: &MethodDescriptor,
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<BidiStreamCall> {
        let md = metadata::from_pairs(headers)?;
        let mut grpc = self.grpc();
        ready(&mut grpc).await?;

        let (sender, rx) = mpsc::channel(STREAM_BUFFER);
        let call = grpc.streaming(
            build_request(ReceiverStream::new(rx), &md),
            method_path(method)?,
            DynamicCodec::for_method(method),
        );
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = call => result?,
        };

        Ok(BidiStreamCall {
            sender: Some(sender),
            responses: response.into_inner(),
            input: method.input(),
            cancel: cancel.clone(),
        })
    }
}

/// Live server-streaming call. The channels are the only synchronization
/// surface with the background pump; dropping them terminates it.
pub struct ServerStreamCall {
    pub messages: mpsc::Receiver<String>,
    pub errors: mpsc::Receiver<Error>,
}

/// Live client-streaming call.
pub struct ClientStreamCall {
    sender: mpsc::Sender<DynamicMessage>,
    input: MessageDescriptor,
    reply: JoinHandle<std::result::Result<tonic::Response<DynamicMessage>, Status>>,
}

impl ClientStreamCall {
    /// Parse `json` into a new input message and send it on the stream.
    pub async fn send(&self, json: &str) -> Result<()> {
        let msg = parse_request(&self.input, json)?;
        self.sender
            .send(msg)
            .await
            .map_err(|_| Error::TransportUnavailable("request stream closed by the server".into()))
    }

    /// Close the send side and await the single response.
    pub async fn close_and_receive(self) -> Result<CallReply> {
        let ClientStreamCall { sender, reply, .. } = self;
        drop(sender);
        let response = reply
            .await
            .map_err(|e| Error::TransportUnavailable(format!("call task failed: {e}")))??;
        reply_from_response(response)
    }
}

/// Live bidirectional-streaming call.
pub struct BidiStreamCall {
    sender: Option<mpsc::Sender<DynamicMessage>>,
    responses: tonic::Streaming<DynamicMessage>,
    input: MessageDescriptor,
    cancel: CancellationToken,
}

impl BidiStreamCall {
    /// Parse `json` into a new input message and send it on the stream.
    pub async fn send(&self, json: &str) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::TransportUnavailable("send side already closed".into()))?;
        let msg = parse_request(&self.input, json)?;
        sender
            .send(msg)
            .await
            .map_err(|_| Error::TransportUnavailable("request stream closed by the server".into()))
    }

    /// Await the next server message. Returns the end-of-stream sentinel
    /// when the server closes its side.
    pub async fn recv(&mut self) -> Result<String> {
        let next = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            next = self.responses.message() => next,
        };
        match next {
            Ok(Some(msg)) => render_response(&msg),
            Ok(None) => Err(Error::EndOfStream),
            Err(status) => Err(Error::Rpc(status)),
        }
    }

    /// Close the send side. `recv` stays valid until the server closes its
    /// side.
    pub fn close_send(&mut self) {
        self.sender = None;
    }
}

fn parse_request(input: &MessageDescriptor, json: &str) -> Result<DynamicMessage> {
    let mut de = serde_json::Deserializer::from_str(json);
    let msg =
        DynamicMessage::deserialize_with_options(input.clone(), &mut de, &DeserializeOptions::new())
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    de.end().map_err(|e| Error::InvalidRequest(e.to_string()))?;
    Ok(msg)
}

fn render_response(msg: &DynamicMessage) -> Result<String> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::new(&mut buf);
    msg.serialize_with_options(&mut ser, &SerializeOptions::new())
        .map_err(|e| Error::InvalidDescriptor(format!("failed to render response JSON: {e}")))?;
    String::from_utf8(buf)
        .map_err(|e| Error::InvalidDescriptor(format!("response JSON is not UTF-8: {e}")))
}

fn method_path(method: &MethodDescriptor) -> Result<PathAndQuery> {
    let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
    path.parse()
        .map_err(|e| Error::InvalidDescriptor(format!("invalid method path '{path}': {e}")))
}

fn build_request<T>(message: T, md: &MetadataMap) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    *request.metadata_mut() = md.clone();
    request
}

async fn ready(grpc: &mut Grpc<Channel>) -> Result<()> {
    grpc.ready()
        .await
        .map_err(|e| Error::TransportUnavailable(format!("transport not ready: {e}")))
}

fn reply_from_response(response: tonic::Response<DynamicMessage>) -> Result<CallReply> {
    let headers = metadata::to_multimap(&strip_pseudo_headers(response.metadata()));
    let body = render_response(response.get_ref())?;
    Ok(CallReply { body, headers })
}

/// Remove gRPC's own status headers before handing metadata to the host;
/// they are transport bookkeeping, not response headers.
fn strip_pseudo_headers(md: &MetadataMap) -> MetadataMap {
    let mut filtered = MetadataMap::new();
    for entry in md.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                let name = key.as_str();
                if name == "grpc-status" || name == "grpc-message" || name == "grpc-encoding" {
                    continue;
                }
                filtered.append(key.clone(), value.clone());
            }
            KeyAndValueRef::Binary(key, value) => {
                filtered.append_bin(key.clone(), value.clone());
            }
        }
    }
    filtered
}

/// tonic codec pinned to one method's response type.
///
/// Only decoding needs descriptor state: the raw response bytes have no
/// shape until the method's output descriptor gives them one. Outbound
/// messages are [`DynamicMessage`]s that carry their own descriptor and
/// write themselves to the wire, so the encoder is stateless.
struct DynamicCodec {
    response: MessageDescriptor,
}

impl DynamicCodec {
    fn for_method(method: &MethodDescriptor) -> Self {
        DynamicCodec {
            response: method.output(),
        }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            response: self.response.clone(),
        }
    }
}

struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Status> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("failed to encode request: {e}")))
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

struct DynamicDecoder {
    response: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<DynamicMessage>, Status> {
        let msg = DynamicMessage::decode(self.response.clone(), src)
            .map_err(|e| Status::internal(format!("failed to decode response: {e}")))?;
        Ok(Some(msg))
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::DescriptorPool;
    use prost_reflect::Value;
    use prost_types::{
        field_descriptor_proto, DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto,
        FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet, MessageOptions,
        MethodDescriptorProto, OneofDescriptorProto, ServiceDescriptorProto,
    };

    fn field(
        name: &str,
        number: i32,
        kind: field_descriptor_proto::Type,
    ) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.into()),
            number: Some(number),
            r#type: Some(kind as i32),
            label: Some(1),
            ..Default::default()
        }
    }

    fn fixture_pool() -> DescriptorPool {
        use field_descriptor_proto::Type;

        let mut metadata_field = field("metadata", 6, Type::Message);
        metadata_field.label = Some(3);
        metadata_field.type_name = Some(".fixture.Sample.MetadataEntry".into());

        let mut tags_field = field("tags", 7, Type::String);
        tags_field.label = Some(3);

        let mut color_field = field("color", 5, Type::Enum);
        color_field.type_name = Some(".fixture.Color".into());

        let mut note_field = field("note", 8, Type::String);
        note_field.oneof_index = Some(0);
        let mut code_field = field("code", 9, Type::Int32);
        code_field.oneof_index = Some(0);

        let file = FileDescriptorProto {
            name: Some("fixture.proto".into()),
            package: Some("fixture".into()),
            syntax: Some("proto3".into()),
            enum_type: vec![EnumDescriptorProto {
                name: Some("Color".into()),
                value: vec![
                    EnumValueDescriptorProto {
                        name: Some("COLOR_UNSPECIFIED".into()),
                        number: Some(0),
                        ..Default::default()
                    },
                    EnumValueDescriptorProto {
                        name: Some("RED".into()),
                        number: Some(1),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            message_type: vec![DescriptorProto {
                name: Some("Sample".into()),
                field: vec![
                    field("text", 1, Type::String),
                    field("flag", 2, Type::Bool),
                    field("small", 3, Type::Int32),
                    field("big", 4, Type::Int64),
                    color_field,
                    metadata_field,
                    tags_field,
                    note_field,
                    code_field,
                ],
                nested_type: vec![DescriptorProto {
                    name: Some("MetadataEntry".into()),
                    field: vec![
                        field("key", 1, Type::String),
                        field("value", 2, Type::String),
                    ],
                    options: Some(MessageOptions {
                        map_entry: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                oneof_decl: vec![OneofDescriptorProto {
                    name: Some("payload".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            service: vec![ServiceDescriptorProto {
                name: Some("Fixture".into()),
                method: vec![MethodDescriptorProto {
                    name: Some("Echo".into()),
                    input_type: Some(".fixture.Sample".into()),
                    output_type: Some(".fixture.Sample".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        DescriptorPool::from_file_descriptor_set(FileDescriptorSet { file: vec![file] }).unwrap()
    }

    fn sample_desc() -> MessageDescriptor {
        fixture_pool().get_message_by_name("fixture.Sample").unwrap()
    }

    #[test]
    fn empty_object_is_a_valid_request() {
        let msg = parse_request(&sample_desc(), "{}").unwrap();
        assert_eq!(render_response(&msg).unwrap(), "{}");
    }

    #[test]
    fn malformed_json_reports_invalid_request() {
        let err = parse_request(&sample_desc(), "{\"text\": ").unwrap_err();
        assert!(err.to_string().contains("invalid request JSON"));

        // Trailing garbage after a valid value is rejected too.
        let err = parse_request(&sample_desc(), "{} trailing").unwrap_err();
        assert!(err.to_string().contains("invalid request JSON"));
    }

    #[test]
    fn unknown_field_reports_invalid_request() {
        let err = parse_request(&sample_desc(), "{\"no_such_field\": 1}").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn default_scalars_are_omitted_from_output() {
        let desc = sample_desc();
        let msg = parse_request(
            &desc,
            r#"{"text":"", "flag":false, "small":0, "big":"0"}"#,
        )
        .unwrap();
        assert_eq!(render_response(&msg).unwrap(), "{}");
    }

    #[test]
    fn int64_accepted_as_number_or_string_and_emitted_as_string() {
        let desc = sample_desc();
        let from_number = parse_request(&desc, r#"{"big": 9007199254740993}"#).unwrap();
        let from_string = parse_request(&desc, r#"{"big": "9007199254740993"}"#).unwrap();
        assert_eq!(
            from_number.get_field_by_name("big").as_deref(),
            Some(&Value::I64(9007199254740993))
        );
        assert_eq!(from_number, from_string);
        assert_eq!(
            render_response(&from_number).unwrap(),
            r#"{"big":"9007199254740993"}"#
        );
    }

    #[test]
    fn enums_accepted_by_name_or_number_and_emitted_by_name() {
        let desc = sample_desc();
        let by_name = parse_request(&desc, r#"{"color": "RED"}"#).unwrap();
        let by_number = parse_request(&desc, r#"{"color": 1}"#).unwrap();
        assert_eq!(by_name, by_number);
        assert_eq!(render_response(&by_name).unwrap(), r#"{"color":"RED"}"#);
    }

    #[test]
    fn oneof_emits_only_the_selected_arm() {
        let desc = sample_desc();
        let msg = parse_request(&desc, r#"{"code": 7}"#).unwrap();
        let rendered = render_response(&msg).unwrap();
        assert_eq!(rendered, r#"{"code":7}"#);

        // Selecting the other arm replaces, not accumulates.
        let msg = parse_request(&desc, r#"{"note": "hi"}"#).unwrap();
        assert_eq!(render_response(&msg).unwrap(), r#"{"note":"hi"}"#);
    }

    #[test]
    fn repeated_field_preserves_order_and_count() {
        let desc = sample_desc();
        let values: Vec<String> = (0..500).map(|i| format!("\"t{i}\"")).collect();
        let json = format!("{{\"tags\":[{}]}}", values.join(","));
        let msg = parse_request(&desc, &json).unwrap();
        let rendered = render_response(&msg).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        let tags = parsed["tags"].as_array().unwrap();
        assert_eq!(tags.len(), 500);
        assert_eq!(tags[0], "t0");
        assert_eq!(tags[499], "t499");
    }

    #[test]
    fn map_fields_round_trip() {
        let desc = sample_desc();
        let msg = parse_request(&desc, r#"{"metadata":{"a":"1","b":"2"}}"#).unwrap();
        let rendered = render_response(&msg).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["metadata"]["a"], "1");
        assert_eq!(parsed["metadata"]["b"], "2");
    }

    #[test]
    fn method_path_uses_service_slash_method() {
        let pool = fixture_pool();
        let method = pool
            .get_service_by_name("fixture.Fixture")
            .unwrap()
            .methods()
            .next()
            .unwrap();
        let path = method_path(&method).unwrap();
        assert_eq!(path.path(), "/fixture.Fixture/Echo");
    }

    #[test]
    fn pseudo_headers_are_stripped() {
        let mut md = MetadataMap::new();
        md.insert("grpc-status", "0".parse().unwrap());
        md.insert("grpc-message", "ok".parse().unwrap());
        md.insert("x-request-id", "abc".parse().unwrap());
        let filtered = strip_pseudo_headers(&md);
        assert!(filtered.get("grpc-status").is_none());
        assert!(filtered.get("grpc-message").is_none());
        assert_eq!(filtered.get("x-request-id").unwrap(), "abc");
    }
}
