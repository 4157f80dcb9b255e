//! The message envelope: header, payload mapping and metadata.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The envelope could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    /// The received frame is not a valid envelope.
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
    /// A frame exceeded the configured length cap.
    #[error("frame of {0} bytes exceeds the maximum length")]
    FrameTooLong(usize),
    /// The payload did not have the shape the handler expected.
    #[error("malformed {0} payload: {1}")]
    Payload(MessageType, #[source] serde_json::Error),
    /// Underlying socket failure.
    #[error("transport i/o error")]
    Io(#[from] std::io::Error),
}

/// Every message type on the wire. Request types come with a matching ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum MessageType {
    #[display("DISCOVERY_HEARTBEAT")]
    DiscoveryHeartbeat,
    #[display("DISCOVERY_HEARTBEAT_ACK")]
    DiscoveryHeartbeatAck,
    #[display("DISCOVERY_QUERY_BY_NAME")]
    DiscoveryQueryByName,
    #[display("DISCOVERY_QUERY_BY_NAME_ACK")]
    DiscoveryQueryByNameAck,
    #[display("DISCOVERY_QUERY_BY_ROLE")]
    DiscoveryQueryByRole,
    #[display("DISCOVERY_QUERY_BY_ROLE_ACK")]
    DiscoveryQueryByRoleAck,
    #[display("DISCOVERY_QUERY_ALL")]
    DiscoveryQueryAll,
    #[display("DISCOVERY_QUERY_ALL_ACK")]
    DiscoveryQueryAllAck,

    #[display("PROCESS_FTP_COMMAND")]
    ProcessFtpCommand,
    #[display("PROCESS_FTP_COMMAND_ACK")]
    ProcessFtpCommandAck,

    #[display("AUTH_VALIDATE_USER")]
    AuthValidateUser,
    #[display("AUTH_VALIDATE_USER_ACK")]
    AuthValidateUserAck,
    #[display("AUTH_VALIDATE_PASSWORD")]
    AuthValidatePassword,
    #[display("AUTH_VALIDATE_PASSWORD_ACK")]
    AuthValidatePasswordAck,

    #[display("DATA_LIST")]
    DataList,
    #[display("DATA_LIST_ACK")]
    DataListAck,
    #[display("DATA_STAT")]
    DataStat,
    #[display("DATA_STAT_ACK")]
    DataStatAck,
    #[display("DATA_MKD")]
    DataMkd,
    #[display("DATA_MKD_ACK")]
    DataMkdAck,
    #[display("DATA_REMOVE")]
    DataRemove,
    #[display("DATA_REMOVE_ACK")]
    DataRemoveAck,
    #[display("DATA_RENAME")]
    DataRename,
    #[display("DATA_RENAME_ACK")]
    DataRenameAck,
    #[display("DATA_CWD")]
    DataCwd,
    #[display("DATA_CWD_ACK")]
    DataCwdAck,
    #[display("DATA_OPEN_PASV")]
    DataOpenPasv,
    #[display("DATA_OPEN_PASV_ACK")]
    DataOpenPasvAck,
    #[display("DATA_RETR_FILE")]
    DataRetrFile,
    #[display("DATA_RETR_FILE_ACK")]
    DataRetrFileAck,
    #[display("DATA_STORE_FILE")]
    DataStoreFile,
    #[display("DATA_STORE_FILE_ACK")]
    DataStoreFileAck,
    #[display("DATA_READY")]
    DataReady,
    #[display("DATA_READY_ACK")]
    DataReadyAck,
    #[display("DATA_META_REQUEST")]
    DataMetaRequest,
    #[display("DATA_META_REQUEST_ACK")]
    DataMetaRequestAck,
    #[display("DATA_REPLICATE_FILE")]
    DataReplicateFile,
    #[display("DATA_REPLICATE_FILE_ACK")]
    DataReplicateFileAck,
    #[display("DATA_REPLICATE_READY")]
    DataReplicateReady,
    #[display("DATA_REPLICATE_READY_ACK")]
    DataReplicateReadyAck,
    #[display("DATA_SYNC_FILE_REQUEST")]
    DataSyncFileRequest,
    #[display("DATA_SYNC_FILE_REQUEST_ACK")]
    DataSyncFileRequestAck,
    #[display("DATA_SYNC_FILE_READY")]
    DataSyncFileReady,
    #[display("DATA_SYNC_FILE_READY_ACK")]
    DataSyncFileReadyAck,

    #[display("GOSSIP_UPDATE")]
    GossipUpdate,
    #[display("GOSSIP_UPDATE_ACK")]
    GossipUpdateAck,
    #[display("MERGE_STATE")]
    MergeState,
    #[display("MERGE_STATE_ACK")]
    MergeStateAck,
    #[display("SEND_STATE")]
    SendState,
    #[display("SEND_STATE_ACK")]
    SendStateAck,
}

impl MessageType {
    /// The ack type paired with this request type. Acks map to themselves.
    pub fn ack(self) -> MessageType {
        use MessageType::*;
        match self {
            DiscoveryHeartbeat => DiscoveryHeartbeatAck,
            DiscoveryQueryByName => DiscoveryQueryByNameAck,
            DiscoveryQueryByRole => DiscoveryQueryByRoleAck,
            DiscoveryQueryAll => DiscoveryQueryAllAck,
            ProcessFtpCommand => ProcessFtpCommandAck,
            AuthValidateUser => AuthValidateUserAck,
            AuthValidatePassword => AuthValidatePasswordAck,
            DataList => DataListAck,
            DataStat => DataStatAck,
            DataMkd => DataMkdAck,
            DataRemove => DataRemoveAck,
            DataRename => DataRenameAck,
            DataCwd => DataCwdAck,
            DataOpenPasv => DataOpenPasvAck,
            DataRetrFile => DataRetrFileAck,
            DataStoreFile => DataStoreFileAck,
            DataReady => DataReadyAck,
            DataMetaRequest => DataMetaRequestAck,
            DataReplicateFile => DataReplicateFileAck,
            DataReplicateReady => DataReplicateReadyAck,
            DataSyncFileRequest => DataSyncFileRequestAck,
            DataSyncFileReady => DataSyncFileReadyAck,
            GossipUpdate => GossipUpdateAck,
            MergeState => MergeStateAck,
            SendState => SendStateAck,
            other => other,
        }
    }
}

/// Delivery status carried in the envelope metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Status {
    /// The request was carried out completely.
    #[default]
    #[serde(rename = "OK")]
    Ok,
    /// The request failed; `metadata.message` explains why.
    #[serde(rename = "error")]
    Error,
    /// The request succeeded locally but replication fell short of quorum.
    #[serde(rename = "partial")]
    Partial,
}

/// Routing information for one envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    /// The message type; selects the handler on the receiving node.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Address of the sending node.
    pub src: String,
    /// Address of the destination node.
    pub dst: String,
}

/// Control metadata attached to every envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Freshly minted id for tracing a message across nodes.
    pub msg_id: Uuid,
    /// Creation time, seconds since the epoch.
    pub timestamp: i64,
    /// Outcome of the request this envelope answers.
    #[serde(default)]
    pub status: Status,
    /// Human-readable failure note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Metadata {
    fn new() -> Self {
        Metadata {
            msg_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now().timestamp(),
            status: Status::Ok,
            message: None,
        }
    }
}

/// One message on the inter-node wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Type and endpoints.
    pub header: Header,
    /// Type-specific data; an empty mapping when a message carries none.
    #[serde(default)]
    pub payload: Value,
    /// Id, timestamp and delivery status.
    pub metadata: Metadata,
}

impl Message {
    /// Builds a request-shaped message.
    pub fn new(msg_type: MessageType, src: IpAddr, dst: IpAddr, payload: Value) -> Self {
        Message {
            header: Header {
                msg_type,
                src: src.to_string(),
                dst: dst.to_string(),
            },
            payload,
            metadata: Metadata::new(),
        }
    }

    /// Builds the successful ack for `request`, addressed back to its sender.
    pub fn ack_to(request: &Message, src: IpAddr, payload: Value) -> Self {
        Message {
            header: Header {
                msg_type: request.header.msg_type.ack(),
                src: src.to_string(),
                dst: request.header.src.clone(),
            },
            payload,
            metadata: Metadata::new(),
        }
    }

    /// Builds a failure ack for `request` carrying a diagnostic note.
    pub fn error_to(request: &Message, src: IpAddr, note: impl Into<String>) -> Self {
        let mut msg = Message::ack_to(request, src, Value::Object(Default::default()));
        msg.metadata.status = Status::Error;
        msg.metadata.message = Some(note.into());
        msg
    }

    /// Replaces the delivery status.
    pub fn with_status(mut self, status: Status) -> Self {
        self.metadata.status = status;
        self
    }

    /// True when the metadata reports full success.
    pub fn is_ok(&self) -> bool {
        self.metadata.status == Status::Ok
    }

    /// The failure note, or a generic fallback.
    pub fn note(&self) -> &str {
        self.metadata.message.as_deref().unwrap_or("unspecified error")
    }

    /// The sender address, when it parses as an IP.
    pub fn src_ip(&self) -> Option<IpAddr> {
        self.header.src.parse().ok()
    }

    /// Deserializes the payload into the handler's expected shape.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtoError::Payload(self.header.msg_type, e))
    }
}
