use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Bus request to {subject} timed out")]
    BusTimeout { subject: String },

    #[error("KV error: {0}")]
    Kv(String),

    #[error("QMP error ({class}): {desc}")]
    Qmp { class: String, desc: String },

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Instance already exists: {0}")]
    InstanceAlreadyExists(String),

    #[error("Invalid state transition for {id}: {from} -> {to}")]
    InvalidTransition {
        from: String,
        to: String,
        id: String,
    },

    #[error("Insufficient capacity for instance type {0}")]
    InsufficientCapacity(String),

    #[error("Unknown instance type: {0}")]
    UnknownInstanceType(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    #[error("Volume {0} is in use")]
    VolumeInUse(String),

    #[error("No hot-plug device slots left")]
    NoDeviceSlots,

    #[error("Operation not permitted: {0}")]
    NotPermitted(String),

    #[error("QEMU execution failed: {0}")]
    QemuFailed(String),

    #[error("Block storage error: {0}")]
    BlockStorage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Service error: {0}")]
    Service(String),
}

pub type Result<T> = std::result::Result<T, HiveError>;

/// AWS-shaped error code surfaced to bus clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    InvalidInstanceIdNotFound,
    InvalidInstanceIdMalformed,
    IncorrectInstanceState,
    InsufficientInstanceCapacity,
    InvalidInstanceType,
    InvalidInstanceAttributeValue,
    InvalidAmiIdNotFound,
    InvalidKeyPairNotFound,
    InvalidVolumeNotFound,
    VolumeInUse,
    InvalidParameterValue,
    MissingParameter,
    AttachmentLimitExceeded,
    OperationNotPermitted,
    ServerInternal,
}

impl ApiErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorCode::InvalidInstanceIdNotFound => "InvalidInstanceID.NotFound",
            ApiErrorCode::InvalidInstanceIdMalformed => "InvalidInstanceID.Malformed",
            ApiErrorCode::IncorrectInstanceState => "IncorrectInstanceState",
            ApiErrorCode::InsufficientInstanceCapacity => "InsufficientInstanceCapacity",
            ApiErrorCode::InvalidInstanceType => "InvalidInstanceType",
            ApiErrorCode::InvalidInstanceAttributeValue => "InvalidInstanceAttributeValue",
            ApiErrorCode::InvalidAmiIdNotFound => "InvalidAMIID.NotFound",
            ApiErrorCode::InvalidKeyPairNotFound => "InvalidKeyPair.NotFound",
            ApiErrorCode::InvalidVolumeNotFound => "InvalidVolume.NotFound",
            ApiErrorCode::VolumeInUse => "VolumeInUse",
            ApiErrorCode::InvalidParameterValue => "InvalidParameterValue",
            ApiErrorCode::MissingParameter => "MissingParameter",
            ApiErrorCode::AttachmentLimitExceeded => "AttachmentLimitExceeded",
            ApiErrorCode::OperationNotPermitted => "OperationNotPermitted",
            ApiErrorCode::ServerInternal => "ServerInternal",
        }
    }
}

/// Wire form of an error reply: `{"Code": "...", "Message": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
        }
    }

    pub fn server_internal(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::ServerInternal, message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<&HiveError> for ApiError {
    fn from(err: &HiveError) -> Self {
        match err {
            HiveError::InstanceNotFound(id) => Self::new(
                ApiErrorCode::InvalidInstanceIdNotFound,
                format!("The instance ID '{}' does not exist", id),
            ),
            HiveError::InsufficientCapacity(ty) => Self::new(
                ApiErrorCode::InsufficientInstanceCapacity,
                format!("Insufficient capacity for instance type {}", ty),
            ),
            HiveError::UnknownInstanceType(ty) => Self::new(
                ApiErrorCode::InvalidInstanceType,
                format!("The instance type '{}' does not exist", ty),
            ),
            HiveError::VolumeNotFound(id) => Self::new(
                ApiErrorCode::InvalidVolumeNotFound,
                format!("The volume '{}' does not exist", id),
            ),
            HiveError::VolumeInUse(id) => Self::new(
                ApiErrorCode::VolumeInUse,
                format!("Volume {} is currently attached", id),
            ),
            HiveError::NoDeviceSlots => Self::new(
                ApiErrorCode::AttachmentLimitExceeded,
                "All device slots /dev/sdf through /dev/sdp are in use",
            ),
            HiveError::NotPermitted(msg) => {
                Self::new(ApiErrorCode::OperationNotPermitted, msg.clone())
            }
            other => Self::server_internal(other.to_string()),
        }
    }
}

impl From<HiveError> for ApiError {
    fn from(err: HiveError) -> Self {
        ApiError::from(&err)
    }
}
