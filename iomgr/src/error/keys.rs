/// Integer-valued error attributes.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub enum IntProperty {
    /// `errno` captured at a failing syscall.
    Errno,
    FileLine,
    StreamId,
    /// Status code (see [`StatusCode`]) that the error maps to.
    GrpcStatus,
    Offset,
    Index,
    Size,
    Http2Error,
    TsiCode,
    Fd,
    WsaError,
    HttpStatus,
    OccurredDuringWrite,
    ChannelConnectivityState,
    LbPolicyDrop,
    StreamNetworkState,
}

impl IntProperty {
    pub fn name(&self) -> &'static str {
        match self {
            IntProperty::Errno => "errno",
            IntProperty::FileLine => "file_line",
            IntProperty::StreamId => "stream_id",
            IntProperty::GrpcStatus => "grpc_status",
            IntProperty::Offset => "offset",
            IntProperty::Index => "index",
            IntProperty::Size => "size",
            IntProperty::Http2Error => "http2_error",
            IntProperty::TsiCode => "tsi_code",
            IntProperty::Fd => "fd",
            IntProperty::WsaError => "wsa_error",
            IntProperty::HttpStatus => "http_status",
            IntProperty::OccurredDuringWrite => "occurred_during_write",
            IntProperty::ChannelConnectivityState => "channel_connectivity_state",
            IntProperty::LbPolicyDrop => "lb_policy_drop",
            IntProperty::StreamNetworkState => "stream_network_state",
        }
    }
}

/// String-valued error attributes.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub enum StrProperty {
    Description,
    File,
    /// `strerror` text for [`IntProperty::Errno`].
    OsError,
    Syscall,
    TargetAddress,
    GrpcMessage,
    RawBytes,
    TsiError,
    Filename,
    Key,
    Value,
}

impl StrProperty {
    pub fn name(&self) -> &'static str {
        match self {
            StrProperty::Description => "description",
            StrProperty::File => "file",
            StrProperty::OsError => "os_error",
            StrProperty::Syscall => "syscall",
            StrProperty::TargetAddress => "target_address",
            StrProperty::GrpcMessage => "grpc_message",
            StrProperty::RawBytes => "raw_bytes",
            StrProperty::TsiError => "tsi_error",
            StrProperty::Filename => "filename",
            StrProperty::Key => "key",
            StrProperty::Value => "value",
        }
    }
}

/// Timestamp-valued error attributes.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub enum TimeProperty {
    Created,
}

impl TimeProperty {
    pub fn name(&self) -> &'static str {
        match self {
            TimeProperty::Created => "created",
        }
    }
}

/// Canonical RPC status codes.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
#[repr(i64)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Values outside the known range collapse to `Unknown`.
    pub fn from_i64(code: i64) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => StatusCode::Unknown,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}
