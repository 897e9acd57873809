//! Opcode, magic, status and feature definitions for the binary protocol

/// Magic byte that opens every frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Magic {
    ClientRequest = 0x80,
    ClientResponse = 0x81,
    AltClientRequest = 0x08,
    AltClientResponse = 0x18,
}

impl Magic {
    pub fn from_u8(value: u8) -> Option<Magic> {
        match value {
            0x80 => Some(Magic::ClientRequest),
            0x81 => Some(Magic::ClientResponse),
            0x08 => Some(Magic::AltClientRequest),
            0x18 => Some(Magic::AltClientResponse),
            _ => None,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(self, Magic::ClientRequest | Magic::AltClientRequest)
    }

    pub fn is_response(self) -> bool {
        matches!(self, Magic::ClientResponse | Magic::AltClientResponse)
    }

    /// The frame-extras capable form of this magic.
    pub fn alt_form(self) -> Magic {
        match self {
            Magic::ClientRequest | Magic::AltClientRequest => Magic::AltClientRequest,
            Magic::ClientResponse | Magic::AltClientResponse => Magic::AltClientResponse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Noop = 0x0a,
    Append = 0x0e,
    Prepend = 0x0f,
    Touch = 0x1c,
    GetAndTouch = 0x1d,
    Hello = 0x1f,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    GetReplica = 0x83,
    SelectBucket = 0x89,
    Observe = 0x92,
    GetAndLock = 0x94,
    Unlock = 0x95,
    GetMeta = 0xa0,
    GetClusterConfig = 0xb5,
    GetRandomKey = 0xb6,
    GetCollectionsManifest = 0xba,
    GetCollectionId = 0xbb,
    GetScopeId = 0xbc,
    SubdocMultiLookup = 0xd0,
    SubdocMultiMutation = 0xd1,
    RangeScanCreate = 0xda,
    RangeScanContinue = 0xdb,
    RangeScanCancel = 0xdc,
    GetErrorMap = 0xfe,
    Invalid = 0xff,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Opcode {
        match value {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Increment,
            0x06 => Opcode::Decrement,
            0x0a => Opcode::Noop,
            0x0e => Opcode::Append,
            0x0f => Opcode::Prepend,
            0x1c => Opcode::Touch,
            0x1d => Opcode::GetAndTouch,
            0x1f => Opcode::Hello,
            0x20 => Opcode::SaslListMechs,
            0x21 => Opcode::SaslAuth,
            0x22 => Opcode::SaslStep,
            0x83 => Opcode::GetReplica,
            0x89 => Opcode::SelectBucket,
            0x92 => Opcode::Observe,
            0x94 => Opcode::GetAndLock,
            0x95 => Opcode::Unlock,
            0xa0 => Opcode::GetMeta,
            0xb5 => Opcode::GetClusterConfig,
            0xb6 => Opcode::GetRandomKey,
            0xba => Opcode::GetCollectionsManifest,
            0xbb => Opcode::GetCollectionId,
            0xbc => Opcode::GetScopeId,
            0xd0 => Opcode::SubdocMultiLookup,
            0xd1 => Opcode::SubdocMultiMutation,
            0xda => Opcode::RangeScanCreate,
            0xdb => Opcode::RangeScanContinue,
            0xdc => Opcode::RangeScanCancel,
            0xfe => Opcode::GetErrorMap,
            _ => Opcode::Invalid,
        }
    }

    /// Whether this command can be replayed without changing its observable effect.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            Opcode::Get
                | Opcode::GetReplica
                | Opcode::GetMeta
                | Opcode::GetRandomKey
                | Opcode::Noop
                | Opcode::Observe
                | Opcode::GetClusterConfig
                | Opcode::GetCollectionsManifest
                | Opcode::GetCollectionId
                | Opcode::GetScopeId
                | Opcode::GetErrorMap
                | Opcode::SubdocMultiLookup
                | Opcode::RangeScanCreate
                | Opcode::RangeScanContinue
                | Opcode::RangeScanCancel
        )
    }

    /// Whether the key of this command carries a leb128 collection prefix
    /// once collections have been negotiated.
    pub fn supports_collection_id(self) -> bool {
        matches!(
            self,
            Opcode::Get
                | Opcode::Set
                | Opcode::Add
                | Opcode::Replace
                | Opcode::Delete
                | Opcode::Increment
                | Opcode::Decrement
                | Opcode::Append
                | Opcode::Prepend
                | Opcode::Touch
                | Opcode::GetAndTouch
                | Opcode::GetAndLock
                | Opcode::Unlock
                | Opcode::GetReplica
                | Opcode::GetMeta
                | Opcode::SubdocMultiLookup
                | Opcode::SubdocMultiMutation
        )
    }
}

/// Status word of a response frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    #[default]
    Success = 0x0000,
    NotFound = 0x0001,
    Exists = 0x0002,
    TooBig = 0x0003,
    InvalidArguments = 0x0004,
    NotStored = 0x0005,
    DeltaBadval = 0x0006,
    NotMyVbucket = 0x0007,
    NoBucket = 0x0008,
    Locked = 0x0009,
    AuthError = 0x0020,
    AuthContinue = 0x0021,
    Erange = 0x0022,
    Eaccess = 0x0024,
    NotInitialized = 0x0025,
    UnknownCommand = 0x0081,
    OutOfMemory = 0x0082,
    NotSupported = 0x0083,
    InternalError = 0x0084,
    Busy = 0x0085,
    TemporaryFailure = 0x0086,
    UnknownCollection = 0x0088,
    NoCollectionsManifest = 0x0089,
    UnknownScope = 0x008c,
    DurabilityInvalidLevel = 0x00a0,
    DurabilityImpossible = 0x00a1,
    SyncWriteInProgress = 0x00a2,
    SyncWriteAmbiguous = 0x00a3,
    SyncWriteReCommitInProgress = 0x00a4,
    RangeScanCancelled = 0x00a5,
    RangeScanMore = 0x00a6,
    RangeScanComplete = 0x00a7,
    Unknown = 0xffff,
}

impl Status {
    pub fn from_u16(value: u16) -> Status {
        match value {
            0x0000 => Status::Success,
            0x0001 => Status::NotFound,
            0x0002 => Status::Exists,
            0x0003 => Status::TooBig,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::NotStored,
            0x0006 => Status::DeltaBadval,
            0x0007 => Status::NotMyVbucket,
            0x0008 => Status::NoBucket,
            0x0009 => Status::Locked,
            0x0020 => Status::AuthError,
            0x0021 => Status::AuthContinue,
            0x0022 => Status::Erange,
            0x0024 => Status::Eaccess,
            0x0025 => Status::NotInitialized,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0083 => Status::NotSupported,
            0x0084 => Status::InternalError,
            0x0085 => Status::Busy,
            0x0086 => Status::TemporaryFailure,
            0x0088 => Status::UnknownCollection,
            0x0089 => Status::NoCollectionsManifest,
            0x008c => Status::UnknownScope,
            0x00a0 => Status::DurabilityInvalidLevel,
            0x00a1 => Status::DurabilityImpossible,
            0x00a2 => Status::SyncWriteInProgress,
            0x00a3 => Status::SyncWriteAmbiguous,
            0x00a4 => Status::SyncWriteReCommitInProgress,
            0x00a5 => Status::RangeScanCancelled,
            0x00a6 => Status::RangeScanMore,
            0x00a7 => Status::RangeScanComplete,
            _ => Status::Unknown,
        }
    }
}

/// Feature codes exchanged during the `HELLO` negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum HelloFeature {
    Datatype = 0x0001,
    Tls = 0x0002,
    TcpNodelay = 0x0003,
    MutationSeqno = 0x0004,
    Xattr = 0x0006,
    Xerror = 0x0007,
    SelectBucket = 0x0008,
    Snappy = 0x000a,
    Json = 0x000b,
    Duplex = 0x000c,
    UnorderedExecution = 0x000e,
    Tracing = 0x000f,
    AltRequestSupport = 0x0010,
    SyncReplication = 0x0011,
    Collections = 0x0012,
    OpenTracing = 0x0013,
    PreserveTtl = 0x0014,
    Vattr = 0x0015,
    SubdocCreateAsDeleted = 0x0017,
}

impl HelloFeature {
    pub fn from_u16(value: u16) -> Option<HelloFeature> {
        match value {
            0x0001 => Some(HelloFeature::Datatype),
            0x0002 => Some(HelloFeature::Tls),
            0x0003 => Some(HelloFeature::TcpNodelay),
            0x0004 => Some(HelloFeature::MutationSeqno),
            0x0006 => Some(HelloFeature::Xattr),
            0x0007 => Some(HelloFeature::Xerror),
            0x0008 => Some(HelloFeature::SelectBucket),
            0x000a => Some(HelloFeature::Snappy),
            0x000b => Some(HelloFeature::Json),
            0x000c => Some(HelloFeature::Duplex),
            0x000e => Some(HelloFeature::UnorderedExecution),
            0x000f => Some(HelloFeature::Tracing),
            0x0010 => Some(HelloFeature::AltRequestSupport),
            0x0011 => Some(HelloFeature::SyncReplication),
            0x0012 => Some(HelloFeature::Collections),
            0x0013 => Some(HelloFeature::OpenTracing),
            0x0014 => Some(HelloFeature::PreserveTtl),
            0x0015 => Some(HelloFeature::Vattr),
            0x0017 => Some(HelloFeature::SubdocCreateAsDeleted),
            _ => None,
        }
    }
}

/// The ordered feature list offered in `HELLO`.
pub const REQUESTED_FEATURES: &[HelloFeature] = &[
    HelloFeature::TcpNodelay,
    HelloFeature::Xattr,
    HelloFeature::Xerror,
    HelloFeature::SelectBucket,
    HelloFeature::Datatype,
    HelloFeature::Json,
    HelloFeature::Snappy,
    HelloFeature::MutationSeqno,
    HelloFeature::UnorderedExecution,
    HelloFeature::AltRequestSupport,
    HelloFeature::SyncReplication,
    HelloFeature::Collections,
    HelloFeature::PreserveTtl,
    HelloFeature::Vattr,
];

pub mod datatype {
    pub const RAW: u8 = 0x00;
    pub const JSON: u8 = 0x01;
    pub const SNAPPY: u8 = 0x02;
    pub const XATTR: u8 = 0x04;
}

/// Frame-extras type codes for request frames.
pub mod request_frame {
    pub const BARRIER: u8 = 0;
    pub const SYNC_DURABILITY: u8 = 1;
    pub const STREAM_ID: u8 = 2;
    pub const OPEN_TRACING: u8 = 3;
    pub const USER_IMPERSONATION: u8 = 4;
    pub const PRESERVE_EXPIRY: u8 = 5;
}

/// Frame-extras type codes for response frames.
pub mod response_frame {
    pub const SERVER_DURATION: u8 = 0;
    pub const READ_UNITS: u8 = 1;
    pub const WRITE_UNITS: u8 = 2;
}

/// Durability requirement carried by the sync-durability frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DurabilityLevel {
    Majority = 0x01,
    MajorityAndPersistToActive = 0x02,
    PersistToMajority = 0x03,
}

impl DurabilityLevel {
    pub fn from_u8(value: u8) -> Option<DurabilityLevel> {
        match value {
            0x01 => Some(DurabilityLevel::Majority),
            0x02 => Some(DurabilityLevel::MajorityAndPersistToActive),
            0x03 => Some(DurabilityLevel::PersistToMajority),
            _ => None,
        }
    }
}
