// ACSLS CSI protocol constants

/// CSI_ACSLM RPC program number and version.
pub const CSI_PROGRAM: u32 = 0x493FF;
pub const CSI_VERSION: u32 = 1;

pub const CSI_PROC_NULL: u32 = 0;
pub const CSI_PROC_COMMAND: u32 = 1000;

/// Bytes in the opaque CSI transaction id.
pub const CSI_XID_SIZE: usize = 36;
/// Bytes in the packed callback handle.
pub const CSI_HANDLE_SIZE: usize = 28;

/// Reserved identifier words that precede the volume id in MOUNT/DISMOUNT responses.
pub const RESERVED_IDENTIFIER_WORDS: usize = 11;

/// Request classes reported by QUERY SERVER, each with current and pending counts.
pub const REQUEST_CLASSES: usize = 5;

pub mod options {
    pub const FORCE: u32 = 0x01;
    pub const INTERMEDIATE: u32 = 0x02;
    pub const ACKNOWLEDGE: u32 = 0x04;
    pub const EXTENDED: u32 = 0x80;
}

/// ACSLS command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Audit = 1,
    Cancel = 2,
    Dismount = 3,
    Enter = 4,
    Eject = 5,
    Idle = 6,
    Mount = 7,
    Query = 8,
    Recovery = 9,
    Start = 10,
    Vary = 11,
}

impl Command {
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(Command::Audit),
            2 => Some(Command::Cancel),
            3 => Some(Command::Dismount),
            4 => Some(Command::Enter),
            5 => Some(Command::Eject),
            6 => Some(Command::Idle),
            7 => Some(Command::Mount),
            8 => Some(Command::Query),
            9 => Some(Command::Recovery),
            10 => Some(Command::Start),
            11 => Some(Command::Vary),
            _ => None,
        }
    }
}

/// Identifier types (only the ones this library answers for).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IdType {
    None = 17,
    Server = 23,
    Volume = 26,
}

impl IdType {
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            17 => Some(IdType::None),
            23 => Some(IdType::Server),
            26 => Some(IdType::Volume),
            _ => None,
        }
    }
}

/// Server states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ServerState {
    Offline = 5,
    Run = 9,
}

/// ACSLS response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    AcsNotInLibrary = 2,
    CountTooLarge = 20,
    CountTooSmall = 21,
    DriveAvailable = 27,
    DriveInUse = 28,
    InvalidCommand = 39,
    InvalidMessage = 42,
    LibraryFailure = 54,
    VolumeInDrive = 89,
    VolumeNotInDrive = 91,
    VolumeNotInLibrary = 92,
    UnsupportedType = 96,
    VolumeInUse = 97,
}

impl Status {
    pub const ALL: [Status; 14] = [
        Status::Success,
        Status::AcsNotInLibrary,
        Status::CountTooLarge,
        Status::CountTooSmall,
        Status::DriveAvailable,
        Status::DriveInUse,
        Status::InvalidCommand,
        Status::InvalidMessage,
        Status::LibraryFailure,
        Status::VolumeInDrive,
        Status::VolumeNotInDrive,
        Status::VolumeNotInLibrary,
        Status::UnsupportedType,
        Status::VolumeInUse,
    ];

    pub fn from_u32(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Status::Success => "STATUS_SUCCESS",
            Status::AcsNotInLibrary => "STATUS_ACS_NOT_IN_LIBRARY",
            Status::CountTooLarge => "STATUS_COUNT_TOO_LARGE",
            Status::CountTooSmall => "STATUS_COUNT_TOO_SMALL",
            Status::DriveAvailable => "STATUS_DRIVE_AVAILABLE",
            Status::DriveInUse => "STATUS_DRIVE_IN_USE",
            Status::InvalidCommand => "STATUS_INVALID_COMMAND",
            Status::InvalidMessage => "STATUS_INVALID_MESSAGE",
            Status::LibraryFailure => "STATUS_LIBRARY_FAILURE",
            Status::VolumeInDrive => "STATUS_VOLUME_IN_DRIVE",
            Status::VolumeNotInDrive => "STATUS_VOLUME_NOT_IN_DRIVE",
            Status::VolumeNotInLibrary => "STATUS_VOLUME_NOT_IN_LIBRARY",
            Status::UnsupportedType => "STATUS_UNSUPPORTED_TYPE",
            Status::VolumeInUse => "STATUS_VOLUME_IN_USE",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
