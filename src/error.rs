//! Native status translation and the crate error taxonomy.
//!
//! Every fallible operation in the crate returns [`Result`]. Failures that
//! originate in a native call carry the raw status as a [`Status`], whose
//! `Display` renders the translated message next to the code.

use std::fmt;
use std::path::PathBuf;

use opencl3::error_codes::ClError as NativeError;
use opencl3::types::cl_int;

use crate::registry::ProgramId;

/// Message returned by [`error_as_str`] for codes outside the known table.
pub const UNHANDLED_ERROR: &str = "Unhandled OpenCL error";

/// Status codes defined by the OpenCL 1.0 - 2.2 headers.
///
/// Each entry is `(code, symbolic name, message)`.
const STATUS_TABLE: &[(cl_int, &str, &str)] = &[
    (0, "CL_SUCCESS", "Success"),
    (-1, "CL_DEVICE_NOT_FOUND", "Device not found"),
    (-2, "CL_DEVICE_NOT_AVAILABLE", "Device not available"),
    (-3, "CL_COMPILER_NOT_AVAILABLE", "Compiler not available"),
    (-4, "CL_MEM_OBJECT_ALLOCATION_FAILURE", "Memory object allocation failure"),
    (-5, "CL_OUT_OF_RESOURCES", "Out of resources"),
    (-6, "CL_OUT_OF_HOST_MEMORY", "Out of host memory"),
    (-7, "CL_PROFILING_INFO_NOT_AVAILABLE", "Profiling information not available"),
    (-8, "CL_MEM_COPY_OVERLAP", "Memory copy overlap"),
    (-9, "CL_IMAGE_FORMAT_MISMATCH", "Image format mismatch"),
    (-10, "CL_IMAGE_FORMAT_NOT_SUPPORTED", "Image format not supported"),
    (-11, "CL_BUILD_PROGRAM_FAILURE", "Program build failure"),
    (-12, "CL_MAP_FAILURE", "Map failure"),
    (-13, "CL_MISALIGNED_SUB_BUFFER_OFFSET", "Misaligned sub-buffer offset"),
    (-14, "CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST", "Execution error in wait-list events"),
    (-15, "CL_COMPILE_PROGRAM_FAILURE", "Program compile failure"),
    (-16, "CL_LINKER_NOT_AVAILABLE", "Linker not available"),
    (-17, "CL_LINK_PROGRAM_FAILURE", "Program link failure"),
    (-18, "CL_DEVICE_PARTITION_FAILED", "Device partition failed"),
    (-19, "CL_KERNEL_ARG_INFO_NOT_AVAILABLE", "Kernel argument info not available"),
    (-30, "CL_INVALID_VALUE", "Invalid value"),
    (-31, "CL_INVALID_DEVICE_TYPE", "Invalid device type"),
    (-32, "CL_INVALID_PLATFORM", "Invalid platform"),
    (-33, "CL_INVALID_DEVICE", "Invalid device"),
    (-34, "CL_INVALID_CONTEXT", "Invalid context"),
    (-35, "CL_INVALID_QUEUE_PROPERTIES", "Invalid queue properties"),
    (-36, "CL_INVALID_COMMAND_QUEUE", "Invalid command queue"),
    (-37, "CL_INVALID_HOST_PTR", "Invalid host pointer"),
    (-38, "CL_INVALID_MEM_OBJECT", "Invalid memory object"),
    (-39, "CL_INVALID_IMAGE_FORMAT_DESCRIPTOR", "Invalid image format descriptor"),
    (-40, "CL_INVALID_IMAGE_SIZE", "Invalid image size"),
    (-41, "CL_INVALID_SAMPLER", "Invalid sampler"),
    (-42, "CL_INVALID_BINARY", "Invalid binary"),
    (-43, "CL_INVALID_BUILD_OPTIONS", "Invalid build options"),
    (-44, "CL_INVALID_PROGRAM", "Invalid program"),
    (-45, "CL_INVALID_PROGRAM_EXECUTABLE", "Invalid program executable"),
    (-46, "CL_INVALID_KERNEL_NAME", "Invalid kernel name"),
    (-47, "CL_INVALID_KERNEL_DEFINITION", "Invalid kernel definition"),
    (-48, "CL_INVALID_KERNEL", "Invalid kernel"),
    (-49, "CL_INVALID_ARG_INDEX", "Invalid argument index"),
    (-50, "CL_INVALID_ARG_VALUE", "Invalid argument value"),
    (-51, "CL_INVALID_ARG_SIZE", "Invalid argument size"),
    (-52, "CL_INVALID_KERNEL_ARGS", "Invalid kernel arguments"),
    (-53, "CL_INVALID_WORK_DIMENSION", "Invalid work dimension"),
    (-54, "CL_INVALID_WORK_GROUP_SIZE", "Invalid work group size"),
    (-55, "CL_INVALID_WORK_ITEM_SIZE", "Invalid work item size"),
    (-56, "CL_INVALID_GLOBAL_OFFSET", "Invalid global offset"),
    (-57, "CL_INVALID_EVENT_WAIT_LIST", "Invalid event wait list"),
    (-58, "CL_INVALID_EVENT", "Invalid event"),
    (-59, "CL_INVALID_OPERATION", "Invalid operation"),
    (-60, "CL_INVALID_GL_OBJECT", "Invalid OpenGL object"),
    (-61, "CL_INVALID_BUFFER_SIZE", "Invalid buffer size"),
    (-62, "CL_INVALID_MIP_LEVEL", "Invalid MIP level"),
    (-63, "CL_INVALID_GLOBAL_WORK_SIZE", "Invalid global work size"),
    (-64, "CL_INVALID_PROPERTY", "Invalid property"),
    (-65, "CL_INVALID_IMAGE_DESCRIPTOR", "Invalid image descriptor"),
    (-66, "CL_INVALID_COMPILER_OPTIONS", "Invalid compiler options"),
    (-67, "CL_INVALID_LINKER_OPTIONS", "Invalid linker options"),
    (-68, "CL_INVALID_DEVICE_PARTITION_COUNT", "Invalid device partition count"),
    (-69, "CL_INVALID_PIPE_SIZE", "Invalid pipe size"),
    (-70, "CL_INVALID_DEVICE_QUEUE", "Invalid device queue"),
    (-71, "CL_INVALID_SPEC_ID", "Invalid specialization constant id"),
    (-72, "CL_MAX_SIZE_RESTRICTION_EXCEEDED", "Maximum size restriction exceeded"),
];

fn lookup(code: cl_int) -> Option<&'static (cl_int, &'static str, &'static str)> {
    STATUS_TABLE.iter().find(|(c, _, _)| *c == code)
}

/// Translates a native status code into a human readable message.
///
/// Total over `cl_int`: unknown codes yield [`UNHANDLED_ERROR`].
pub fn error_as_str(code: cl_int) -> &'static str {
    lookup(code).map_or(UNHANDLED_ERROR, |(_, _, msg)| msg)
}

/// Returns the header name of a status code (`CL_INVALID_VALUE`, ...).
pub fn status_name(code: cl_int) -> Option<&'static str> {
    lookup(code).map(|(_, name, _)| *name)
}

/// A raw native status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub cl_int);

impl Status {
    /// Returns the raw code.
    pub fn code(self) -> cl_int {
        self.0
    }

    /// Returns the translated message.
    pub fn message(self) -> &'static str {
        error_as_str(self.0)
    }

    /// Classifies the code into a taxonomy kind.
    pub fn kind(self) -> ErrorKind {
        ErrorKind::classify(self.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.0)
    }
}

impl From<NativeError> for Status {
    fn from(err: NativeError) -> Self {
        Status(err.0)
    }
}

/// Taxonomy kinds, independent of the operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoDeviceFound,
    ContextCreationFailed,
    QueueCreationFailed,
    SourceReadError,
    BuildFailed,
    KernelNotFound,
    InvalidArgument,
    InvalidSize,
    InteropFailed,
    DispatchFailed,
    WaitFailed,
    TransferFailed,
    NotImplemented,
    NotInitialised,
    Unhandled,
}

impl ErrorKind {
    /// Maps a native status code onto the taxonomy.
    ///
    /// Codes that only ever describe one failure class map directly; anything
    /// else is `Unhandled` and the failing operation picks its own kind.
    pub fn classify(code: cl_int) -> ErrorKind {
        match code {
            -1 | -2 | -31 | -33 => ErrorKind::NoDeviceFound,
            -32 | -34 | -64 => ErrorKind::ContextCreationFailed,
            -35 | -36 | -70 => ErrorKind::QueueCreationFailed,
            -3 | -11 | -15 | -16 | -17 | -42 | -43 | -44 | -66 | -67 => ErrorKind::BuildFailed,
            -46 | -47 => ErrorKind::KernelNotFound,
            -9 | -10 | -30 | -37 | -38 | -39 | -41 | -48 | -49 | -50 | -51 | -52 | -65 => {
                ErrorKind::InvalidArgument
            }
            -40 | -61 | -72 => ErrorKind::InvalidSize,
            -60 | -62 => ErrorKind::InteropFailed,
            -45 | -53 | -54 | -55 | -56 | -63 => ErrorKind::DispatchFailed,
            -14 | -57 | -58 => ErrorKind::WaitFailed,
            -8 | -12 | -13 => ErrorKind::TransferFailed,
            _ => ErrorKind::Unhandled,
        }
    }
}

/// Crate error type.
#[derive(thiserror::Error, Debug)]
pub enum ClError {
    #[error("no OpenCL device found for device type {0}")]
    NoDeviceFound(String),

    #[error("failed to create OpenCL context: {0}")]
    ContextCreationFailed(Status),

    #[error("failed to create command queue on device {device}: {status}")]
    QueueCreationFailed { device: usize, status: Status },

    #[error("failed to read program source {}: {source}", .path.display())]
    SourceReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("build of program {label} failed: {status}")]
    BuildFailed {
        label: String,
        program: Option<ProgramId>,
        status: Status,
        log: String,
    },

    #[error("kernel {name} not found{}", .status.map(|s| format!(": {s}")).unwrap_or_default())]
    KernelNotFound { name: String, status: Option<Status> },

    #[error("invalid argument: {what}{}", .status.map(|s| format!(": {s}")).unwrap_or_default())]
    InvalidArgument { what: String, status: Option<Status> },

    #[error("invalid size: {0}")]
    InvalidSize(String),

    #[error("graphics interop failed for {what}{}", .status.map(|s| format!(": {s}")).unwrap_or_default())]
    InteropFailed { what: String, status: Option<Status> },

    #[error("dispatch of kernel {kernel} failed: {status}")]
    DispatchFailed { kernel: String, status: Status },

    #[error("waiting for event failed: {0}")]
    WaitFailed(Status),

    #[error("{what} failed: {status}")]
    TransferFailed { what: String, status: Status },

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("compute context is not initialised")]
    NotInitialised,

    #[error("{what}: {status}")]
    Unhandled { what: String, status: Status },
}

impl ClError {
    /// Returns the native status code behind this error, if there is one.
    pub fn status(&self) -> Option<cl_int> {
        match self {
            ClError::ContextCreationFailed(s) | ClError::WaitFailed(s) => Some(s.0),
            ClError::QueueCreationFailed { status, .. }
            | ClError::BuildFailed { status, .. }
            | ClError::DispatchFailed { status, .. }
            | ClError::TransferFailed { status, .. }
            | ClError::Unhandled { status, .. } => Some(status.0),
            ClError::KernelNotFound { status, .. }
            | ClError::InvalidArgument { status, .. }
            | ClError::InteropFailed { status, .. } => status.map(|s| s.0),
            _ => None,
        }
    }

    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClError::NoDeviceFound(_) => ErrorKind::NoDeviceFound,
            ClError::ContextCreationFailed(_) => ErrorKind::ContextCreationFailed,
            ClError::QueueCreationFailed { .. } => ErrorKind::QueueCreationFailed,
            ClError::SourceReadError { .. } => ErrorKind::SourceReadError,
            ClError::BuildFailed { .. } => ErrorKind::BuildFailed,
            ClError::KernelNotFound { .. } => ErrorKind::KernelNotFound,
            ClError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            ClError::InvalidSize(_) => ErrorKind::InvalidSize,
            ClError::InteropFailed { .. } => ErrorKind::InteropFailed,
            ClError::DispatchFailed { .. } => ErrorKind::DispatchFailed,
            ClError::WaitFailed(_) => ErrorKind::WaitFailed,
            ClError::TransferFailed { .. } => ErrorKind::TransferFailed,
            ClError::NotImplemented(_) => ErrorKind::NotImplemented,
            ClError::NotInitialised => ErrorKind::NotInitialised,
            ClError::Unhandled { .. } => ErrorKind::Unhandled,
        }
    }

    /// Builds an error for a native failure whose kind depends on the code.
    ///
    /// Used where a native call can fail for several distinct reasons, such as
    /// image allocation. Kinds that carry extra context fall back to their
    /// closest variant.
    pub fn from_status(what: impl Into<String>, status: Status) -> ClError {
        let what = what.into();
        match status.kind() {
            ErrorKind::InvalidArgument => ClError::InvalidArgument {
                what,
                status: Some(status),
            },
            ErrorKind::InvalidSize => ClError::InvalidSize(format!("{what}: {status}")),
            ErrorKind::InteropFailed => ClError::InteropFailed {
                what,
                status: Some(status),
            },
            ErrorKind::TransferFailed => ClError::TransferFailed { what, status },
            ErrorKind::WaitFailed => ClError::WaitFailed(status),
            _ => ClError::Unhandled { what, status },
        }
    }

    pub(crate) fn invalid_argument(what: impl Into<String>) -> ClError {
        ClError::InvalidArgument {
            what: what.into(),
            status: None,
        }
    }

    pub(crate) fn transfer(what: impl Into<String>, status: impl Into<Status>) -> ClError {
        ClError::TransferFailed {
            what: what.into(),
            status: status.into(),
        }
    }
}

/// Result type for compute operations.
pub type Result<T> = std::result::Result<T, ClError>;
