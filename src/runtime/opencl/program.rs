//! Program compilation and kernel creation.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use opencl3::program::Program as ClProgram;

use crate::error::{ClError, Result, Status};

use super::context::SharedContext;
use super::kernel::Kernel;
use super::ledger::{ReleaseLedger, ResourceKind};
use super::queue::Queue;

/// Label of programs built from in-memory source.
pub const FROM_SOURCE_LABEL: &str = "(From source)";

/// A native program object, shared by every [`Program`] and [`Kernel`] that
/// uses it. Released once the last user drops.
pub(crate) struct CompiledProgram {
    native: Option<ClProgram>,
    ledger: Arc<ReleaseLedger>,
}

impl CompiledProgram {
    fn new(native: ClProgram, ledger: Arc<ReleaseLedger>) -> Self {
        ledger.record_created(ResourceKind::Program);
        CompiledProgram {
            native: Some(native),
            ledger,
        }
    }

    pub(crate) fn cl_program(&self) -> Option<&ClProgram> {
        self.native.as_ref()
    }

    pub(crate) fn ledger(&self) -> &Arc<ReleaseLedger> {
        &self.ledger
    }
}

impl Drop for CompiledProgram {
    fn drop(&mut self) {
        if let Some(native) = self.native.take() {
            drop(native);
            self.ledger.record_released(ResourceKind::Program);
        }
    }
}

// OpenCL handles thread safety internally
unsafe impl Send for CompiledProgram {}
unsafe impl Sync for CompiledProgram {}

/// Assembles compiler flags: the include path first, then extra options.
///
/// Backslashes in the include path are turned into forward slashes so the
/// same flag works with every driver.
pub fn build_options(include_root: &Path, extra: &[&str]) -> String {
    let root = include_root.to_string_lossy().replace('\\', "/");
    let mut options = format!("-I \"{}\"", root);
    for flags in extra.iter().map(|f| f.trim()).filter(|f| !f.is_empty()) {
        options.push(' ');
        options.push_str(flags);
    }
    options
}

/// A compilation unit built for the devices of one context.
///
/// A program whose build failed stays constructed with `is_built() == false`;
/// every `load_kernel` call on it fails.
pub struct Program {
    label: String,
    options: String,
    compiled: Option<Arc<CompiledProgram>>,
    built: bool,
    build_status: Option<Status>,
    build_log: String,
    shared: Arc<SharedContext>,
}

impl Program {
    /// Creates a program from source and builds it.
    ///
    /// Never fails outright: inspect [`is_built`](Self::is_built) or
    /// [`build_error`](Self::build_error) for the outcome. The build log is
    /// always fetched and logged.
    pub fn from_source(
        shared: &Arc<SharedContext>,
        source: &str,
        label: Option<&str>,
        options: Option<&str>,
    ) -> Program {
        let label = label.unwrap_or(FROM_SOURCE_LABEL).to_string();
        let options = Self::options_for(shared, options);

        let mut native = match ClProgram::create_from_source(shared.context(), source) {
            Ok(native) => native,
            Err(e) => {
                let status = Status::from(e);
                error!("Error creating program {}: {}", label, status);
                return Program {
                    label,
                    options,
                    compiled: None,
                    built: false,
                    build_status: Some(status),
                    build_log: String::new(),
                    shared: shared.clone(),
                };
            }
        };

        info!("Build OpenCL program {}: ({}) ...", label, options);
        let result = native.build(&shared.device_ids(), &options);
        let build_log = collect_build_log(shared, &native);
        let compiled = Arc::new(CompiledProgram::new(native, shared.ledger().clone()));

        let build_status = match result {
            Ok(()) => {
                info!("Build OpenCL program {}: success", label);
                if !build_log.is_empty() {
                    info!("Build log {}:\n{}", label, build_log);
                }
                None
            }
            Err(e) => {
                let status = Status::from(e);
                error!("Build OpenCL program {}: failed [{}]", label, status);
                error!("Build log {}:\n{}", label, build_log);
                Some(status)
            }
        };

        Program {
            label,
            options,
            built: build_status.is_none(),
            compiled: Some(compiled),
            build_status,
            build_log,
            shared: shared.clone(),
        }
    }

    /// Reads source text from `path` and builds it.
    ///
    /// Binary programs are not supported.
    pub fn from_file(
        shared: &Arc<SharedContext>,
        path: impl AsRef<Path>,
        is_binary: bool,
        options: Option<&str>,
    ) -> Result<Program> {
        let path = path.as_ref();
        if is_binary {
            error!("Loading binary program {} is not supported", path.display());
            return Err(ClError::NotImplemented("binary program loading"));
        }
        let source = std::fs::read_to_string(path).map_err(|source| {
            error!("Error reading program source {}: {}", path.display(), source);
            ClError::SourceReadError {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let label = path.display().to_string();
        Ok(Self::from_source(shared, &source, Some(&label), options))
    }

    /// Wraps an already built native program.
    pub(crate) fn from_compiled(
        shared: &Arc<SharedContext>,
        compiled: Arc<CompiledProgram>,
        label: Option<&str>,
        options: String,
    ) -> Program {
        let label = label.unwrap_or(FROM_SOURCE_LABEL).to_string();
        info!("Build OpenCL program {}: reused cached build", label);
        Program {
            label,
            options,
            compiled: Some(compiled),
            built: true,
            build_status: None,
            build_log: String::new(),
            shared: shared.clone(),
        }
    }

    /// Full option string a build in `shared` would use.
    pub(crate) fn options_for(shared: &SharedContext, options: Option<&str>) -> String {
        let extra: Vec<&str> = [shared.build_options(), options]
            .into_iter()
            .flatten()
            .collect();
        build_options(shared.include_root(), &extra)
    }

    pub(crate) fn compiled(&self) -> Option<&Arc<CompiledProgram>> {
        self.compiled.as_ref()
    }

    /// Source path, or `(From source)`.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Compiler flags the program was built with.
    pub fn options(&self) -> &str {
        &self.options
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Build log of every device, empty for cached builds.
    pub fn build_log(&self) -> &str {
        &self.build_log
    }

    /// The build failure, if the program did not build.
    pub fn build_error(&self) -> Option<ClError> {
        self.build_status.map(|status| ClError::BuildFailed {
            label: self.label.clone(),
            program: None,
            status,
            log: self.build_log.clone(),
        })
    }

    /// Creates a kernel for entry point `name`, bound to `queue`.
    pub fn load_kernel(&self, name: &str, queue: &Queue) -> Result<Kernel> {
        let compiled = match self.compiled.as_ref() {
            Some(compiled) if self.built => compiled,
            _ => {
                error!(
                    "Error creating kernel {}: program {} is not built",
                    name, self.label
                );
                return Err(ClError::KernelNotFound {
                    name: name.to_string(),
                    status: self.build_status,
                });
            }
        };
        Kernel::create(compiled.clone(), name, queue.clone())
    }

    /// Compiled binary per device.
    pub fn binaries(&self) -> Result<Vec<Vec<u8>>> {
        let native = self
            .compiled
            .as_ref()
            .and_then(|c| c.cl_program())
            .ok_or_else(|| ClError::invalid_argument(format!("program {} has no native handle", self.label)))?;
        native.get_binaries().map_err(|e| ClError::Unhandled {
            what: format!("binaries of program {}", self.label),
            status: Status::from(e),
        })
    }

    /// Logs the size of each device binary. A missing binary is reported but
    /// is not an error.
    pub fn log_binaries(&self) {
        match self.binaries() {
            Ok(binaries) if binaries.iter().any(|b| !b.is_empty()) => {
                for (device, binary) in self.shared.devices().iter().zip(&binaries) {
                    info!(
                        "Program {} binary for {}: {} bytes",
                        self.label,
                        device.name(),
                        binary.len()
                    );
                }
            }
            Ok(_) => warn!("Program {}: no valid binary", self.label),
            Err(e) => warn!("Program {}: no valid binary ({})", self.label, e),
        }
    }
}

fn collect_build_log(shared: &SharedContext, native: &ClProgram) -> String {
    let mut logs = Vec::new();
    for device in shared.devices() {
        match native.get_build_log(device.id()) {
            Ok(log) => {
                let log = log.trim_matches(|c: char| c.is_whitespace() || c == '\0');
                if !log.is_empty() {
                    logs.push(format!("[{}]\n{}", device.name(), log));
                }
            }
            Err(e) => warn!(
                "Error retrieving build log for {}: {}",
                device.name(),
                Status::from(e)
            ),
        }
    }
    logs.join("\n")
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("label", &self.label)
            .field("options", &self.options)
            .field("built", &self.built)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(".", &[], "-I \".\"")]
    #[case("/opt/kernels", &["-DN=4"], "-I \"/opt/kernels\" -DN=4")]
    #[case("C:\\data\\kernels", &[], "-I \"C:/data/kernels\"")]
    #[case("res", &["  ", "-cl-fast-relaxed-math", "-DX"], "-I \"res\" -cl-fast-relaxed-math -DX")]
    fn test_build_options(#[case] root: &str, #[case] extra: &[&str], #[case] expected: &str) {
        assert_eq!(build_options(&PathBuf::from(root), extra), expected);
    }
}
