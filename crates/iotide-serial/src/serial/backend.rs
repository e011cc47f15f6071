//! Transport selection, performed once at start-up.

use crate::serial::bridge::HostProcessTransport;
use crate::serial::native::InProcessTransport;
use crate::serial::transport::{SerialTransport, SimulatedTransport};
use crate::serial::types::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the bridge executable looked up on `PATH`.
pub const BRIDGE_PROGRAM: &str = "serial-bridge";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendPreference {
    /// Bridge if it can be found, otherwise in-process access.
    #[default]
    Auto,
    HostProcess,
    InProcess,
    Simulated,
}

impl std::str::FromStr for BackendPreference {
    type Err = SerialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(|c: char| c == '-' || c == '_', "").as_str() {
            "auto" => Ok(Self::Auto),
            "hostprocess" | "bridge" => Ok(Self::HostProcess),
            "inprocess" | "native" => Ok(Self::InProcess),
            "simulated" | "sim" => Ok(Self::Simulated),
            other => Err(SerialError::new(
                SerialErrorKind::InvalidConfig,
                format!("Unknown backend '{}'", other),
            )),
        }
    }
}

/// Resolve the bridge program: an explicit path must exist, otherwise
/// [`BRIDGE_PROGRAM`] is looked up on `PATH`.
pub fn resolve_bridge(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => which::which(path).ok().or_else(|| path.is_file().then(|| path.to_path_buf())),
        None => which::which(BRIDGE_PROGRAM).ok(),
    }
}

/// Whether direct port access is available on this target.
pub fn in_process_supported() -> bool {
    cfg!(any(target_os = "linux", target_os = "macos", target_os = "windows", target_os = "freebsd"))
}

/// Decide which backend a preference resolves to, without constructing it.
pub fn resolve_backend(
    preference: BackendPreference,
    bridge: Option<&Path>,
) -> Result<(BackendKind, Option<PathBuf>), SerialError> {
    match preference {
        BackendPreference::Simulated => Ok((BackendKind::Simulated, None)),
        BackendPreference::InProcess if in_process_supported() => Ok((BackendKind::InProcess, None)),
        BackendPreference::InProcess => Err(SerialError::new(
            SerialErrorKind::TransportNotSupported,
            "In-process serial access is not available on this platform",
        )),
        BackendPreference::HostProcess => match resolve_bridge(bridge) {
            Some(path) => Ok((BackendKind::HostProcess, Some(path))),
            None => Err(SerialError::new(
                SerialErrorKind::TransportNotSupported,
                format!("Serial bridge '{}' not found", BRIDGE_PROGRAM),
            )),
        },
        BackendPreference::Auto => {
            if let Some(path) = resolve_bridge(bridge) {
                Ok((BackendKind::HostProcess, Some(path)))
            } else if in_process_supported() {
                Ok((BackendKind::InProcess, None))
            } else {
                Err(SerialError::new(
                    SerialErrorKind::TransportNotSupported,
                    "No serial backend available",
                ))
            }
        }
    }
}

/// Build the transport for `preference`. Must run inside a Tokio runtime
/// when the host-process backend is chosen.
pub fn select_transport(
    preference: BackendPreference,
    bridge: Option<&Path>,
) -> Result<Arc<dyn SerialTransport>, SerialError> {
    let (kind, program) = resolve_backend(preference, bridge)?;
    log::info!("Using {} serial backend", kind.label());
    let transport: Arc<dyn SerialTransport> = match (kind, program) {
        (BackendKind::HostProcess, Some(program)) => HostProcessTransport::spawn(&program)?,
        (BackendKind::HostProcess, None) => {
            return Err(SerialError::new(
                SerialErrorKind::TransportNotSupported,
                "Serial bridge not resolved",
            ))
        }
        (BackendKind::InProcess, _) => Arc::new(InProcessTransport::new()),
        (BackendKind::Simulated, _) => {
            let sim = SimulatedTransport::new();
            sim.set_responder(SimulatedTransport::echo_repl());
            sim
        }
    };
    Ok(transport)
}
