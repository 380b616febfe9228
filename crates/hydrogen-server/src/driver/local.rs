//! Local driver processes.
//!
//! A driver's stdin and stdout are both one end of a Unix socket pair, so
//! shared blob descriptors can travel in either direction. stderr is
//! captured line by line by [`ChildProcess`].

use std::os::fd::OwnedFd;
use std::process::Stdio;

use hydrogen_common::{ChildProcess, ProcessSpec};
use tokio::net::UnixStream;

use super::{DriverSpec, DriverTarget};
use crate::error::{Result, ServerError};
use crate::transport::socket_pair;

/// A freshly spawned driver and the broker's end of its socket.
pub(crate) struct Launched {
    pub child: ChildProcess,
    pub stream: UnixStream,
}

/// Builds the process description for a local driver.
pub(crate) fn process_spec(spec: &DriverSpec) -> Result<ProcessSpec> {
    let DriverTarget::Local {
        binary,
        args,
        device_name,
        skeleton,
        config,
    } = spec.target()
    else {
        return Err(ServerError::driver(spec.name(), "not a local driver"));
    };

    let mut process = ProcessSpec::new(spec.name(), binary);
    for arg in args {
        process = process.arg(arg);
    }
    if let Some(name) = device_name {
        process = process.env("INDIDEV", name);
    }
    if let Some(path) = skeleton {
        process = process.env("INDISKEL", path.display().to_string());
    }
    if let Some(path) = config {
        process = process.env("INDICONFIG", path.display().to_string());
    }
    Ok(process)
}

/// Spawns a local driver wired to a new socket pair.
pub(crate) fn launch(spec: &DriverSpec) -> Result<Launched> {
    let process = process_spec(spec)?;
    let (ours, theirs) = socket_pair()?;
    let theirs = OwnedFd::from(theirs);
    let stdin = Stdio::from(theirs.try_clone()?);
    let stdout = Stdio::from(theirs);

    let child = ChildProcess::spawn(&process, stdin, stdout)?;
    Ok(Launched {
        child,
        stream: ours,
    })
}
