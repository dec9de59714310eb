//! A `VmLauncher` that shells out to an external launch command.
//!
//! §1 scopes low-level hypervisor launch out of the core: "assumed to
//! provide a socket path per worker". This is the thin adapter that
//! satisfies that assumption for a runnable binary — the actual VM/agent
//! supervision is somebody else's script, invoked with the worker id and the
//! socket path it must listen on.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use orca_core::WorkerId;

/// Spawns `launch_cmd <id> <socket_path>` detached and returns the socket
/// path immediately, matching `VmLauncher::launch`'s "must return promptly"
/// contract — the agent-connect loop in `orca-core` does the waiting for the
/// agent to actually come up on that path.
pub struct ScriptVmLauncher {
    launch_cmd: PathBuf,
    terminate_cmd: Option<PathBuf>,
    socket_dir: PathBuf,
}

impl ScriptVmLauncher {
    pub fn new(launch_cmd: PathBuf, terminate_cmd: Option<PathBuf>, socket_dir: PathBuf) -> Self {
        Self { launch_cmd, terminate_cmd, socket_dir }
    }

    fn socket_path(&self, id: WorkerId) -> PathBuf {
        self.socket_dir.join(format!("{id}.sock"))
    }
}

impl orca_core::VmLauncher for ScriptVmLauncher {
    fn launch(&self, id: WorkerId) -> std::io::Result<PathBuf> {
        let socket_path = self.socket_path(id);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Command::new(&self.launch_cmd)
            .arg(id.to_string())
            .arg(&socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(socket_path)
    }

    fn terminate(&self, id: WorkerId) {
        let Some(cmd) = &self.terminate_cmd else { return };
        let _ = Command::new(cmd)
            .arg(id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
    }
}
