//! Small process-related helpers shared across the workspace.

use std::ffi::OsStr;

mod tail;

pub use tail::TailBuffer;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for a supervised external tool.
///
/// The child gets a null stdin unless the caller overrides it, and is killed
/// if the owning `Child` is dropped before it has been reaped.
#[cfg(feature = "tokio")]
pub fn tokio_command<I, S>(program: impl AsRef<OsStr>, base_args: I) -> tokio::process::Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(base_args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);
    cmd.no_window();
    cmd
}
