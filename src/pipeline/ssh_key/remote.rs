//! Remote execution interface and the authorized_keys scripts
//!
//! The scripts run through `sh` on the managed host as the target user.
//! Installation is idempotent; removal writes a filtered copy and renames it
//! over the original so sshd never sees a half-written file.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

/// Opens sessions to managed hosts
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn open_session(&self, host: &str) -> Result<Box<dyn RemoteSession>>;
}

/// A session on one host
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn host(&self) -> &str;

    /// Run a shell command, optionally as `user`, returning stdout.
    async fn run(&self, command: &str, user: Option<&str>) -> Result<String>;

    async fn close(&self) -> Result<()>;
}

/// Quote a string for POSIX `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub(crate) const HOME_COMMAND: &str = r#"printf '%s' "$HOME""#;

/// Resolve the remote user's home directory.
pub(crate) async fn remote_home(session: &dyn RemoteSession, user: &str) -> Result<String> {
    let output = session
        .run(HOME_COMMAND, Some(user))
        .await
        .with_context(|| format!("Failed to resolve home directory of {user}"))?;

    let home = output.trim().trim_end_matches('/').to_string();
    if home.is_empty() || !home.starts_with('/') {
        bail!("Unexpected home directory for {user}: {output:?}");
    }
    Ok(home)
}

pub(crate) fn authorized_keys_path(home: &str) -> String {
    format!("{home}/.ssh/authorized_keys")
}

/// Ensure `~/.ssh/authorized_keys` exists and contains `public_key` once.
pub(crate) fn install_script(home: &str, public_key: &str) -> String {
    let ssh_dir = shell_quote(&format!("{home}/.ssh"));
    let keys = shell_quote(&authorized_keys_path(home));
    let key = shell_quote(public_key);

    format!(
        "set -e\n\
         umask 077\n\
         mkdir -p {ssh_dir}\n\
         chmod 700 {ssh_dir}\n\
         touch {keys}\n\
         chmod 600 {keys}\n\
         if ! grep -qxF -- {key} {keys}; then\n\
         \x20 if [ -s {keys} ] && [ -n \"$(tail -c 1 {keys})\" ]; then printf '\\n' >> {keys}; fi\n\
         \x20 printf '%s\\n' {key} >> {keys}\n\
         fi\n"
    )
}

/// Drop every line equal to `public_key` and atomically replace the file.
pub(crate) fn removal_script(authorized_keys: &str, public_key: &str) -> String {
    let keys = shell_quote(authorized_keys);
    let key = shell_quote(public_key);

    format!(
        "keys={keys}\n\
         [ -f \"$keys\" ] || exit 0\n\
         tmp=\"$keys.scan-runner.$$\"\n\
         grep -vxF -- {key} \"$keys\" > \"$tmp\"\n\
         status=$?\n\
         if [ \"$status\" -gt 1 ]; then rm -f \"$tmp\"; exit \"$status\"; fi\n\
         chmod 600 \"$tmp\"\n\
         mv -f \"$tmp\" \"$keys\"\n"
    )
}
