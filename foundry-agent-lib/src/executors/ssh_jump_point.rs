//! SSH debugging support for the compose executor.
//!
//! A jump-point script on the host forwards an SSH session into the main
//! container, and the job's public keys are appended to the current
//! user's authorized_keys.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

pub fn jump_point_path() -> PathBuf {
    std::env::temp_dir().join("ssh_jump_point")
}

pub fn set_up_ssh_jump_point(script: &str) -> std::io::Result<()> {
    let path = jump_point_path();
    std::fs::write(&path, script)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// The script waits for the main container to come up, then either opens
/// an interactive login shell in it or runs the forwarded command.
pub fn jump_point_script(main_container_name: &str) -> String {
    [
        "#!/bin/bash",
        "",
        "cd /tmp",
        "",
        "echo -n \"Waiting for the container to start up\"",
        "",
        "while true; do",
        &format!("  docker exec -i {main_container_name} true 2>/dev/null"),
        "",
        "  if [ $? == 0 ]; then",
        "    echo \"\"",
        "",
        "    break",
        "  else",
        "    sleep 3",
        "    echo -n \".\"",
        "  fi",
        "done",
        "",
        "if [ $# -eq 0 ]; then",
        &format!("  docker exec -ti {main_container_name} bash --login"),
        "else",
        &format!("  docker exec -i {main_container_name} \"$@\""),
        "fi",
    ]
    .join("\n")
}

/// Append the job's base64-encoded public keys to authorized_keys.
pub fn inject_entries_to_authorized_keys(keys: &[String]) -> std::io::Result<()> {
    if keys.is_empty() {
        return Ok(());
    }

    let home = std::env::var("HOME").map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "HOME is not set")
    })?;

    let ssh_dir = PathBuf::from(home).join(".ssh");
    std::fs::create_dir_all(&ssh_dir)?;
    std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700))?;

    let authorized_keys = ssh_dir.join("authorized_keys");
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&authorized_keys)?;

    for key in keys {
        let decoded = BASE64.decode(key).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("public key is not valid base64: {err}"),
            )
        })?;

        file.write_all(&decoded)?;
        file.write_all(b"\n")?;
    }

    std::fs::set_permissions(&authorized_keys, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
