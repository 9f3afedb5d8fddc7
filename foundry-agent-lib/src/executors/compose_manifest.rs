//! Generation of the docker-compose manifest for a job's composition.
//!
//! The manifest is plain text, built the same way a user would write it.
//! The first container is the "main" one: it gets links to every other
//! container, the bind mounts for injected files, and the KVM device when
//! the agent exposes it.

use std::path::Path;

use crate::api::Compose;
use crate::executors::FileInjection;

pub fn construct_compose_manifest(
    compose: &Compose,
    expose_kvm_device: bool,
    file_injections: &[FileInjection],
    tmp_directory: &Path,
) -> String {
    let mut manifest = String::new();

    manifest.push_str("version: \"2.0\"\n");
    manifest.push_str("\n");
    manifest.push_str("services:\n");

    for (index, container) in compose.containers.iter().enumerate() {
        let main = index == 0;

        manifest.push_str(&format!("  {}:\n", container.name));
        manifest.push_str(&format!("    image: \"{}\"\n", container.image));

        if !container.command.is_empty() {
            manifest.push_str(&format!("    command: \"{}\"\n", container.command));
        }

        if !container.env_vars.is_empty() {
            manifest.push_str("    environment:\n");
            for var in &container.env_vars {
                let value = match var.decode() {
                    Ok(value) => String::from_utf8_lossy(&value).into_owned(),
                    Err(_) => continue,
                };
                manifest.push_str(&format!("      - {}={}\n", var.name, value));
            }
        }

        if main {
            if compose.containers.len() > 1 {
                manifest.push_str("    links:\n");
                for linked in &compose.containers[1..] {
                    manifest.push_str(&format!("      - {}\n", linked.name));
                }
            }

            let mut volumes: Vec<String> = file_injections
                .iter()
                .map(|injection| {
                    format!("{}:{}:ro", injection.host_path, injection.destination)
                })
                .collect();
            volumes.push(format!(
                "{}:{}:ro",
                tmp_directory.display(),
                tmp_directory.display()
            ));

            manifest.push_str("    volumes:\n");
            for volume in volumes {
                manifest.push_str(&format!("      - {volume}\n"));
            }

            if expose_kvm_device {
                manifest.push_str("    devices:\n");
                manifest.push_str("      - /dev/kvm:/dev/kvm\n");
            }
        }
    }

    manifest
}
