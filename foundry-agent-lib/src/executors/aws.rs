//! ECR login command construction.
//!
//! AWS CLI v1 and v2 expose different login commands, so the installed
//! version is probed first. The login command itself runs in the host
//! shell with the credentials passed as env vars.

use semver::Version;
use thiserror::Error;
use tokio::process::Command;
use tracing::error;

#[derive(Debug, Error)]
pub enum AwsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to determine AWS CLI version: {0}")]
    CliVersion(String),

    #[error("failed to determine AWS account ID: {0}")]
    AccountId(String),
}

/// Build the `docker login` command for ECR, matching the installed AWS
/// CLI version.
pub async fn ecr_login_cmd(envs: &[String]) -> Result<String, AwsError> {
    let cli_version = find_aws_cli_version().await?;

    if cli_version >= Version::new(2, 0, 0) {
        // get-login-password only prints the password, so the docker login
        // pipeline is assembled here, including the registry host, which
        // needs the account ID.
        let account_id = match account_id_from_vars(envs) {
            Some(account_id) => account_id,
            None => account_id_from_sts(envs).await?,
        };

        return Ok(format!(
            "aws ecr get-login-password --region $AWS_REGION | \
             docker login --username AWS --password-stdin \
             {account_id}.dkr.ecr.$AWS_REGION.amazonaws.com"
        ));
    }

    // CLI v1: get-login prints a full docker login command, which the
    // extra $() executes.
    match account_id_from_vars(envs) {
        None => Ok("$(aws ecr get-login --no-include-email --region $AWS_REGION)".to_string()),
        Some(account_id) => Ok(format!(
            "$(aws ecr get-login --no-include-email --region $AWS_REGION \
             --registry-ids {account_id})"
        )),
    }
}

fn account_id_from_vars(envs: &[String]) -> Option<String> {
    envs.iter().find_map(|var| {
        var.strip_prefix("AWS_ACCOUNT_ID=").map(|value| value.to_string())
    })
}

async fn account_id_from_sts(envs: &[String]) -> Result<String, AwsError> {
    let output = Command::new("bash")
        .arg("-c")
        .arg("aws sts get-caller-identity --query Account --output text")
        .envs(parse_env_pairs(envs))
        .output()
        .await?;

    if !output.status.success() {
        let combined = String::from_utf8_lossy(&output.stderr).into_owned();
        error!("Error finding AWS account ID: {}", combined);
        return Err(AwsError::AccountId(combined));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

async fn find_aws_cli_version() -> Result<Version, AwsError> {
    let output = Command::new("bash")
        .arg("-c")
        .arg("aws --version 2>&1 | awk -F'[/ ]' '{print $2}'")
        .output()
        .await?;

    let raw = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    parse_version(&raw).ok_or_else(|| {
        error!("Error parsing AWS CLI version from '{}'", raw);
        AwsError::CliVersion(raw)
    })
}

/// Parse a possibly short version string ("2.13" => 2.13.0).
fn parse_version(raw: &str) -> Option<Version> {
    if raw.is_empty() {
        return None;
    }

    let mut parts = raw.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts
        .next()
        .map(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "0".to_string())
        .parse()
        .ok()?;

    Some(Version::new(major, minor, patch))
}

pub(crate) fn parse_env_pairs(envs: &[String]) -> Vec<(String, String)> {
    envs.iter()
        .filter_map(|var| {
            var.split_once('=').map(|(name, value)| (name.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_is_read_from_env_vars() {
        let envs = vec!["AWS_REGION=us-east-1".to_string(), "AWS_ACCOUNT_ID=12345".to_string()];
        assert_eq!(account_id_from_vars(&envs), Some("12345".to_string()));

        let envs = vec!["AWS_REGION=us-east-1".to_string()];
        assert_eq!(account_id_from_vars(&envs), None);
    }

    #[test]
    fn short_versions_parse() {
        assert_eq!(parse_version("2.13"), Some(Version::new(2, 13, 0)));
        assert_eq!(parse_version("1.17.10"), Some(Version::new(1, 17, 10)));
        assert_eq!(parse_version("2.27.50dev1"), Some(Version::new(2, 27, 50)));
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("not-a-version"), None);
    }

    #[test]
    fn env_pairs_are_split_on_the_first_equals() {
        let pairs = parse_env_pairs(&["A=1".to_string(), "B=x=y".to_string()]);
        assert_eq!(
            pairs,
            vec![("A".to_string(), "1".to_string()), ("B".to_string(), "x=y".to_string())]
        );
    }
}
