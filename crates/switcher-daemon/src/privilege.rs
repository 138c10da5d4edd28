use tokio::process::Command;

use crate::error::PrivilegeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivilegeStatus {
    Granted,
    Denied,
    Unknown(String),
}

/// Check that the current user belongs to `required_group`.
///
/// No group (or an empty one) means nothing to check.  A failed query is
/// reported as `Unknown` rather than an error so startup can continue.
pub async fn check(required_group: Option<&str>) -> PrivilegeStatus {
    let group = match required_group.map(str::trim) {
        Some(g) if !g.is_empty() => g,
        _ => return PrivilegeStatus::Granted,
    };

    match current_groups().await {
        Ok(groups) if groups.iter().any(|g| g == group) => PrivilegeStatus::Granted,
        Ok(_) => PrivilegeStatus::Denied,
        Err(e) => PrivilegeStatus::Unknown(e.to_string()),
    }
}

async fn current_groups() -> Result<Vec<String>, PrivilegeError> {
    let output = Command::new("id").arg("-Gn").output().await?;
    if !output.status.success() {
        return Err(PrivilegeError::Status(output.status.to_string()));
    }
    Ok(parse_groups(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_groups(output: &str) -> Vec<String> {
    output.split_whitespace().map(str::to_string).collect()
}
