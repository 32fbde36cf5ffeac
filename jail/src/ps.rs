//! Jail-wide process enumeration via `ps --libxo json -x -J <jail>`: unlike
//! a bare `kill(pid, 0)` on a single recorded pid, this sees every process
//! visible inside the jail, including ones re-parented after the original
//! pid exited.

use std::process::Command;

use anyhow::Error;
use serde::Deserialize;

#[derive(Deserialize)]
struct PsOutput {
    #[serde(rename = "process-information")]
    process_information: Option<ProcessInformation>,
}

#[derive(Deserialize)]
struct ProcessInformation {
    process: Option<Vec<serde_json::Value>>,
}

/// True if at least one process is currently visible inside jail `name`.
/// `ps` exits with status 1 when the jail has none, which is a valid
/// "not running" result rather than a failure.
#[fehler::throws]
pub fn is_running(name: &str) -> bool {
    let output = Command::new("ps").args(["--libxo", "json", "-x", "-J", name]).output()?;

    if output.status.code() == Some(1) {
        false
    } else if !output.status.success() {
        fehler::throw!(anyhow::anyhow!(
            "ps -J {} failed: {}",
            name,
            String::from_utf8_lossy(&output.stderr)
        ));
    } else {
        let parsed: PsOutput = serde_json::from_slice(&output.stdout)?;
        parsed
            .process_information
            .and_then(|info| info.process)
            .map(|processes| processes.len())
            .unwrap_or(0)
            > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_nonempty_process_list() {
        let json = r#"{"process-information":{"process":[{"pid":"123"},{"pid":"456"}]}}"#;
        let parsed: PsOutput = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.process_information.unwrap().process.unwrap().len(), 2);
    }

    #[test]
    fn test_parses_empty_process_list_as_not_running() {
        let json = r#"{"process-information":{"process":[]}}"#;
        let parsed: PsOutput = serde_json::from_str(json).unwrap();
        assert!(parsed.process_information.unwrap().process.unwrap().is_empty());
    }

    #[test]
    fn test_parses_missing_process_information() {
        let json = r#"{"process-information":null}"#;
        let parsed: PsOutput = serde_json::from_str(json).unwrap();
        assert!(parsed.process_information.is_none());
    }
}
