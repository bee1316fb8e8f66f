//! Launch specification construction.
//!
//! Argument ordering is a contract with the server process and downstream
//! mods, not an implementation detail: session flags first, then network and
//! authentication, then hibernation and SourceTV, then user extras, and the
//! map selection flag last so every preceding console variable is in effect
//! before the map loads.

use std::path::PathBuf;

use crate::config::InstanceConfig;
use crate::error::Result;
use crate::paths::Layout;
use crate::validation::validate_map_name;

/// Replacement for secret values in any logged or buffered output.
const REDACTED: &str = "****";

/// Flags whose following argument is always a secret.
const SENSITIVE_FLAGS: [&str; 3] = ["+sv_password", "+rcon_password", "+sv_setsteamaccount"];

/// Resolved, immutable launch tuple. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

impl LaunchSpec {
    /// Command line with secrets masked, safe for logs.
    pub fn display_redacted(&self, secrets: &[String]) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(redact_args(&self.args, secrets));
        parts.join(" ")
    }
}

/// Build the launch specification for one spawn attempt. `port` must already
/// be resolved (a configured port or a picked free one).
pub fn build_launch_spec(
    layout: &Layout,
    instance_id: &str,
    config: &InstanceConfig,
    port: u16,
) -> Result<LaunchSpec> {
    let instance_dir = layout.instance_dir(instance_id);
    let binary = layout.instance_binary_path(instance_id);

    let mut args: Vec<String> = Vec::new();

    // Engine/session flags.
    args.push("-game".to_string());
    args.push(layout.game_dir_name().to_string());
    args.push("-console".to_string());
    args.push("-norestart".to_string());
    args.push("-maxplayers_override".to_string());
    args.push(normalize_max_players(config.max_players).to_string());
    args.push("-tickrate".to_string());
    args.push(normalize_tick_rate(config.tick_rate).to_string());
    if config.insecure {
        args.push("-insecure".to_string());
    }

    // Network and authentication flags.
    args.push("-ip".to_string());
    args.push("0.0.0.0".to_string());
    args.push("-port".to_string());
    args.push(port.to_string());
    if let Some(token) = non_empty(&config.gslt_token) {
        args.push("+sv_setsteamaccount".to_string());
        args.push(token);
    }
    args.push("+hostname".to_string());
    args.push(config.name.clone());
    if let Some(password) = non_empty(&config.sv_password) {
        args.push("+sv_password".to_string());
        args.push(password);
    }
    if let Some(password) = non_empty(&config.rcon_password) {
        args.push("+rcon_password".to_string());
        args.push(password);
    }

    // Hibernation and spectator-stream flags.
    args.push("+sv_hibernate_when_empty".to_string());
    args.push(if config.hibernate_when_empty { "1" } else { "0" }.to_string());
    if config.sourcetv {
        args.push("+tv_enable".to_string());
        args.push("1".to_string());
        args.push("+tv_port".to_string());
        // Conventional offset from the game port, saturated so a port near
        // the top of the range cannot wrap into the privileged range.
        let tv_port = config.tv_port.unwrap_or_else(|| port.saturating_add(5));
        args.push(tv_port.to_string());
    }

    // User-supplied extras, verbatim.
    args.extend(config.extra_args.iter().cloned());

    // Map selection stays last so all preceding cvars apply before map load.
    if let Some(workshop_id) = non_empty(&config.workshop_map) {
        validate_map_name(&workshop_id)?;
        args.push("+host_workshop_map".to_string());
        args.push(workshop_id);
    } else {
        validate_map_name(&config.map)?;
        args.push("+map".to_string());
        args.push(config.map.clone());
    }

    let (program, args) = apply_resource_ceilings(binary, args, config);

    let lib_path = format!(
        "{}:{}",
        instance_dir.display(),
        instance_dir.join("bin").display()
    );

    Ok(LaunchSpec {
        program,
        args,
        env: vec![("LD_LIBRARY_PATH".to_string(), lib_path)],
        cwd: instance_dir,
    })
}

/// Wrap the command with `nice` and `prlimit` prefixes when ceilings are
/// configured. Wrappers take the command as an argument vector; no value
/// ever passes through a shell.
fn apply_resource_ceilings(
    binary: PathBuf,
    args: Vec<String>,
    config: &InstanceConfig,
) -> (PathBuf, Vec<String>) {
    let mut program = binary;
    let mut args = args;

    if let Some(priority) = normalize_priority(config.cpu_priority) {
        let mut wrapped = vec![
            "-n".to_string(),
            priority.to_string(),
            "--".to_string(),
            program.display().to_string(),
        ];
        wrapped.append(&mut args);
        program = PathBuf::from("nice");
        args = wrapped;
    }

    if let Some(bytes) = normalize_memory_limit(config.memory_limit_mb) {
        let mut wrapped = vec![
            format!("--as={}", bytes),
            "--".to_string(),
            program.display().to_string(),
        ];
        wrapped.append(&mut args);
        program = PathBuf::from("prlimit");
        args = wrapped;
    }

    (program, args)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|s| !s.is_empty()).map(String::from)
}

fn normalize_max_players(value: u32) -> u32 {
    value.clamp(1, 64)
}

fn normalize_tick_rate(value: u32) -> u32 {
    value.clamp(16, 128)
}

/// Missing or non-finite values mean "no adjustment".
fn normalize_priority(value: Option<f64>) -> Option<i32> {
    let value = value?;
    if !value.is_finite() {
        return None;
    }
    Some((value as i32).clamp(-20, 19))
}

/// Missing, non-finite or non-positive values mean "no limit".
fn normalize_memory_limit(value: Option<f64>) -> Option<u64> {
    let value = value?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    Some((value * 1024.0 * 1024.0) as u64)
}

/// Mask secrets in an argument vector: the value after any known-sensitive
/// flag, and independently any argument equal to a known secret, so a secret
/// cannot leak even when the flag-based match misses it.
pub fn redact_args(args: &[String], secrets: &[String]) -> Vec<String> {
    let mut redacted = Vec::with_capacity(args.len());
    let mut mask_next = false;

    for arg in args {
        if mask_next {
            redacted.push(REDACTED.to_string());
            mask_next = false;
            continue;
        }
        if SENSITIVE_FLAGS.contains(&arg.as_str()) {
            redacted.push(arg.clone());
            mask_next = true;
            continue;
        }
        if secrets.iter().any(|s| s == arg) {
            redacted.push(REDACTED.to_string());
        } else {
            redacted.push(arg.clone());
        }
    }
    redacted
}

/// Mask secret substrings in a captured output line.
pub fn redact_line(line: &str, secrets: &[String]) -> String {
    let mut result = line.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            result = result.replace(secret.as_str(), REDACTED);
        }
    }
    result
}
