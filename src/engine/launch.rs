//! Building the agent command line.

use std::process::Stdio;
use tokio::process::Command;

use crate::config::SupervisorConfig;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Environment overrides so the agent doesn't assume a color TTY.
const ENV_OVERRIDES: &[(&str, &str)] = &[("NO_COLOR", "1"), ("FORCE_COLOR", "0"), ("TERM", "dumb")];

/// Variables that make the agent think it is nested inside another session.
const ENV_REMOVED: &[&str] = &["CLAUDECODE"];

/// Arguments after the executable, in launch order.
pub fn launch_args(config: &SupervisorConfig) -> Vec<String> {
    let mut args = config.executable_args.clone();
    args.extend(
        [
            "-p",
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--model",
        ]
        .map(String::from),
    );
    args.push(config.model.clone());

    if let Some(fallback) = &config.fallback_model {
        args.push("--fallback-model".to_string());
        args.push(fallback.clone());
    }
    if let Some(budget) = config.max_budget_usd {
        args.push("--max-budget-usd".to_string());
        args.push(budget.to_string());
    }
    if let Some(prompt) = &config.append_system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.clone());
    }
    if let Some(mode) = &config.permission_mode {
        args.push("--permission-mode".to_string());
        args.push(mode.clone());
    }
    if config.include_partial_messages {
        args.push("--include-partial-messages".to_string());
    }
    match config.allowed_tools.as_deref() {
        None => {}
        Some([]) => {
            args.push("--tools".to_string());
            args.push(String::new());
        }
        Some(tools) => {
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }
    }
    for dir in &config.add_dirs {
        args.push("--add-dir".to_string());
        args.push(dir.to_string_lossy().into_owned());
    }
    args.extend(config.extra_args.iter().cloned());
    args
}

/// Fully configured command with piped stdio.
pub fn build_command(config: &SupervisorConfig) -> Command {
    let mut cmd = Command::new(&config.executable);
    cmd.args(launch_args(config))
        .current_dir(&config.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in ENV_OVERRIDES {
        cmd.env(key, value);
    }
    for key in ENV_REMOVED {
        cmd.env_remove(key);
    }

    // On Windows, hide the console window
    #[cfg(target_os = "windows")]
    cmd.creation_flags(CREATE_NO_WINDOW);

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn default_launch_uses_stream_json() {
        let args = launch_args(&SupervisorConfig::default());
        assert_eq!(args[0], "-p");
        assert_eq!(flag_value(&args, "--input-format"), Some("stream-json"));
        assert_eq!(flag_value(&args, "--output-format"), Some("stream-json"));
        assert_eq!(flag_value(&args, "--model"), Some("sonnet"));
        assert!(args.contains(&"--verbose".to_string()));
        assert!(!args.contains(&"--tools".to_string()));
        assert!(!args.contains(&"--allowedTools".to_string()));
    }

    #[test]
    fn empty_tool_list_disables_tools() {
        let config = SupervisorConfig {
            allowed_tools: Some(vec![]),
            ..Default::default()
        };
        let args = launch_args(&config);
        assert_eq!(flag_value(&args, "--tools"), Some(""));
        assert!(!args.contains(&"--allowedTools".to_string()));
    }

    #[test]
    fn tool_list_is_comma_joined() {
        let config = SupervisorConfig {
            allowed_tools: Some(vec!["Read".into(), "Grep".into(), "Bash(git:*)".into()]),
            ..Default::default()
        };
        let args = launch_args(&config);
        assert_eq!(flag_value(&args, "--allowedTools"), Some("Read,Grep,Bash(git:*)"));
    }

    #[test]
    fn optional_flags_and_extra_dirs() {
        let config = SupervisorConfig {
            executable_args: vec!["cli.js".into()],
            fallback_model: Some("haiku".into()),
            max_budget_usd: Some(1.5),
            append_system_prompt: Some("Be brief.".into()),
            add_dirs: vec![PathBuf::from("/srv/a"), PathBuf::from("/srv/b")],
            extra_args: vec!["--debug".into()],
            ..Default::default()
        };
        let args = launch_args(&config);
        assert_eq!(args[0], "cli.js");
        assert_eq!(flag_value(&args, "--fallback-model"), Some("haiku"));
        assert_eq!(flag_value(&args, "--max-budget-usd"), Some("1.5"));
        assert_eq!(flag_value(&args, "--append-system-prompt"), Some("Be brief."));
        let dirs: Vec<_> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "--add-dir")
            .map(|(i, _)| args[i + 1].as_str())
            .collect();
        assert_eq!(dirs, vec!["/srv/a", "/srv/b"]);
        assert_eq!(args.last().map(String::as_str), Some("--debug"));
    }
}
