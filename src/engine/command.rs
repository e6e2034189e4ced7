//! Engine command construction
//!
//! Builds the child-process invocations for running, validating, and
//! version-probing the engine binary. The run command inherits the parent
//! environment plus the three path variables and a default JVM heap
//! selection, with the binary's directory as working directory.

use crate::config::EngineSection;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Default heap selection applied when the operator has not set one
const DEFAULT_JAVA_OPTS: &str = "-Xms512m -Xmx1g";

/// Build the long-running engine command
pub fn build_run_command(settings: &EngineSection) -> Command {
    let mut command = Command::new(&settings.binary_path);
    command
        .arg("--path.config")
        .arg(&settings.config_dir)
        .arg("--path.data")
        .arg(&settings.data_dir)
        .arg("--path.logs")
        .arg(&settings.log_dir);

    if let Some(workers) = settings.workers {
        command.arg("--pipeline.workers").arg(workers.to_string());
    }
    if let Some(batch_size) = settings.batch_size {
        command
            .arg("--pipeline.batch.size")
            .arg(batch_size.to_string());
    }
    if settings.auto_reload {
        command
            .arg("--config.reload.automatic")
            .arg("--config.reload.interval")
            .arg("3s");
    }

    command
        .env("LS_PATH_CONF", &settings.config_dir)
        .env("LS_PATH_DATA", &settings.data_dir)
        .env("LS_PATH_LOGS", &settings.log_dir);
    if std::env::var_os("LS_JAVA_OPTS").is_none() {
        command.env("LS_JAVA_OPTS", DEFAULT_JAVA_OPTS);
    }

    if let Some(parent) = settings.binary_path.parent() {
        if !parent.as_os_str().is_empty() {
            command.current_dir(parent);
        }
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// Build the one-shot validation command for a config path
pub fn build_validate_command(binary_path: &Path, config_path: &Path) -> Command {
    let mut command = Command::new(binary_path);
    command
        .arg("--config.test_and_exit")
        .arg("--path.config")
        .arg(config_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

/// Build the version-probe command
pub fn build_version_command(binary_path: &Path) -> Command {
    let mut command = Command::new(binary_path);
    command
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

/// Extract the version token from `--version` output
///
/// The engine prints `<name> <version> [...]`; the second whitespace
/// separated token is the version.
pub fn parse_version_output(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .nth(1)
        .map(|token| token.to_string())
}

/// Validation succeeds iff the process exited zero and the combined
/// output carries no error marker
pub fn validation_ok(exit_ok: bool, combined_output: &str) -> bool {
    exit_ok && !combined_output.contains("ERROR") && !combined_output.contains("error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::path::PathBuf;

    fn settings() -> EngineSection {
        EngineSection {
            binary_path: PathBuf::from("/opt/engine/bin/engine"),
            config_dir: PathBuf::from("/etc/engine/conf.d"),
            data_dir: PathBuf::from("/var/lib/engine"),
            log_dir: PathBuf::from("/var/log/engine"),
            workers: None,
            batch_size: None,
            auto_reload: false,
            startup_grace_secs: 5,
            startup_timeout_secs: 60,
        }
    }

    fn args_of(command: &Command) -> Vec<String> {
        command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_run_command_positional_flags() {
        let command = build_run_command(&settings());
        let args = args_of(&command);
        assert_eq!(
            args,
            vec![
                "--path.config",
                "/etc/engine/conf.d",
                "--path.data",
                "/var/lib/engine",
                "--path.logs",
                "/var/log/engine",
            ]
        );
    }

    #[test]
    fn test_run_command_optional_tuning_flags() {
        let mut section = settings();
        section.workers = Some(4);
        section.batch_size = Some(250);
        let args = args_of(&build_run_command(&section));
        assert!(args.windows(2).any(|w| w == ["--pipeline.workers", "4"]));
        assert!(args.windows(2).any(|w| w == ["--pipeline.batch.size", "250"]));
    }

    #[test]
    fn test_run_command_auto_reload_flags() {
        let mut section = settings();
        section.auto_reload = true;
        let args = args_of(&build_run_command(&section));
        assert!(args.contains(&"--config.reload.automatic".to_string()));
        assert!(args
            .windows(2)
            .any(|w| w == ["--config.reload.interval", "3s"]));
    }

    #[test]
    fn test_run_command_working_directory_is_binary_dir() {
        let command = build_run_command(&settings());
        assert_eq!(
            command.as_std().get_current_dir(),
            Some(Path::new("/opt/engine/bin"))
        );
    }

    #[test]
    fn test_run_command_exports_path_variables() {
        let command = build_run_command(&settings());
        let envs: Vec<(&OsStr, Option<&OsStr>)> = command.as_std().get_envs().collect();
        assert!(envs
            .iter()
            .any(|(k, v)| *k == "LS_PATH_CONF" && *v == Some(OsStr::new("/etc/engine/conf.d"))));
        assert!(envs.iter().any(|(k, _)| *k == "LS_PATH_DATA"));
        assert!(envs.iter().any(|(k, _)| *k == "LS_PATH_LOGS"));
    }

    #[test]
    fn test_validate_command_shape() {
        let command =
            build_validate_command(Path::new("/opt/engine/bin/engine"), Path::new("/tmp/c.conf"));
        let args = args_of(&command);
        assert_eq!(
            args,
            vec!["--config.test_and_exit", "--path.config", "/tmp/c.conf"]
        );
    }

    #[test]
    fn test_parse_version_output() {
        assert_eq!(
            parse_version_output("logstash 8.12.2\n"),
            Some("8.12.2".to_string())
        );
        assert_eq!(
            parse_version_output("engine 1.0.0 (build abc)"),
            Some("1.0.0".to_string())
        );
        assert_eq!(parse_version_output("loneword"), None);
        assert_eq!(parse_version_output(""), None);
    }

    #[test]
    fn test_validation_ok_rules() {
        assert!(validation_ok(true, "Configuration OK"));
        assert!(!validation_ok(false, "Configuration OK"));
        assert!(!validation_ok(true, "ERROR something broke"));
        assert!(!validation_ok(true, "an error occurred"));
    }
}
