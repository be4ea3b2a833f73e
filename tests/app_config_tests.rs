#![allow(clippy::unwrap_used, missing_docs)]

use std::path::{Path, PathBuf};

use secret_fs::app_config::{Config, ConfigError};

#[test]
fn defaults() {
    let config = Config::default();

    assert_eq!(config.command, "custodia-cli");
    assert!(config.command_args.is_empty());
    assert_eq!(config.log_file, None);
    assert_eq!(config.umount_program, PathBuf::from("/usr/bin/umount"));
    assert_eq!(config.mount_options, vec!["allow_other"]);
    assert_eq!(config.fs_name, "secret-fs");
    assert_eq!(config.directories, vec!["/certs", "/certs/HTTP"]);
    assert_eq!(config.validate(), Ok(()));
}

#[test]
fn empty_file_yields_defaults() {
    assert_eq!(Config::from_toml("").unwrap(), Config::default());
}

#[test]
fn parses_kebab_case_keys() {
    let config = Config::from_toml(
        r#"
        command = "/usr/local/bin/vault-get"
        command-args = ["--server", "https://vault.internal"]
        log-file = "/var/log/secret-fs.log"
        umount-program = "/bin/umount"
        mount-options = ["allow_other", "default_permissions"]
        fs-name = "vault"
        directories = ["/tls"]
        "#,
    )
    .unwrap();

    assert_eq!(config.command, "/usr/local/bin/vault-get");
    assert_eq!(config.command_args, vec!["--server", "https://vault.internal"]);
    assert_eq!(config.log_file.as_deref(), Some(Path::new("/var/log/secret-fs.log")));
    assert_eq!(config.umount_program, PathBuf::from("/bin/umount"));
    assert_eq!(config.mount_options, vec!["allow_other", "default_permissions"]);
    assert_eq!(config.fs_name, "vault");
    assert_eq!(config.directories, vec!["/tls"]);
}

#[test]
fn partial_file_keeps_other_defaults() {
    let config = Config::from_toml(r#"command = "getsecret""#).unwrap();

    assert_eq!(config.command, "getsecret");
    assert_eq!(config.directories, Config::default().directories);
    assert_eq!(config.umount_program, Config::default().umount_program);
}

#[test]
fn unknown_keys_are_rejected() {
    let result = Config::from_toml(r#"comand = "typo""#);

    assert!(
        matches!(result, Err(ConfigError::DeserializationError(_))),
        "expected a deserialization error, got {result:?}"
    );
}

#[test]
fn validation_reports_every_problem() {
    let result = Config::from_toml(
        r#"
        command = "  "
        umount-program = ""
        directories = ["/", "relative", "/ok"]
        "#,
    );

    let Err(ConfigError::ValidationErrors(errors)) = result else {
        panic!("expected validation errors, got {result:?}");
    };
    assert_eq!(errors.len(), 4, "got {errors:?}");
    assert!(errors.iter().any(|e| e.contains("command")));
    assert!(errors.iter().any(|e| e.contains("umount-program")));
    assert!(errors.iter().any(|e| e.contains("'/'")));
    assert!(errors.iter().any(|e| e.contains("'relative'")));
}

#[test]
fn load_from_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("config.toml");
    std::fs::write(&path, "fs-name = \"from-file\"\n").unwrap();

    let config = Config::load_from_file(&path).unwrap();

    assert_eq!(config.fs_name, "from-file");
}

#[test]
fn load_from_missing_file_is_an_io_error() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("absent.toml");

    let result = Config::load_from_file(&path);

    assert!(
        matches!(result, Err(ConfigError::IoError { path: ref p, .. }) if p == &path),
        "expected an io error naming the file, got {result:?}"
    );
}

#[test]
fn session_command_carries_mount_options() {
    let config = Config::from_toml(r#"mount-options = ["allow_other", "ro"]"#).unwrap();

    let session = config.session_command("/usr/libexec/secret-fs");

    assert_eq!(session.program, "/usr/libexec/secret-fs");
    assert!(session.args.is_empty());
    assert_eq!(session.mount_options, vec!["allow_other", "ro"]);
}
