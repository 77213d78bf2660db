use auto_config::config::{ConfigError, Settings};
use auto_config::runtime::InteractiveMode;
use serial_test::serial;

mod util;
use util::{EnvGuard, write_tree};

#[test]
#[serial]
fn environment_overrides_file() {
    let work = write_tree(&[("config.toml", b"workers = 8\ninteractive = \"on\"\n")]);
    let _workers = EnvGuard::set("AUTOCONFIG_WORKERS", "3");
    let _interactive = EnvGuard::set("AUTOCONFIG_INTERACTIVE", "off");

    let settings = Settings::load(Some(&work.path().join("config.toml"))).unwrap();
    assert_eq!(settings.workers, 3);
    assert_eq!(settings.interactive, InteractiveMode::Off);
}

#[test]
#[serial]
fn blank_environment_values_are_ignored() {
    let work = write_tree(&[("config.toml", b"workers = 8\n")]);
    let _workers = EnvGuard::set("AUTOCONFIG_WORKERS", "  ");

    let settings = Settings::load(Some(&work.path().join("config.toml"))).unwrap();
    assert_eq!(settings.workers, 8);
}

#[test]
#[serial]
fn invalid_environment_value_is_reported() {
    let work = write_tree(&[("config.toml", b"")]);
    let _timeout = EnvGuard::set("AUTOCONFIG_HTTP_TIMEOUT_SECS", "soon");

    let err = Settings::load(Some(&work.path().join("config.toml"))).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InvalidEnv {
            name: "AUTOCONFIG_HTTP_TIMEOUT_SECS",
            ..
        }
    ));
}
