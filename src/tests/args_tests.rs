//! Command-line parsing.

use crate::{parse_args, Args};
use std::path::PathBuf;

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn no_arguments_means_hardware_with_default_config() {
    assert_eq!(parse_args(args(&[])).unwrap(), Args::default());
}

#[test]
fn simulate_with_explicit_config() {
    let parsed = parse_args(args(&["--config", "/etc/kiosk.toml", "--simulate"])).unwrap();
    assert!(parsed.simulate);
    assert_eq!(parsed.config, Some(PathBuf::from("/etc/kiosk.toml")));
}

#[test]
fn config_flag_needs_a_path() {
    assert!(parse_args(args(&["--config"])).is_err());
}

#[test]
fn unknown_flags_are_rejected() {
    assert!(parse_args(args(&["--stdout"])).is_err());
}
