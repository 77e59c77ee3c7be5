//! End-to-end tests driving the tunneld binary


use std::fs;
use std::process::Command;
use test_utils::*;

fn tunneld() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tunneld"))
}

#[test]
fn test_render_prints_config() {
    let output = tunneld()
        .args([
            "render",
            "t1",
            "--remote-addr",
            "panel.example.com:23333",
            "--token",
            "secret",
            "--proxy-port",
            "8989",
        ])
        .output()
        .expect("Failed to run tunneld");

    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "[server]\nbind_addr = \"0.0.0.0:23333\"\ntoken = \"secret\"\n\n[server.services.t1]\nbind_addr = \"0.0.0.0:8989\"\n"
    );
}

#[test]
fn test_render_escapes_token() {
    let output = tunneld()
        .args(["render", "t1", "-r", "h:1", "-t", "a\"b", "-p", "2"])
        .output()
        .expect("Failed to run tunneld");

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("token = \"a\\\"b\"\n"));
}

#[test]
fn test_render_rejects_bad_address() {
    let output = tunneld()
        .args(["render", "t1", "-r", "badaddr", "-t", "secret", "-p", "8989"])
        .output()
        .expect("Failed to run tunneld");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("remote_addr"));
}

#[test]
fn test_check_reports_invalid_tunnels() {
    let dir = temp_dir();
    let settings = dir.path().join("tunneld.toml");
    fs::write(
        &settings,
        r#"
[[tunnels]]
id = "good"
remote_addr = "0.0.0.0:23333"
token = "secret"
proxy_port = 8989

[[tunnels]]
id = "bad"
remote_addr = "nocolon"
token = "secret"
proxy_port = 8990
"#,
    )
    .unwrap();

    let output = tunneld()
        .args(["--config"])
        .arg(&settings)
        .arg("check")
        .output()
        .expect("Failed to run tunneld");

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("✓ good"));
    assert!(stdout.contains("✗ bad"));
}

#[test]
fn test_check_reports_duplicate_ids() {
    let dir = temp_dir();
    let settings = dir.path().join("tunneld.toml");
    fs::write(
        &settings,
        r#"
[[tunnels]]
id = "t1"
remote_addr = "0.0.0.0:23333"
token = "secret"
proxy_port = 8989

[[tunnels]]
id = "t1"
remote_addr = "0.0.0.0:23334"
token = "secret"
proxy_port = 8990
"#,
    )
    .unwrap();

    let output = tunneld()
        .arg("--config")
        .arg(&settings)
        .arg("check")
        .output()
        .expect("Failed to run tunneld");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("✗ t1: duplicate tunnel id"));

    let output = tunneld()
        .arg("--config")
        .arg(&settings)
        .arg("--config-dir")
        .arg(dir.path().join("configs"))
        .arg("run")
        .output()
        .expect("Failed to run tunneld");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Duplicate tunnel id(s): t1"));
}

#[test]
fn test_run_without_tunnels_fails() {
    let dir = temp_dir();
    let output = tunneld()
        .args(["--config-dir"])
        .arg(dir.path())
        .arg("run")
        .output()
        .expect("Failed to run tunneld");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No [[tunnels]]"));
}

#[cfg(unix)]
#[test]
fn test_run_fails_when_no_tunnel_starts() {
    let dir = temp_dir();
    let exe = failing_rathole(dir.path());
    let configs = dir.path().join("configs");
    let settings = dir.path().join("tunneld.toml");
    fs::write(
        &settings,
        r#"
startup_grace_ms = 200

[[tunnels]]
id = "t1"
remote_addr = "0.0.0.0:23333"
token = "secret"
proxy_port = 8989
"#,
    )
    .unwrap();

    let output = tunneld()
        .arg("--config")
        .arg(&settings)
        .arg("--config-dir")
        .arg(&configs)
        .arg("--executable")
        .arg(&exe)
        .arg("run")
        .output()
        .expect("Failed to run tunneld");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No tunnel could be started"));
    assert_eq!(fs::read_dir(&configs).unwrap().count(), 0);
}
