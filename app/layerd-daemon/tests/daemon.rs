//! End-to-end tests driving the `layerd` binary.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

struct Paths {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    root: PathBuf,
    config: PathBuf,
}

fn paths() -> Paths {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(&config, "[snapshotter]\nsync_remove = true\n").unwrap();
    Paths {
        socket: dir.path().join("run").join("layerd.sock"),
        root: dir.path().join("root"),
        config,
        _dir: dir,
    }
}

fn layerd(paths: &Paths) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_layerd"));
    for var in [
        "LAYERD_ADDRESS",
        "LAYERD_CONFIG",
        "LAYERD_LOG_LEVEL",
        "LAYERD_LOG_FORMAT",
        "LAYERD_ROOT",
    ] {
        cmd.env_remove(var);
    }
    cmd.arg("--address")
        .arg(&paths.socket)
        .arg("--root")
        .arg(&paths.root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

fn wait_for(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn wait_with_timeout(mut child: Child, timeout: Duration) -> Output {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if child.try_wait().unwrap().is_some() {
            return child.wait_with_output().unwrap();
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    let _ = child.kill();
    panic!("layerd did not exit within {timeout:?}");
}

#[test]
fn version_prints_one_line_and_starts_nothing() {
    let paths = paths();
    let out = layerd(&paths).arg("--version").output().unwrap();

    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).unwrap();
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 1, "{stdout:?}");
    let tokens: Vec<&str> = lines[0].split_whitespace().collect();
    assert_eq!(tokens.len(), 3, "{stdout:?}");
    assert_eq!(tokens[0], "layerd");
    assert_eq!(tokens[1], env!("CARGO_PKG_VERSION"));

    assert!(!paths.socket.exists());
    assert!(!paths.root.exists());
}

#[test]
fn invalid_log_level_is_fatal() {
    let paths = paths();
    let out = layerd(&paths)
        .args(["--log-level", "verbose"])
        .output()
        .unwrap();

    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("prepare_logger"), "{stderr}");
    assert!(!paths.socket.exists());
    assert!(!paths.root.exists());
}

#[test]
fn missing_explicit_config_fails_before_socket_exists() {
    let paths = paths();
    let out = layerd(&paths)
        .args(["--config", "/no/such/file"])
        .output()
        .unwrap();

    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("load_config"), "{stderr}");
    assert!(stderr.contains("fatal"), "{stderr}");
    assert!(!paths.socket.exists());
    assert!(!paths.socket.parent().unwrap().exists());
}

#[test]
fn fatal_level_shows_only_the_fatal_record() {
    let paths = paths();
    let out = layerd(&paths)
        .args(["--log-level", "fatal", "--config", "/no/such/file"])
        .output()
        .unwrap();

    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("load_config"), "{stderr}");
    assert!(!stderr.contains("layerd starting"), "{stderr}");
    assert_eq!(stderr.lines().count(), 1, "{stderr}");
}

#[test]
fn serves_until_interrupted() {
    let paths = paths();
    // Leftover from an unclean exit.
    std::fs::create_dir_all(paths.socket.parent().unwrap()).unwrap();
    std::fs::write(&paths.socket, b"stale").unwrap();

    let child = layerd(&paths)
        .arg("--config")
        .arg(&paths.config)
        .args(["--log-level", "debug"])
        .spawn()
        .unwrap();
    let pid = Pid::from_raw(i32::try_from(child.id()).unwrap());

    let deadline = Instant::now() + Duration::from_secs(10);
    let connected = loop {
        if let Ok(stream) = UnixStream::connect(&paths.socket) {
            break Some(stream);
        }
        if Instant::now() > deadline {
            break None;
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    if connected.is_none() {
        let _ = kill(pid, Signal::SIGKILL);
        panic!("layerd never accepted on {}", paths.socket.display());
    }
    drop(connected);
    assert!(wait_for(&paths.root.join("metadata.json"), Duration::from_secs(1)));

    kill(pid, Signal::SIGINT).unwrap();
    let out = wait_with_timeout(child, Duration::from_secs(10));

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(out.status.success(), "{stderr}");
    assert!(stderr.contains("got SIGINT"), "{stderr}");
    assert!(stderr.contains("exiting"), "{stderr}");
}
