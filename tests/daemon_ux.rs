#[cfg(unix)]
mod unix_tests {
    // Ensures daemon UX parity: creates a log file promptly and exits
    // cleanly on Ctrl+C (SIGINT), even with no reachable remote endpoint.
    use std::process::Command;
    use std::time::{Duration, Instant};

    fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut f: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn daemon_creates_log_and_exits_on_sigint() {
        let home = std::env::temp_dir().join("icloudds-daemon-ux-home");
        let _ = std::fs::remove_dir_all(&home);
        std::fs::create_dir_all(&home).unwrap();
        let data_dir = home.join("Synced");
        std::fs::create_dir_all(&data_dir).unwrap();

        let exe = env!("CARGO_BIN_EXE_icloudds");
        let mut child = Command::new(exe)
            .env("HOME", &home)
            .arg("-d")
            .arg(&data_dir)
            .arg("-u")
            .arg("alice@example.com")
            .spawn()
            .expect("spawn daemon");

        let log_path = home.join(".icloudds").join("icloudds.log");
        let saw_start = wait_for(Duration::from_secs(5), || {
            std::fs::read_to_string(&log_path)
                .ok()
                .map(|s| s.contains("daemon start"))
                .unwrap_or(false)
        });
        assert!(saw_start, "expected daemon start line in log");

        let pid = child.id();
        let status = Command::new("kill")
            .arg("-INT")
            .arg(pid.to_string())
            .status()
            .expect("send SIGINT");
        assert!(status.success());

        let exited = wait_for(Duration::from_secs(5), || {
            child.try_wait().ok().flatten().is_some()
        });
        if !exited {
            let _ = Command::new("kill").arg("-KILL").arg(pid.to_string()).status();
            panic!("daemon did not exit after SIGINT");
        }
        let st = child.wait().unwrap();
        assert!(st.success());

        std::fs::remove_dir_all(&home).ok();
    }

    #[test]
    fn daemon_rejects_a_directory_that_does_not_exist() {
        let home = std::env::temp_dir().join("icloudds-daemon-ux-missing-dir");
        let _ = std::fs::remove_dir_all(&home);
        std::fs::create_dir_all(&home).unwrap();
        let missing = home.join("does-not-exist");

        let exe = env!("CARGO_BIN_EXE_icloudds");
        let output = Command::new(exe)
            .env("HOME", &home)
            .arg("-d")
            .arg(&missing)
            .arg("-u")
            .arg("alice@example.com")
            .output()
            .expect("run daemon");

        assert_eq!(output.status.code(), Some(2));
        std::fs::remove_dir_all(&home).ok();
    }
}
