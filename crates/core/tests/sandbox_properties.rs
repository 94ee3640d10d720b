use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tempfile::TempDir;
use warden_core::runner::TRUNCATION_MARKER;
use warden_core::{
    CommandPolicy, ExecOptions, PathValidator, Sandbox, SandboxConfig, SandboxError,
    WorkspaceSettings,
};

fn sandbox(base: &TempDir) -> Sandbox {
    let config = SandboxConfig {
        workspace_base: base.path().to_path_buf(),
        ..SandboxConfig::default()
    };
    Sandbox::new(config).expect("build sandbox")
}

fn timeout(secs: u64) -> ExecOptions {
    ExecOptions {
        timeout_secs: Some(secs),
        ..ExecOptions::default()
    }
}

#[test]
fn resolved_paths_never_leave_the_root() {
    let temp = TempDir::new().expect("create root");
    let root = temp.path().canonicalize().expect("canonical root");
    fs::create_dir_all(root.join("a/b")).expect("create nested dirs");
    let validator = PathValidator::default();

    let candidates = [
        "a/b/../c.txt",
        "./a/./b",
        "a/../../escape",
        "../../etc/passwd",
        "/etc/passwd",
        "a/b/../../..",
        "new/file.txt",
    ];
    for candidate in candidates {
        if let Ok(resolved) = validator.resolve(&root, candidate) {
            assert!(
                resolved.starts_with(&root),
                "{} resolved outside: {}",
                candidate,
                resolved.display()
            );
        }
    }

    let err = validator
        .resolve(&root, "../../etc/passwd")
        .expect_err("traversal should fail");
    assert!(matches!(err, SandboxError::Security { .. }));
    assert!(err.to_string().contains("traversal"));
}

#[cfg(unix)]
#[test]
fn symlink_out_of_the_workspace_is_rejected() {
    let outside = TempDir::new().expect("create outside dir");
    let temp = TempDir::new().expect("create root");
    std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).expect("create symlink");

    let err = PathValidator::default()
        .resolve(temp.path(), "link/secret.txt")
        .expect_err("symlink escape should fail");
    assert!(err.is_security());
}

#[cfg(unix)]
#[test]
fn parent_of_a_symlink_is_the_targets_parent() {
    let base = TempDir::new().expect("create base");
    let outside = TempDir::new().expect("create outside dir");
    fs::create_dir(outside.path().join("inner")).expect("create inner");
    fs::write(outside.path().join("secret.txt"), "TOPSECRET\n").expect("write secret");
    let sandbox = sandbox(&base);
    let ws = sandbox.create_workspace(Some("ws"), None, None).expect("create workspace");
    std::os::unix::fs::symlink(outside.path().join("inner"), ws.root_path.join("link"))
        .expect("create symlink");

    let verdict = sandbox
        .validate_command("ws", "cat link/../secret.txt")
        .expect("validate");
    assert!(!verdict.allowed);
    let err = sandbox
        .execute_command("ws", "cat link/../secret.txt", timeout(5))
        .expect_err("escape must be denied");
    assert!(err.is_security());
}

#[test]
fn deny_list_wins_over_allow_list() {
    let base = TempDir::new().expect("create base");
    let mut config = SandboxConfig {
        workspace_base: base.path().to_path_buf(),
        ..SandboxConfig::default()
    };
    config.policy.allow = vec!["rm".into(), "curl".into()];
    let sandbox = Sandbox::new(config).expect("build sandbox");
    sandbox.create_workspace(Some("ws"), None, None).expect("create workspace");

    for command in ["rm notes.txt", "curl https://example.com"] {
        let verdict = sandbox.validate_command("ws", command).expect("validate");
        assert!(!verdict.allowed, "{} should stay denied", command);
    }
    assert!(sandbox.policy().is_denied("rm"));
    assert!(!sandbox.policy().is_allowed("rm"));
}

#[test]
fn policy_file_extends_defaults() {
    let dir = TempDir::new().expect("create dir");
    let path = dir.path().join("policy.toml");
    fs::write(
        &path,
        "[policy]\nallow = [\"deno\"]\ndeny = [\"git\"]\nextra_patterns = [\"--danger\"]\n",
    )
    .expect("write policy");
    let policy = CommandPolicy::load_toml(&path).expect("load policy");
    assert!(policy.is_allowed("deno"));
    assert!(!policy.is_allowed("git"));
    assert!(policy.is_allowed("python3"));
}

#[test]
fn forbidden_command_is_denied_without_spawning() {
    let base = TempDir::new().expect("create base");
    let sandbox = sandbox(&base);
    let ws = sandbox.create_workspace(Some("ws"), None, None).expect("create workspace");
    fs::write(ws.root_path.join("keep.txt"), "still here").expect("write file");

    let err = sandbox
        .execute_command("ws", "rm -rf /", timeout(5))
        .expect_err("rm must be denied");
    assert!(err.is_security());
    assert!(err.to_string().contains("forbidden"));
    assert!(ws.root_path.join("keep.txt").exists());
}

#[test]
fn oversized_write_leaves_nothing_behind() {
    let base = TempDir::new().expect("create base");
    let sandbox = sandbox(&base);
    let settings = WorkspaceSettings {
        max_file_size: Some(16),
        ..WorkspaceSettings::default()
    };
    let ws = sandbox
        .create_workspace(Some("ws"), None, Some(settings))
        .expect("create workspace");

    let err = sandbox
        .write_file("ws", "big.txt", &"x".repeat(17))
        .expect_err("oversized write should fail");
    assert!(matches!(err, SandboxError::FileTooLarge { size: 17, limit: 16, .. }));
    assert!(!ws.root_path.join("big.txt").exists());
    let leftovers: Vec<_> = fs::read_dir(&ws.root_path)
        .expect("read workspace")
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    collect_files(root)
        .into_iter()
        .filter(|(rel, _)| !rel.starts_with(".archive"))
        .collect()
}

fn collect_files(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).expect("read dir").filter_map(Result::ok) {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path
                    .strip_prefix(root)
                    .expect("inside root")
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push((rel, fs::read(&path).expect("read file")));
            }
        }
    }
    out
}

#[test]
fn archive_then_restore_reproduces_files_minus_temp() {
    let base = TempDir::new().expect("create base");
    let sandbox = sandbox(&base);
    let ws = sandbox
        .create_workspace(Some("ws"), Some("python".parse().expect("template")), None)
        .expect("create workspace");
    sandbox
        .write_file("ws", "src/app.py", "print('v1')\n")
        .expect("write app");
    sandbox
        .write_file("ws", "src/__pycache__/app.cpython-311.pyc", "bytecode")
        .expect("write cache");
    sandbox.write_file("ws", "scratch.tmp", "junk").expect("write temp");

    let manifest = sandbox
        .archive_session_work("ws", Some("s1"), true)
        .expect("archive");
    assert_eq!(manifest.session_id, "s1");
    assert_eq!(manifest.temp_files_removed, 2);
    assert!(ws.root_path.join(".archive/s1/session_summary.json").is_file());
    let archived = snapshot(&ws.root_path);

    sandbox
        .write_file("ws", "src/app.py", "print('v2')\n")
        .expect("modify app");
    sandbox.delete_file("ws", "main.py").expect("delete main");

    let restored = sandbox.restore_session("ws", "s1").expect("restore");
    assert_eq!(restored.files.len(), manifest.files_archived);
    assert_eq!(snapshot(&ws.root_path), archived);
    assert_eq!(
        sandbox.read_file("ws", "src/app.py").expect("read app"),
        "print('v1')\n"
    );
}

#[cfg(unix)]
#[test]
fn restore_never_writes_through_a_planted_symlink() {
    let base = TempDir::new().expect("create base");
    let outside = TempDir::new().expect("create outside dir");
    let sandbox = sandbox(&base);
    let ws = sandbox.create_workspace(Some("ws"), None, None).expect("create workspace");
    sandbox
        .write_file("ws", "data/results.csv", "a,b\n")
        .expect("write results");
    sandbox
        .archive_session_work("ws", Some("s1"), false)
        .expect("archive");

    fs::remove_dir_all(ws.root_path.join("data")).expect("remove data");
    std::os::unix::fs::symlink(outside.path(), ws.root_path.join("data")).expect("plant symlink");

    let err = sandbox
        .restore_session("ws", "s1")
        .expect_err("restore through symlink should fail");
    assert!(err.is_security());
    assert!(!outside.path().join("results.csv").exists());
}

#[test]
fn cleanup_twice_is_fine() {
    let base = TempDir::new().expect("create base");
    let sandbox = sandbox(&base);
    let ws = sandbox.create_workspace(None, None, None).expect("create workspace");
    assert!(sandbox.cleanup_workspace(&ws.id));
    assert!(sandbox.cleanup_workspace(&ws.id));
    assert!(!ws.root_path.exists());
    assert!(sandbox.get_workspace(&ws.id).is_err());
    assert!(sandbox
        .create_workspace(Some(ws.id.as_str()), None, None)
        .is_ok());
}

#[cfg(unix)]
mod processes {
    use super::*;
    use std::time::Instant;
    use warden_common::process_utils::process_alive;

    #[test]
    fn echo_hello() {
        let base = TempDir::new().expect("create base");
        let sandbox = sandbox(&base);
        sandbox.create_workspace(Some("ws"), None, None).expect("create workspace");

        let result = sandbox
            .execute_command("ws", "echo hello", timeout(5))
            .expect("run echo");
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hello\n");
        assert!(!result.timed_out);
    }

    #[test]
    fn sleep_is_killed_at_the_deadline() {
        let base = TempDir::new().expect("create base");
        let sandbox = sandbox(&base);
        sandbox.create_workspace(Some("ws"), None, None).expect("create workspace");

        let started = Instant::now();
        let result = sandbox
            .execute_command("ws", "sleep 100", timeout(1))
            .expect("run sleep");
        assert!(started.elapsed().as_secs_f64() < 5.0);
        assert!(result.timed_out);
        assert!(!result.success);
        assert!(result.stderr.contains("timed out after 1 seconds"));
        let pid = result.pid.expect("pid recorded");
        assert!(!process_alive(pid));
    }

    #[test]
    fn no_descendant_outlives_a_timed_out_script() {
        let base = TempDir::new().expect("create base");
        let sandbox = sandbox(&base);
        let ws = sandbox.create_workspace(Some("ws"), None, None).expect("create workspace");

        let script = "sh -c 'sleep 100' &\necho $! > grandchild.pid\nsleep 100\n";
        let started = Instant::now();
        let result = sandbox
            .execute_script("ws", script, Some("sh"), Some(1))
            .expect("run script");
        assert!(started.elapsed().as_secs_f64() < 5.0);
        assert!(result.timed_out);

        let grandchild: u32 = fs::read_to_string(ws.root_path.join("grandchild.pid"))
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        assert!(!process_alive(grandchild));
        assert!(!process_alive(result.pid.expect("pid recorded")));
    }

    #[test]
    fn multi_byte_output_stays_within_the_cap() {
        let base = TempDir::new().expect("create base");
        let sandbox = sandbox(&base);
        let settings = WorkspaceSettings {
            max_output_size: Some(4),
            ..WorkspaceSettings::default()
        };
        sandbox
            .create_workspace(Some("ws"), None, Some(settings))
            .expect("create workspace");
        sandbox
            .write_file("ws", "utf8.txt", "aaa\u{e9}\u{20ac}\u{20ac}\u{20ac}")
            .expect("write file");

        let result = sandbox
            .execute_command("ws", "cat utf8.txt", timeout(5))
            .expect("run cat");
        assert!(result.truncated);
        let body = result
            .stdout
            .strip_suffix(TRUNCATION_MARKER)
            .expect("marker present");
        assert!(body.len() <= 4);
        assert_eq!(body, "aaa");
    }

    #[test]
    fn output_is_capped_with_marker() {
        let base = TempDir::new().expect("create base");
        let sandbox = sandbox(&base);
        let settings = WorkspaceSettings {
            max_output_size: Some(1000),
            ..WorkspaceSettings::default()
        };
        sandbox
            .create_workspace(Some("ws"), None, Some(settings))
            .expect("create workspace");

        for _ in 0..2 {
            let result = sandbox
                .execute_command("ws", "printf %05000d 0", timeout(5))
                .expect("run printf");
            assert!(result.truncated);
            assert_eq!(result.stdout, format!("{}{}", "0".repeat(1000), TRUNCATION_MARKER));
        }
    }

    #[test]
    fn shell_script_is_staged_and_removed() {
        let base = TempDir::new().expect("create base");
        let sandbox = sandbox(&base);
        let ws = sandbox.create_workspace(Some("ws"), None, None).expect("create workspace");

        let result = sandbox
            .execute_script("ws", "echo from-script\n", Some("sh"), Some(5))
            .expect("run script");
        assert!(result.success, "{:?}", result);
        assert_eq!(result.stdout, "from-script\n");

        let leftovers: Vec<_> = fs::read_dir(&ws.root_path)
            .expect("read workspace")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("warden_script_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn environment_is_scrubbed() {
        let base = TempDir::new().expect("create base");
        let sandbox = sandbox(&base);
        let ws = sandbox.create_workspace(Some("ws"), None, None).expect("create workspace");

        let mut env_vars = BTreeMap::new();
        env_vars.insert("APP_MODE".to_string(), "test".to_string());
        env_vars.insert("PATH".to_string(), "/tmp/evil".to_string());
        let result = sandbox
            .execute_command(
                "ws",
                "printenv",
                ExecOptions {
                    env_vars,
                    ..timeout(5)
                },
            )
            .expect("run printenv");
        assert!(result.stdout.contains("APP_MODE=test"));
        assert!(!result.stdout.contains("/tmp/evil"));
        assert!(result
            .stdout
            .contains(&format!("HOME={}", ws.root_path.join(".home").display())));
    }
}
