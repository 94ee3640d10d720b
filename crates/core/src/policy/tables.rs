//! Built-in allow and deny lists.

/// Base commands an agent may run.
pub const DEFAULT_ALLOW: &[&str] = &[
    // interpreters and language tooling
    "python", "python3", "pip", "pip3", "pytest", "black", "ruff", "flake8", "mypy",
    "pip-audit", "node", "npm", "npx", "yarn", "pnpm", "tsc", "eslint", "prettier", "jest",
    "ruby", "perl", "php", "go", "gofmt", "cargo", "rustc", "rustfmt", "javac", "java",
    "mvn", "mvnw", "gradle", "gradlew", "dotnet", "gcc", "g++", "cc", "clang", "make",
    "cmake",
    // version control
    "git",
    // read-mostly file utilities
    "ls", "cat", "echo", "printf", "pwd", "head", "tail", "wc", "grep", "find", "sort",
    "uniq", "diff", "cut", "tr", "tee", "basename", "dirname", "stat", "file", "du",
    "tree", "sha256sum", "md5sum", "date", "printenv", "which", "true", "false", "sleep", "test",
    // in-workspace mutations
    "mkdir", "touch", "cp", "mv", "chmod", "sed",
];

/// Base commands that are never run, whatever the allow-list says.
pub const DEFAULT_DENY: &[&str] = &[
    // destructive
    "rm", "rmdir", "shred", "dd", "mkfs", "fdisk", "parted", "wipefs", "truncate",
    // system control
    "mount", "umount", "shutdown", "reboot", "halt", "poweroff", "init", "systemctl",
    "service", "crontab", "at", "iptables", "nft", "sysctl", "modprobe", "insmod",
    // process control
    "kill", "killall", "pkill", "nohup", "setsid", "disown",
    // privilege
    "sudo", "su", "doas", "chown", "chgrp", "useradd", "userdel", "usermod", "passwd",
    // network
    "curl", "wget", "nc", "ncat", "netcat", "ssh", "scp", "sftp", "telnet", "ftp", "rsync",
    // shells and indirection
    "bash", "sh", "zsh", "fish", "ksh", "csh", "tcsh", "dash", "eval", "exec", "source",
    "env", "xargs", "awk", "nsenter", "chroot", "unshare",
    // containers
    "docker", "podman", "kubectl",
];
