use super::*;

#[test]
fn test_dedup_first_wins() {
    let env = dedup_env(["K=b", "PATH=/bin", "K=a", "JUNK", "=x"]);
    assert_eq!(
        env,
        vec![
            ("K".to_string(), "b".to_string()),
            ("PATH".to_string(), "/bin".to_string()),
        ]
    );
}

#[test]
fn test_dedup_keeps_equals_in_value() {
    let env = dedup_env(["OPTS=a=b=c"]);
    assert_eq!(env[0].1, "a=b=c");
}

#[test]
fn test_clean_drops_prefixed_entries() {
    let mut env = Environ::from_entries([
        "FLOTILLA_CONFIG=/old",
        "GEM_HOME=/gems",
        "GEM_HOMEWORK=keep",
        "HOME=/root",
    ]);
    env.clean(&[RESERVED_PREFIX, "GEM_HOME="]);
    assert_eq!(env.entries(), ["GEM_HOMEWORK=keep", "HOME=/root"]);
}

#[test]
fn test_set_replaces_in_place() {
    let mut env = Environ::from_entries(["A=1", "B=2"]);
    env.set("A", "3");
    env.set("C", "4");
    assert_eq!(env.entries(), ["A=3", "B=2", "C=4"]);
}

#[test]
fn test_set_does_not_match_longer_names() {
    let mut env = Environ::from_entries(["PATHEXT=x"]);
    env.set("PATH", "/bin");
    assert_eq!(env.get("PATHEXT"), Some("x"));
    assert_eq!(env.get("PATH"), Some("/bin"));
}

#[test]
fn test_prepend() {
    let mut env = Environ::from_entries(["PATH=/usr/bin"]);
    env.prepend("PATH", "/opt/bin:");
    assert_eq!(env.get("PATH"), Some("/opt/bin:/usr/bin"));

    env.prepend("GOPATH", "/go");
    assert_eq!(env.get("GOPATH"), Some("/go"));
}

#[test]
fn test_look_path_uses_own_path() {
    let tmp = tempfile::tempdir().unwrap();
    let prog = tmp.path().join("frobnicate");
    std::fs::write(&prog, "#!/bin/sh\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&prog, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let env = Environ::from_entries([format!("PATH={}", tmp.path().display())]);
    assert_eq!(env.look_path("frobnicate", tmp.path()), Some(prog));
    assert_eq!(env.look_path("no-such-program-here", tmp.path()), None);
    assert_eq!(
        env.look_path("./relative/prog", tmp.path()),
        Some(PathBuf::from("./relative/prog"))
    );
}
