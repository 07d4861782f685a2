use super::*;

#[test]
fn resolve_numeric_uid() {
    let user = resolve_user("1000", None).unwrap();
    assert_eq!(user.uid, 1000);
    assert_eq!(user.gid, 1000);
    assert_eq!(user.home, None);
}

#[test]
fn resolve_uid_gid_pair() {
    let user = resolve_user("1000:2000", None).unwrap();
    assert_eq!((user.uid, user.gid), (1000, 2000));
}

#[test]
fn group_override() {
    let user = resolve_user("1000", Some("2000")).unwrap();
    assert_eq!((user.uid, user.gid), (1000, 2000));
}

#[test]
fn resolve_root_by_name() {
    let user = resolve_user("root", None).unwrap();
    assert_eq!(user.uid, 0);
    assert!(user.home.is_some());
}

#[test]
fn nonexistent_user() {
    assert_eq!(
        resolve_user("nonexistent_user_12345", None),
        Err(LookupError::UserNotFound("nonexistent_user_12345".to_string()))
    );
}

#[test]
fn bad_gid_in_pair() {
    assert!(matches!(
        resolve_user("1000:abc", None),
        Err(LookupError::GroupNotFound(_))
    ));
}

#[test]
fn current_user_has_a_home() {
    let home = current_user_home().unwrap();
    assert!(home.is_absolute());
}
