//! User and group resolution for privilege dropping.
//!
//! The supervisor switches a child's uid/gid directly in the spawn
//! primitive instead of going through `sudo`, so it needs numeric ids up
//! front.

use std::ffi::{CStr, CString};
use std::path::PathBuf;

/// Error returned when a user or group specification cannot be resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    UserNotFound(String),
    GroupNotFound(String),
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::UserNotFound(u) => write!(f, "user not found: {}", u),
            LookupError::GroupNotFound(g) => write!(f, "group not found: {}", g),
        }
    }
}

impl std::error::Error for LookupError {}

/// Numeric identity of a resolved user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
    /// Home directory from the passwd entry, when the user was looked up by name
    pub home: Option<PathBuf>,
}

/// Resolve a user specification to uid/gid.
///
/// Supported formats:
/// - `"username"` - looks up user by name
/// - `"1000"` - numeric uid (gid defaults to same value)
/// - `"1000:1000"` - explicit uid:gid
pub fn resolve_user(user: &str, group: Option<&str>) -> Result<ResolvedUser, LookupError> {
    let mut resolved = if let Some((uid_str, gid_str)) = user.split_once(':') {
        let uid = uid_str
            .parse::<u32>()
            .map_err(|_| LookupError::UserNotFound(user.to_string()))?;
        let gid = gid_str
            .parse::<u32>()
            .map_err(|_| LookupError::GroupNotFound(gid_str.to_string()))?;
        ResolvedUser { uid, gid, home: None }
    } else if let Ok(uid) = user.parse::<u32>() {
        ResolvedUser { uid, gid: uid, home: None }
    } else {
        lookup_user_by_name(user)?
    };

    if let Some(g) = group {
        resolved.gid = resolve_group(g)?;
    }

    Ok(resolved)
}

fn lookup_user_by_name(username: &str) -> Result<ResolvedUser, LookupError> {
    let c_username =
        CString::new(username).map_err(|_| LookupError::UserNotFound(username.to_string()))?;

    // SAFETY: getpwnam is a standard POSIX function. We pass a valid C string.
    // The returned pointer is either null or points to a static buffer, which
    // we copy out of before returning.
    unsafe {
        let pwd = libc::getpwnam(c_username.as_ptr());
        if pwd.is_null() {
            return Err(LookupError::UserNotFound(username.to_string()));
        }
        let home = if (*pwd).pw_dir.is_null() {
            None
        } else {
            Some(PathBuf::from(
                CStr::from_ptr((*pwd).pw_dir).to_string_lossy().into_owned(),
            ))
        };
        Ok(ResolvedUser {
            uid: (*pwd).pw_uid,
            gid: (*pwd).pw_gid,
            home,
        })
    }
}

/// Resolve a group specification (name or numeric gid) to a gid
pub fn resolve_group(group: &str) -> Result<u32, LookupError> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }

    let c_group =
        CString::new(group).map_err(|_| LookupError::GroupNotFound(group.to_string()))?;

    // SAFETY: getgrnam is a standard POSIX function. We pass a valid C string.
    unsafe {
        let grp = libc::getgrnam(c_group.as_ptr());
        if grp.is_null() {
            return Err(LookupError::GroupNotFound(group.to_string()));
        }
        Ok((*grp).gr_gid)
    }
}

/// Home directory of the user this process runs as, from the passwd
/// database rather than `$HOME`
pub fn current_user_home() -> Result<PathBuf, LookupError> {
    // SAFETY: getuid cannot fail. getpwuid returns null or a pointer to a
    // static buffer that is copied before returning.
    unsafe {
        let uid = libc::getuid();
        let pwd = libc::getpwuid(uid);
        if pwd.is_null() || (*pwd).pw_dir.is_null() {
            return Err(LookupError::UserNotFound(uid.to_string()));
        }
        Ok(PathBuf::from(
            CStr::from_ptr((*pwd).pw_dir).to_string_lossy().into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests;
