//! OS identity resolution.

use std::collections::HashMap;
use std::ffi::CString;

/// Resolves user names to OS uids.
pub trait IdentityResolver: Send + Sync {
    fn uid_from_name(&self, name: &str) -> Option<u32>;
}

/// Resolves through the system password database (`getpwnam_r`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemIdentity;

const MAX_PWBUF: usize = 1 << 20;

impl IdentityResolver for SystemIdentity {
    fn uid_from_name(&self, name: &str) -> Option<u32> {
        let cname = CString::new(name).ok()?;
        let mut buf: Vec<libc::c_char> = vec![0; 4096];
        loop {
            // SAFETY: `passwd` is plain old data; zeroed is a valid initial state.
            let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
            let mut result: *mut libc::passwd = std::ptr::null_mut();
            // SAFETY: every pointer references a live local buffer of the
            // stated length for the duration of the call.
            let rc = unsafe {
                libc::getpwnam_r(
                    cname.as_ptr(),
                    &mut pwd,
                    buf.as_mut_ptr(),
                    buf.len(),
                    &mut result,
                )
            };
            if rc == libc::ERANGE && buf.len() < MAX_PWBUF {
                let len = buf.len() * 2;
                buf.resize(len, 0);
                continue;
            }
            if rc != 0 || result.is_null() {
                return None;
            }
            return Some(pwd.pw_uid);
        }
    }
}

/// A fixed name -> uid table.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentity {
    uids: HashMap<String, u32>,
}

impl StaticIdentity {
    pub fn new<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, u32)>,
    {
        Self {
            uids: pairs
                .into_iter()
                .map(|(name, uid)| (name.to_string(), uid))
                .collect(),
        }
    }
}

impl IdentityResolver for StaticIdentity {
    fn uid_from_name(&self, name: &str) -> Option<u32> {
        self.uids.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_resolves_root() {
        assert_eq!(SystemIdentity.uid_from_name("root"), Some(0));
    }

    #[test]
    fn system_unknown_user_is_none() {
        assert_eq!(SystemIdentity.uid_from_name("no-such-user-fairgrid"), None);
        assert_eq!(SystemIdentity.uid_from_name("bad\0name"), None);
    }

    #[test]
    fn static_table() {
        let ids = StaticIdentity::new([("alice", 1001), ("bob", 1002)]);
        assert_eq!(ids.uid_from_name("bob"), Some(1002));
        assert_eq!(ids.uid_from_name("carol"), None);
    }
}
