//! UID → account name resolution.

use kh_common::Account;
use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::{Arc, Mutex};

const MAX_PASSWD_BUF: usize = 1 << 20;

/// Look up the login name for `uid` in the password database.
pub fn username_for_uid(uid: u32) -> Option<String> {
    let mut buf: Vec<libc::c_char> = vec![0; 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    loop {
        let rc = unsafe {
            libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE && buf.len() < MAX_PASSWD_BUF {
            let len = buf.len() * 2;
            buf.resize(len, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        break;
    }

    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    name.to_str().ok().map(str::to_string)
}

/// Memoizing resolver shared by every handle of one enumeration.
///
/// Unknown UIDs resolve to their decimal string, so an account is always
/// attributable even when the password database has no entry for it.
#[derive(Debug, Clone, Default)]
pub struct UserCache {
    names: Arc<Mutex<HashMap<u32, Account>>>,
}

impl UserCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, uid: u32) -> Account {
        if let Ok(names) = self.names.lock() {
            if let Some(account) = names.get(&uid) {
                return account.clone();
            }
        }

        let account = Account::new(username_for_uid(uid).unwrap_or_else(|| uid.to_string()));
        if let Ok(mut names) = self.names.lock() {
            names.insert(uid, account.clone());
        }
        account
    }
}
