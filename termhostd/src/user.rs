use std::{env, ffi::CStr, io, ptr};

use anyhow::anyhow;

#[derive(Debug)]
pub struct Info {
    pub home_dir: String,
}

/// Resolves the invoking user's home directory, preferring `$HOME` (set in
/// essentially every environment the daemon runs in) and falling back to a
/// `getpwuid_r` lookup the way the teacher's `user::info` always does, so a
/// stripped-down environment (e.g. a systemd unit with no `$HOME`) still
/// works.
pub fn info() -> anyhow::Result<Info> {
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            return Ok(Info { home_dir: home });
        }
    }

    let mut passwd_str_buf: [libc::c_char; 1024 * 4] = [0; 1024 * 4];
    let mut passwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut passwd_res_ptr: *mut libc::passwd = ptr::null_mut();
    unsafe {
        // Safety: passwd and passwd_str_buf are both correctly sized, owned
        // buffers for the duration of the call.
        let errno = libc::getpwuid_r(
            libc::getuid(),
            &mut passwd,
            passwd_str_buf.as_mut_ptr(),
            passwd_str_buf.len(),
            &mut passwd_res_ptr as *mut *mut libc::passwd,
        );
        if passwd_res_ptr.is_null() {
            if errno == 0 {
                return Err(anyhow!("could not find current user, should be impossible"));
            }
            return Err(anyhow!(
                "error resolving user info: {}",
                io::Error::from_raw_os_error(errno)
            ));
        }

        // Safety: pw_dir is a valid, NUL-terminated cstring for the lifetime
        // of `passwd`.
        Ok(Info {
            home_dir: String::from(String::from_utf8_lossy(
                CStr::from_ptr(passwd.pw_dir).to_bytes(),
            )),
        })
    }
}
