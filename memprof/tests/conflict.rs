//! SIGPROF must belong to the sampler alone.

use memprof::{AttachError, Config};

extern "C" fn foreign_handler(_: libc::c_int) {}

fn set_sigprof(handler: libc::sighandler_t) {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        libc::sigemptyset(&mut action.sa_mask);
        assert_eq!(libc::sigaction(libc::SIGPROF, &action, std::ptr::null_mut()), 0);
    }
}

#[test]
fn foreign_sigprof_handler_is_refused() {
    set_sigprof(foreign_handler as extern "C" fn(libc::c_int) as libc::sighandler_t);
    let result = memprof::attach(&Config::default());
    set_sigprof(libc::SIG_DFL);

    assert!(matches!(result, Err(AttachError::HandlerConflict)));
    // The failed attempt left nothing behind.
    assert!(matches!(memprof::detach(), Err(AttachError::NotAttached)));
    memprof::attach(&Config::default()).unwrap();
    memprof::detach().unwrap();
}
