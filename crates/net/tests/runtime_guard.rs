use std::time::Duration;

use tether::{AuthorityHost, NetError, PeerHost, Runtime};

// Kept in its own binary: the guard count is process-wide, so this must not
// share a process with tests that hold their own guards.
#[test]
fn hosts_require_a_live_runtime_guard() {
    assert!(matches!(
        AuthorityHost::bind(0, 4),
        Err(NetError::NotInitialized)
    ));
    assert!(matches!(
        PeerHost::connect("127.0.0.1", 9, Duration::from_millis(10)),
        Err(NetError::NotInitialized)
    ));

    let outer = Runtime::init();
    assert!(AuthorityHost::bind(0, 4).is_ok());

    // independent call sites may hold their own guards; the runtime stays
    // up until the last one drops
    let inner = Runtime::init();
    drop(outer);
    assert!(AuthorityHost::bind(0, 4).is_ok());
    drop(inner);

    assert!(matches!(
        AuthorityHost::bind(0, 4),
        Err(NetError::NotInitialized)
    ));
}
