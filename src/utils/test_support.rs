/// Returns true when the sandbox refuses loopback sockets, so mock-server tests skip.
pub fn should_skip_httpmock() -> bool {
    if loopback_bindable() {
        return false;
    }
    eprintln!("skipping mock server test: binding 127.0.0.1 is not permitted");
    true
}

fn loopback_bindable() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_) => true,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(err) => panic!("failed to bind loopback for mock server tests: {err}"),
    }
}
