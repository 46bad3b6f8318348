// src/daemon/ucrednet.rs

//! Peer credentials
//!
//! The accept loop reads SO_PEERCRED off each connection and stamps the
//! request with a remote-address string, `pid=<p>;uid=<u>;socket=<path>;`.
//! The extractor parses that string back; absent or unparseable encodings
//! mean the request is treated as unauthenticated.

/// Remote-address string attached to every request as an extension
#[derive(Debug, Clone)]
pub struct RemoteAddr(pub String);

/// Parsed peer identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ucred {
    pub pid: u32,
    pub uid: u32,
    /// Path of the socket the connection arrived on
    pub socket: String,
}

/// Encode peer credentials into the remote-address form
pub fn encode(pid: u32, uid: u32, socket: &str) -> String {
    format!("pid={};uid={};socket={};", pid, uid, socket)
}

/// Parse a remote-address string; `None` means unauthenticated
pub fn parse(addr: &str) -> Option<Ucred> {
    let mut pid = None;
    let mut uid = None;
    let mut socket = String::new();
    for field in addr.split(';') {
        if let Some(value) = field.strip_prefix("pid=") {
            pid = value.parse().ok();
        } else if let Some(value) = field.strip_prefix("uid=") {
            uid = value.parse().ok();
        } else if let Some(value) = field.strip_prefix("socket=") {
            socket = value.to_string();
        }
    }
    Some(Ucred {
        pid: pid?,
        uid: uid?,
        socket,
    })
}

/// Read SO_PEERCRED off a unix-socket connection
#[cfg(unix)]
pub fn peer_credentials(stream: &tokio::net::UnixStream) -> Option<(u32, u32)> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();

    unsafe {
        let mut cred: libc::ucred = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        );

        if result == 0 {
            Some((cred.pid as u32, cred.uid))
        } else {
            None
        }
    }
}

#[cfg(not(unix))]
pub fn peer_credentials(_stream: &tokio::net::UnixStream) -> Option<(u32, u32)> {
    None
}
