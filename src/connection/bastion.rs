//! Jump-host tunnelling: the target session speaks SSH over one end of a
//! local socket pair while a proxy thread shuttles bytes between the other
//! end and a `direct-tcpip` channel on the bastion session.

use super::session::map_ssh_error;
use crate::constants::network::POLL_INTERVAL_MS;
use crate::errors::RemoteError;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) struct BastionTunnel {
    _session: ssh2::Session,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for BastionTunnel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub(crate) fn open_tunnel(
    bastion: ssh2::Session,
    host: &str,
    port: u16,
) -> Result<(UnixStream, BastionTunnel), RemoteError> {
    let channel = bastion
        .channel_direct_tcpip(host, port, None)
        .map_err(|err| map_ssh_error(err).context(format!("bastion tunnel to {}:{}", host, port)))?;
    let (local, proxied) = UnixStream::pair()?;
    proxied.set_nonblocking(true)?;
    bastion.set_blocking(false);

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let handle = std::thread::Builder::new()
        .name("ssh-bastion-proxy".to_string())
        .spawn(move || pump(channel, proxied, flag))?;

    Ok((
        local,
        BastionTunnel {
            _session: bastion,
            stop,
            handle: Some(handle),
        },
    ))
}

fn pump(mut channel: ssh2::Channel, mut socket: UnixStream, stop: Arc<AtomicBool>) {
    let mut upstream: Vec<u8> = Vec::new();
    let mut downstream: Vec<u8> = Vec::new();
    let mut buf = [0u8; 16384];
    let mut socket_open = true;

    while !stop.load(Ordering::SeqCst) {
        let mut progressed = false;

        if socket_open && upstream.is_empty() {
            match socket.read(&mut buf) {
                Ok(0) => {
                    socket_open = false;
                    let _ = channel.send_eof();
                }
                Ok(n) => {
                    upstream.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(err) if err.kind() == IoErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }
        if !upstream.is_empty() {
            match channel.write(&upstream) {
                Ok(n) => {
                    upstream.drain(..n);
                    progressed |= n > 0;
                }
                Err(err) if err.kind() == IoErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }

        if downstream.is_empty() {
            match channel.read(&mut buf) {
                Ok(0) => {
                    if channel.eof() {
                        break;
                    }
                }
                Ok(n) => {
                    downstream.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(err) if err.kind() == IoErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }
        if !downstream.is_empty() {
            match socket.write(&downstream) {
                Ok(n) => {
                    downstream.drain(..n);
                    progressed |= n > 0;
                }
                Err(err) if err.kind() == IoErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }

        if !progressed {
            std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
        }
    }
    let _ = channel.close();
}
