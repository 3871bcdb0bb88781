use std::{
    io::{self, BufRead, BufReader, Write},
    net::{Ipv4Addr, TcpListener, TcpStream},
    os::fd::AsRawFd,
    sync::{Arc, atomic::AtomicBool, atomic::Ordering},
};

use sluice::Runtime;
use tracing::{debug, info, warn};

use crate::{
    commands::handle,
    vsis::{Reply, Request, code, parse_line},
};

/// The VSI-S control socket: one line per command batch, one thread per
/// connected controller.
pub struct ControlServer {
    listener: TcpListener,
}

impl ControlServer {
    pub fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        info!(addr = %listener.local_addr()?, "control socket listening");
        Ok(Self { listener })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept controllers until `stop` flips. The accept is poll(2)-paced
    /// so the flag is honoured within a beat even with nobody connecting.
    pub fn serve(&self, rte: &Arc<Runtime>, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            match self.poll_accept() {
                Ok(None) => {}
                Ok(Some(stream)) => {
                    let peer = stream.peer_addr().map(|a| a.to_string());
                    debug!(?peer, "controller connected");
                    let rte = Arc::clone(rte);
                    std::thread::spawn(move || client_loop(stream, &rte));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(?err, "accept failed");
                }
            }
        }
    }

    fn poll_accept(&self) -> io::Result<Option<TcpStream>> {
        let mut pfd = libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, 250) };
        match n {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(None),
            _ => self.listener.accept().map(|(s, _)| Some(s)),
        }
    }
}

fn client_loop(stream: TcpStream, rte: &Arc<Runtime>) {
    let Ok(write_half) = stream.try_clone() else { return };
    let mut writer = write_half;
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(err) => {
                debug!(?err, "controller gone");
                return;
            }
        };
        let mut out = String::new();
        for parsed in parse_line(&line) {
            let reply = match parsed {
                Ok(req) => handle(&req, rte),
                Err(raw) => syntax_reply(&raw),
            };
            out.push_str(&reply.to_string());
        }
        if out.is_empty() {
            continue;
        }
        out.push('\n');
        if writer.write_all(out.as_bytes()).is_err() {
            return;
        }
    }
}

fn syntax_reply(raw: &str) -> Reply {
    let req = Request { name: raw.to_string(), query: false, args: Vec::new() };
    Reply::error(&req, code::SYNTAX, "malformed command")
}
